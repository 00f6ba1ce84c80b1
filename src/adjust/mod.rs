//! The adjustment engine: iterative Gauss-Newton weighted least squares
//! over the parsed network.
//!
//! Parameters are the free station components (E, N, H in that order,
//! stations in insertion order) followed by one orientation per direction
//! set. Each iteration assembles the design matrix, misclosure vector and
//! weight matrix from the shared linearization in [`rows`], forms the
//! normal equations, solves by Gauss-Jordan and applies the corrections,
//! until the largest correction drops under the convergence threshold.
//!
//! The engine takes ownership of the network and always returns a
//! completed [`AdjustmentResult`]; every failure mode (negative
//! redundancy, singular normals, divergence) is reported through the
//! result's flags and logs rather than an error.

mod diagnostics;
mod rows;
mod statistics;

pub use diagnostics::{
    SetDiagnostics, SetupDiagnostics, SideshotResult, TargetDiagnostics, TraverseDiagnostics,
};
pub use statistics::{ChiSquareTest, ConstraintSummary, RelativePrecision, TypeSummary};

use crate::linalg::Matrix;
use crate::observation::Observation;
use crate::parser::{DirectionSet, Network};
use crate::station::StationMap;
use log::{info, warn};
use rows::{Linearizer, Weight};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Condition estimates above this trip a single warning
const CONDITION_LIMIT: f64 = 1e12;

/// Critical value of the local (data snooping) test, ~99.9% two sided
pub const LOCAL_TEST_CRITICAL: f64 = 3.29;

#[derive(Debug, Clone)]
pub struct AdjustOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the largest absolute correction
    pub convergence: f64,
    /// Observation ids to leave out of the solution
    pub exclude: BTreeSet<usize>,
}

impl Default for AdjustOptions {
    fn default() -> AdjustOptions {
        AdjustOptions {
            max_iterations: 10,
            convergence: 1e-4,
            exclude: BTreeSet::new(),
        }
    }
}

/// Everything the adjustment produces. `converged` is the headline;
/// `logs` explains anything that went sideways.
#[derive(Debug)]
pub struct AdjustmentResult {
    pub id: Uuid,
    pub success: bool,
    pub converged: bool,
    pub iterations: usize,
    pub stations: StationMap,
    pub observations: Vec<Observation>,
    pub sets: Vec<DirectionSet>,
    pub logs: Vec<String>,
    pub seuw: f64,
    pub dof: i64,
    pub num_params: usize,
    pub num_equations: usize,
    pub chi_square: Option<ChiSquareTest>,
    pub condition: f64,
    pub constraints: Vec<ConstraintSummary>,
    pub type_summary: Vec<TypeSummary>,
    pub relative_precision: Vec<RelativePrecision>,
    pub set_diagnostics: Vec<SetDiagnostics>,
    pub target_diagnostics: Vec<TargetDiagnostics>,
    pub setup_diagnostics: Vec<SetupDiagnostics>,
    pub traverse: Option<TraverseDiagnostics>,
    pub sideshots: Vec<SideshotResult>,
}

/// Parameter slots of one station
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StationParams {
    pub e: Option<usize>,
    pub n: Option<usize>,
    pub h: Option<usize>,
}

/// The parameter vector layout: free station components in station
/// insertion order (E, N, H), then one orientation per direction set in
/// first-seen order.
#[derive(Debug, Clone)]
pub(crate) struct ParamIndex {
    stations: HashMap<String, StationParams>,
    orientations: HashMap<String, usize>,
    pub count: usize,
}

impl ParamIndex {
    pub fn build(net: &Network) -> ParamIndex {
        let two_d = net.state.two_d();
        let mut stations = HashMap::new();
        let mut count = 0;

        for station in net.stations.iter() {
            let mut params = StationParams::default();
            if !station.fixed_e {
                params.e = Some(count);
                count += 1;
            }
            if !station.fixed_n {
                params.n = Some(count);
                count += 1;
            }
            if !two_d && !station.fixed_h {
                params.h = Some(count);
                count += 1;
            }
            stations.insert(station.id.clone(), params);
        }

        let mut orientations = HashMap::new();
        for set in &net.sets {
            orientations.insert(set.id.clone(), count);
            count += 1;
        }

        ParamIndex {
            stations,
            orientations,
            count,
        }
    }

    pub fn station(&self, id: &str) -> StationParams {
        self.stations.get(id).copied().unwrap_or_default()
    }

    pub fn orientation(&self, set: &str) -> Option<usize> {
        self.orientations.get(set).copied()
    }
}

// One weighted control constraint row
#[derive(Debug, Clone)]
pub(crate) struct ConstraintRow {
    pub station: String,
    pub component: char,
    pub param: usize,
    pub target: f64,
    pub sigma: f64,
}

/// Run the adjustment. Consumes the network; the adjusted stations,
/// observations and diagnostics come back in the result.
#[must_use]
pub fn adjust(mut net: Network, options: AdjustOptions) -> AdjustmentResult {
    let id = Uuid::new_v4();
    let two_d = net.state.two_d();

    // Active observations: not excluded, not sideshots, and no vertical
    // kinds in a 2D adjustment
    let mut active: Vec<usize> = net
        .observations
        .iter()
        .filter(|o| !o.sideshot && !options.exclude.contains(&o.id))
        .filter(|o| !(two_d && o.kind.is_vertical()))
        .map(|o| o.id)
        .collect();

    for station in net.stations.iter() {
        if !station.has_coords {
            let sid = &station.id;
            warn!("station {sid} has no approximate coordinates");
        }
    }

    // In 3D, a free height nothing vertical touches would make the
    // normals singular; hold it instead
    if !two_d {
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for &oid in &active {
            let obs = &net.observations[oid];
            if obs.kind.is_vertical() {
                for s in obs.kind.stations() {
                    touched.insert(s.to_string());
                }
            }
        }
        let mut dropped = Vec::new();
        for station in net.stations.iter_mut() {
            if !station.fixed_h && station.constraint_h.is_none() && !touched.contains(&station.id)
            {
                station.fixed_h = true;
                dropped.push(station.id.clone());
            }
        }
        for sid in dropped {
            net.log(format!(
                "station {sid} has no vertical observation; holding its height fixed"
            ));
        }
    }

    // Same guard for planar components: a station seen only by leveling
    // contributes zero columns for E and N
    {
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for &oid in &active {
            let obs = &net.observations[oid];
            if !matches!(obs.kind, crate::observation::ObsKind::LevelDiff { .. }) {
                for s in obs.kind.stations() {
                    touched.insert(s.to_string());
                }
            }
        }
        let mut dropped = Vec::new();
        for station in net.stations.iter_mut() {
            let planar_free = !station.fixed_e || !station.fixed_n;
            let constrained = station.constraint_e.is_some() || station.constraint_n.is_some();
            if planar_free && !constrained && !touched.contains(&station.id) {
                station.fixed_e = true;
                station.fixed_n = true;
                dropped.push(station.id.clone());
            }
        }
        for sid in dropped {
            net.log(format!(
                "station {sid} has no horizontal observation; holding its position fixed"
            ));
        }
    }

    let index = ParamIndex::build(&net);
    let num_params = index.count;
    if num_params == 0 {
        net.log("no unknown parameters; nothing to adjust".to_string());
        return finish(id, net, index, &[], &[], None, 0, false, false, 0.0);
    }

    // Pre-flight: linearize once at the initial coordinates and drop
    // anything geometrically degenerate, keeping row order stable
    {
        let orientations = orientation_map(&net.sets);
        let lin = Linearizer {
            net: &net,
            index: &index,
            orientations: &orientations,
        };
        let mut keep = Vec::with_capacity(active.len());
        let mut dropped = Vec::new();
        for &oid in &active {
            match lin.equations(&net.observations[oid]) {
                Ok(_) => keep.push(oid),
                Err(why) => dropped.push((net.observations[oid].line, why)),
            }
        }
        active = keep;
        for (line, why) in dropped {
            net.log(format!("line {line}: observation dropped: {why}"));
        }
    }

    let constraints = collect_constraints(&net, &index);
    let num_obs_rows: usize = active
        .iter()
        .map(|&oid| net.observations[oid].equation_count())
        .sum();
    let num_equations = num_obs_rows + constraints.len();

    let dof = num_equations as i64 - num_params as i64;
    if dof < 0 {
        net.log(format!(
            "negative redundancy: {num_equations} equations for {num_params} parameters"
        ));
        return finish(id, net, index, &active, &constraints, None, 0, false, false, 0.0);
    }

    // ----- I T E R A T I O N ---------------------------------------------------------

    let mut converged = false;
    let mut success = true;
    let mut iterations = 0;
    let mut condition = 0.0;
    let mut condition_warned = false;
    let mut n_inv_last: Option<Matrix> = None;

    for iteration in 1..=options.max_iterations {
        iterations = iteration;
        let orientations = orientation_map(&net.sets);
        let (a, l, p) = match assemble(&net, &index, &active, &constraints, &orientations) {
            Ok(v) => v,
            Err(why) => {
                net.log(format!("assembly failed: {why}"));
                success = false;
                break;
            }
        };

        let at = a.transpose();
        let atp = match at.mul(&p) {
            Ok(m) => m,
            Err(e) => {
                net.log(format!("normal equations failed: {e}"));
                success = false;
                break;
            }
        };
        let n = atp.mul(&a).expect("shapes agree by construction");
        let u = atp.mul(&l).expect("shapes agree by construction");

        condition = n.condition_estimate();
        if condition > CONDITION_LIMIT && !condition_warned {
            net.log(format!(
                "normal matrix is ill conditioned (estimate {condition:.3e})"
            ));
            condition_warned = true;
        }

        let n_inv = match n.inv() {
            Ok(m) => m,
            Err(_) => {
                net.log("Matrix Inversion Failed".to_string());
                success = false;
                break;
            }
        };
        let x = n_inv.mul(&u).expect("shapes agree by construction");
        n_inv_last = Some(n_inv);

        let max_correction = apply_corrections(&mut net, &index, &x);
        info!("iteration {iteration}: max correction {max_correction:.6}");

        if max_correction < options.convergence {
            converged = true;
            break;
        }
    }

    if !converged && success {
        let max = options.max_iterations;
        net.log(format!("no convergence after {max} iterations"));
    }

    finish(
        id,
        net,
        index,
        &active,
        &constraints,
        n_inv_last,
        iterations,
        converged,
        success,
        condition,
    )
}

// Post-iteration pass: statistics, diagnostics, result assembly. Also the
// landing point for the early structural failures, which arrive with an
// empty active set or no inverse.
#[allow(clippy::too_many_arguments)]
fn finish(
    id: Uuid,
    mut net: Network,
    index: ParamIndex,
    active: &[usize],
    constraints: &[ConstraintRow],
    n_inv: Option<Matrix>,
    iterations: usize,
    converged: bool,
    success: bool,
    condition: f64,
) -> AdjustmentResult {
    let stats = statistics::run(&mut net, &index, active, constraints, n_inv.as_ref());

    let traverse = diagnostics::traverse_closure(&net);
    let set_diagnostics = diagnostics::direction_sets(&net);
    let target_diagnostics = diagnostics::direction_targets(&net);
    let setup_diagnostics = diagnostics::setups(&net, active);
    let sideshots = diagnostics::sideshots(&net);

    AdjustmentResult {
        id,
        success,
        converged,
        iterations,
        seuw: stats.seuw,
        dof: stats.dof,
        num_params: index.count,
        num_equations: stats.num_equations,
        chi_square: stats.chi_square,
        condition,
        constraints: stats.constraints,
        type_summary: stats.type_summary,
        relative_precision: stats.relative_precision,
        set_diagnostics,
        target_diagnostics,
        setup_diagnostics,
        traverse,
        sideshots,
        stations: net.stations,
        observations: net.observations,
        sets: net.sets,
        logs: net.logs,
    }
}

pub(crate) fn orientation_map(sets: &[DirectionSet]) -> HashMap<String, f64> {
    sets.iter()
        .map(|s| (s.id.clone(), s.orientation))
        .collect()
}

fn collect_constraints(net: &Network, index: &ParamIndex) -> Vec<ConstraintRow> {
    let mut out = Vec::new();
    for station in net.stations.iter() {
        let params = index.station(&station.id);
        let pairs = [
            ('E', params.e, station.constraint_e),
            ('N', params.n, station.constraint_n),
            ('H', params.h, station.constraint_h),
        ];
        for (component, param, constraint) in pairs {
            if let (Some(param), Some(c)) = (param, constraint) {
                out.push(ConstraintRow {
                    station: station.id.clone(),
                    component,
                    param,
                    target: c.target,
                    sigma: c.sigma,
                });
            }
        }
    }
    out
}

// Build A, L and P for the current iterate: observation rows in active
// order, then one row per control constraint.
pub(crate) fn assemble(
    net: &Network,
    index: &ParamIndex,
    active: &[usize],
    constraints: &[ConstraintRow],
    orientations: &HashMap<String, f64>,
) -> Result<(Matrix, Matrix, Matrix), String> {
    let nrows: usize = active
        .iter()
        .map(|&oid| net.observations[oid].equation_count())
        .sum::<usize>()
        + constraints.len();
    let mut a = Matrix::zeros(nrows, index.count);
    let mut l = Matrix::zeros(nrows, 1);
    let mut p = Matrix::zeros(nrows, nrows);

    let lin = Linearizer {
        net,
        index,
        orientations,
    };

    let mut row = 0;
    for &oid in active {
        let obs = &net.observations[oid];
        let eq = lin.equations(obs)?;
        match eq.weight {
            Weight::Scalar(w) => {
                for obs_row in &eq.rows {
                    // Coefficients accumulate: an angle's occupied station
                    // appears once per leg
                    for &(col, value) in &obs_row.coeffs {
                        a[(row, col)] += value;
                    }
                    l[(row, 0)] = obs_row.misclosure;
                    p[(row, row)] = w;
                    row += 1;
                }
            }
            Weight::Block(block) => {
                for (i, obs_row) in eq.rows.iter().enumerate() {
                    for &(col, value) in &obs_row.coeffs {
                        a[(row + i, col)] += value;
                    }
                    l[(row + i, 0)] = obs_row.misclosure;
                    for j in 0..2 {
                        p[(row + i, row + j)] = block[i][j];
                    }
                }
                row += eq.rows.len();
            }
        }
    }

    for c in constraints {
        let current = current_component(net, c);
        a[(row, c.param)] = 1.0;
        l[(row, 0)] = c.target - current;
        p[(row, row)] = 1.0 / (c.sigma * c.sigma);
        row += 1;
    }

    Ok((a, l, p))
}

pub(crate) fn current_component(net: &Network, c: &ConstraintRow) -> f64 {
    let station = net.stations.get(&c.station).expect("constraint station");
    match c.component {
        'E' => station.e,
        'N' => station.n,
        _ => station.h,
    }
}

// Add the correction vector to stations and orientations; returns the
// largest absolute correction
fn apply_corrections(net: &mut Network, index: &ParamIndex, x: &Matrix) -> f64 {
    let mut max_correction = 0.0_f64;
    for station in net.stations.iter_mut() {
        let params = index.station(&station.id);
        if let Some(p) = params.e {
            station.e += x[(p, 0)];
            max_correction = max_correction.max(x[(p, 0)].abs());
        }
        if let Some(p) = params.n {
            station.n += x[(p, 0)];
            max_correction = max_correction.max(x[(p, 0)].abs());
        }
        if let Some(p) = params.h {
            station.h += x[(p, 0)];
            max_correction = max_correction.max(x[(p, 0)].abs());
        }
    }
    for set in &mut net.sets {
        if let Some(p) = index.orientation(&set.id) {
            set.orientation = crate::angles::wrap_to_2pi(set.orientation + x[(p, 0)]);
            max_correction = max_correction.max(x[(p, 0)].abs());
        }
    }
    max_correction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn param_index_layout() {
        let net = parse(
            ".3D\nC A 0 0 10 ! ! !\nC B 100 0 10\nDB A B\nDN P1 010-00-00\nDE\nL A B 0.5 1.0\n",
        );
        let index = ParamIndex::build(&net);
        // A fully fixed; B free E, N, H; P1 free E, N, H; one orientation
        let b = index.station("B");
        assert_eq!(b.e, Some(0));
        assert_eq!(b.n, Some(1));
        assert_eq!(b.h, Some(2));
        let p1 = index.station("P1");
        assert_eq!(p1.e, Some(3));
        assert_eq!(index.orientation("A#1"), Some(6));
        assert_eq!(index.count, 7);
    }

    #[test]
    fn param_count_identity() {
        let net = parse("C A 0 0 ! !\nC B 100 0\nC U 50 50\nDB A B\nDN U 030-00-00\nDE\n");
        let index = ParamIndex::build(&net);
        let station_params: usize = net
            .stations
            .iter()
            .map(|s| s.free_count(net.state.two_d()))
            .sum();
        assert_eq!(index.count, station_params + net.sets.len());
    }

    #[test]
    fn no_unknowns_returns_immediately() {
        let net = parse("C A 0 0 ! !\nC B 100 0 ! !\nD A B 100.0 0.01\n");
        let result = adjust(net, AdjustOptions::default());
        assert!(!result.converged);
        assert_eq!(result.num_params, 0);
        assert!(result.logs.iter().any(|l| l.contains("no unknown")));
    }

    #[test]
    fn negative_redundancy_is_reported() {
        // One distance cannot determine two coordinates
        let net = parse("C A 0 0 ! !\nC B 100 0\nD A B 100.0 0.01\n");
        let result = adjust(net, AdjustOptions::default());
        assert!(!result.converged);
        assert!(result.logs.iter().any(|l| l.contains("negative redundancy")));
    }

    #[test]
    fn heights_without_vertical_data_are_held() {
        let net = parse(".3D\nC A 0 0 10 ! ! !\nC B 100 0 12\nD A B 100.0 0.01\nB A B 090-00-00 1.0\n");
        let result = adjust(net, AdjustOptions::default());
        assert!(result
            .logs
            .iter()
            .any(|l| l.contains("no vertical observation")));
        let b = result.stations.get("B").unwrap();
        assert!(b.fixed_h);
    }

    #[test]
    fn excluded_observations_stay_out() {
        let dat = "C A 0 0 ! !\nC B 200 0 ! !\nC U 100 80\n\
                   D A U 128.0625 0.003\nD B U 130.0 0.003\nA U B A 102-40-49.3 1.5\n";

        // With the biased 130 m distance included, the solution is pulled
        // off the true intersection
        let result = adjust(parse(dat), AdjustOptions::default());
        assert!(result.converged);
        let u_biased = result.stations.get("U").unwrap().clone();

        // Excluding it restores the exact fix
        let mut options = AdjustOptions::default();
        options.exclude.insert(1);
        let result = adjust(parse(dat), options);
        assert!(result.converged);
        let u = result.stations.get("U").unwrap();
        assert!((u.e - 100.0).abs() < 0.01);
        assert!((u.n - 80.0).abs() < 0.01);
        let moved = (u_biased.e - u.e).hypot(u_biased.n - u.n);
        assert!(moved > 0.2, "biased solution moved only {moved}");
    }
}
