//! The post-solution statistics pass: residuals, the variance test,
//! covariance-derived precision measures and the per-observation local
//! (data snooping) tests. Residuals are recomputed with the same
//! linearization the iterations used, so the numbers the report shows are
//! exactly the numbers the solver converged on.

use super::rows::{baseline_cofactors, Linearizer, Weight};
use super::{
    assemble, current_component, orientation_map, ConstraintRow, ParamIndex, LOCAL_TEST_CRITICAL,
};
use crate::angles::{rad_to_sec, wrap_to_2pi};
use crate::linalg::Matrix;
use crate::observation::ObsKind;
use crate::parser::Network;
use crate::station::ErrorEllipse;
use crate::stats::{chi_square_p_value, chi_square_quantile};
use log::warn;
use std::collections::BTreeSet;

/// Observations with a standardized residual above this are flagged in
/// the logs
const GROSS_STD_RES: f64 = 10.0;

/// Two-sided chi-square variance test at 95%
#[derive(Debug, Clone)]
pub struct ChiSquareTest {
    /// The statistic vᵀPv
    pub t: f64,
    pub dof: usize,
    /// Two-sided p-value
    pub p_value: f64,
    /// Acceptance interval endpoints at alpha = 0.05
    pub lower: f64,
    pub upper: f64,
    pub pass95: bool,
    pub variance_factor: f64,
    pub factor_lower: f64,
    pub factor_upper: f64,
}

/// One weighted control constraint and how far the adjustment pulled it
#[derive(Debug, Clone)]
pub struct ConstraintSummary {
    pub station: String,
    pub component: char,
    pub target: f64,
    pub sigma: f64,
    pub residual: f64,
}

/// Residual roll-up per observation type
#[derive(Debug, Clone)]
pub struct TypeSummary {
    pub kind: &'static str,
    pub count: usize,
    /// RMS residual in `unit`
    pub rms: f64,
    pub max_abs: f64,
    pub max_std_res: f64,
    pub over3: usize,
    pub over4: usize,
    pub unit: &'static str,
}

/// Relative precision between two adjusted stations
#[derive(Debug, Clone)]
pub struct RelativePrecision {
    pub from: String,
    pub to: String,
    pub distance: f64,
    pub semi_major: f64,
    pub semi_minor: f64,
    pub theta_deg: f64,
    /// Sigma of the distance between the pair (m)
    pub sig_dist: f64,
    /// Sigma of the azimuth between the pair (arcsec)
    pub sig_az_sec: f64,
}

pub(crate) struct StatsOutput {
    pub seuw: f64,
    pub dof: i64,
    pub num_equations: usize,
    pub chi_square: Option<ChiSquareTest>,
    pub constraints: Vec<ConstraintSummary>,
    pub type_summary: Vec<TypeSummary>,
    pub relative_precision: Vec<RelativePrecision>,
}

pub(crate) fn run(
    net: &mut Network,
    index: &ParamIndex,
    active: &[usize],
    constraints: &[ConstraintRow],
    n_inv: Option<&Matrix>,
) -> StatsOutput {
    let orientations = orientation_map(&net.sets);

    // Per-observation residuals for everything, sideshots and exclusions
    // included; only the active set enters vtpv below
    set_residuals(net, index, &orientations);

    let num_obs_rows: usize = active
        .iter()
        .map(|&oid| net.observations[oid].equation_count())
        .sum();
    let num_equations = num_obs_rows + constraints.len();
    let dof = num_equations as i64 - index.count as i64;

    // The final assembly, at the adjusted coordinates
    let assembly = assemble(net, index, active, constraints, &orientations).ok();

    let mut vtpv = 0.0;
    if let Some((_, l, p)) = &assembly {
        for r in 0..l.rows() {
            for c in 0..l.rows() {
                if p[(r, c)] != 0.0 {
                    vtpv += l[(r, 0)] * p[(r, c)] * l[(c, 0)];
                }
            }
        }
    }

    let seuw = if dof > 0 { (vtpv / dof as f64).sqrt() } else { 0.0 };

    let chi_square = (dof > 0).then(|| {
        let dof_f = dof as f64;
        let lower = chi_square_quantile(0.025, dof_f);
        let upper = chi_square_quantile(0.975, dof_f);
        let tail = chi_square_p_value(vtpv, dof_f);
        ChiSquareTest {
            t: vtpv,
            dof: dof as usize,
            p_value: (2.0 * tail.min(1.0 - tail)).clamp(0.0, 1.0),
            lower,
            upper,
            pass95: (lower..=upper).contains(&vtpv),
            variance_factor: vtpv / dof_f,
            factor_lower: lower / dof_f,
            factor_upper: upper / dof_f,
        }
    });

    if let (Some(q), Some((a, l, p))) = (n_inv, &assembly) {
        station_covariance(net, index, q, seuw);
        local_tests(net, index, active, a, l, p, q, seuw);
    }

    let gross = net
        .observations
        .iter()
        .filter(|o| o.std_res.map_or(false, |t| t.abs() > GROSS_STD_RES))
        .count();
    if gross > 0 {
        net.log(format!(
            "{gross} observation(s) with standardized residual above {GROSS_STD_RES}"
        ));
    }

    let constraints_out = constraints
        .iter()
        .map(|c| ConstraintSummary {
            station: c.station.clone(),
            component: c.component,
            target: c.target,
            sigma: c.sigma,
            residual: c.target - current_component(net, c),
        })
        .collect();

    StatsOutput {
        seuw,
        dof,
        num_equations,
        chi_square,
        constraints: constraints_out,
        type_summary: type_summary(net, active),
        relative_precision: n_inv
            .map(|q| relative_precision(net, index, q, seuw))
            .unwrap_or_default(),
    }
}

// calc / residual / a-priori standardized residual on every observation
fn set_residuals(
    net: &mut Network,
    index: &ParamIndex,
    orientations: &std::collections::HashMap<String, f64>,
) {
    let mut results = Vec::with_capacity(net.observations.len());
    {
        let lin = Linearizer {
            net,
            index,
            orientations,
        };
        for obs in &net.observations {
            results.push(lin.equations(obs).ok());
        }
    }

    for (obs, eq) in net.observations.iter_mut().zip(results) {
        let Some(eq) = eq else {
            continue;
        };
        if let (ObsKind::Baseline { de, dn, .. }, Weight::Block(w)) = (&obs.kind, &eq.weight) {
            let (de, dn) = (*de, *dn);
            let w = *w;
            let ve = eq.rows[0].misclosure;
            let vn = eq.rows[1].misclosure;
            obs.residual = Some(ve.hypot(vn));
            obs.std_res = Some(
                (ve * (w[0][0] * ve + w[0][1] * vn) + vn * (w[1][0] * ve + w[1][1] * vn))
                    .max(0.0)
                    .sqrt(),
            );
            obs.calc = Some((de - ve).hypot(dn - vn));
            continue;
        }

        let v = eq.rows[0].misclosure;
        let observed = match &obs.kind {
            ObsKind::Distance { value, .. }
            | ObsKind::Angle { value, .. }
            | ObsKind::Direction { value, .. }
            | ObsKind::Azimuth { value, .. }
            | ObsKind::Bearing { value, .. }
            | ObsKind::Zenith { value, .. }
            | ObsKind::LevelDiff { value, .. } => *value,
            ObsKind::Baseline { .. } => continue,
        };
        let wrap = obs.kind.is_angular() && !matches!(obs.kind, ObsKind::Zenith { .. });
        obs.residual = Some(v);
        obs.std_res = (obs.sigma > 0.0).then(|| v / obs.sigma);
        let calc = observed - v;
        obs.calc = Some(if wrap { wrap_to_2pi(calc) } else { calc });
    }
}

// A posteriori standard deviations and error ellipses per station
fn station_covariance(net: &mut Network, index: &ParamIndex, q: &Matrix, seuw: f64) {
    let s0sq = seuw * seuw;
    for station in net.stations.iter_mut() {
        let params = index.station(&station.id);
        let qee = params.e.map_or(0.0, |p| q[(p, p)]);
        let qnn = params.n.map_or(0.0, |p| q[(p, p)]);
        let qen = match (params.e, params.n) {
            (Some(pe), Some(pn)) => q[(pe, pn)],
            _ => 0.0,
        };
        let see2 = s0sq * qee;
        let snn2 = s0sq * qnn;
        let sen = s0sq * qen;

        station.sig_e = Some(see2.max(0.0).sqrt());
        station.sig_n = Some(snn2.max(0.0).sqrt());
        if params.e.is_some() || params.n.is_some() {
            station.ellipse = Some(ellipse_from_cov(see2, snn2, sen));
        }
        if let Some(ph) = params.h {
            station.sig_h = Some((s0sq * q[(ph, ph)]).max(0.0).sqrt());
        } else if !net.state.two_d() {
            station.sig_h = Some(0.0);
        }
    }
}

/// 2D error ellipse from a planar covariance block
pub(crate) fn ellipse_from_cov(see2: f64, snn2: f64, sen: f64) -> ErrorEllipse {
    let term1 = (see2 + snn2) / 2.0;
    let term2 = (((see2 - snn2) / 2.0).powi(2) + sen * sen).sqrt();
    ErrorEllipse {
        semi_major: (term1 + term2).abs().sqrt(),
        semi_minor: (term1 - term2).abs().sqrt(),
        theta_deg: 0.5 * (2.0 * sen).atan2(see2 - snn2) * crate::angles::RAD_TO_DEG,
    }
}

// Redundancy numbers, data-snooping t-values and minimum detectable
// biases, from qvv = qll - (A Qxx Aᵀ)ᵢᵢ
#[allow(clippy::too_many_arguments)]
fn local_tests(
    net: &mut Network,
    _index: &ParamIndex,
    active: &[usize],
    a: &Matrix,
    l: &Matrix,
    p: &Matrix,
    q: &Matrix,
    seuw: f64,
) {
    let Ok(b) = a.mul(q) else {
        warn!("local tests skipped: shape mismatch");
        return;
    };

    // Row cofactors qll per observation row
    let mut row = 0;
    for &oid in active {
        let obs = &net.observations[oid];
        let nrows = obs.equation_count();
        let qlls: Vec<f64> = match &obs.kind {
            ObsKind::Baseline { sig_e, sig_n, .. } => {
                let (qe, qn) = baseline_cofactors(*sig_e, *sig_n);
                vec![qe, qn]
            }
            _ => vec![1.0 / p[(row, row)]],
        };

        let mut redundancy_sum = 0.0;
        let mut worst_t: Option<f64> = None;
        let mut pass = true;
        let mut mdb: Option<f64> = None;

        for (i, &qll) in qlls.iter().enumerate().take(nrows) {
            let r = row + i;
            let mut aqat = 0.0;
            for j in 0..a.cols() {
                aqat += b[(r, j)] * a[(r, j)];
            }
            let qvv = qll - aqat;
            if qvv <= 0.0 || qll <= 0.0 {
                continue;
            }
            let red = qvv / qll;
            redundancy_sum += red;
            if seuw > 0.0 {
                let t = l[(r, 0)] / (seuw * qvv.sqrt());
                if worst_t.map_or(true, |w| t.abs() > w.abs()) {
                    worst_t = Some(t);
                }
                if t.abs() > LOCAL_TEST_CRITICAL {
                    pass = false;
                }
                let this_mdb = LOCAL_TEST_CRITICAL * seuw * qll.sqrt() / red.sqrt();
                mdb = Some(mdb.map_or(this_mdb, |m: f64| m.max(this_mdb)));
            }
        }

        let obs = &mut net.observations[oid];
        obs.redundancy = Some(redundancy_sum);
        if let Some(t) = worst_t {
            obs.local_t = Some(t);
            obs.local_pass = Some(pass);
        }
        obs.mdb = mdb;
        row += nrows;
    }
}

fn type_summary(net: &Network, active: &[usize]) -> Vec<TypeSummary> {
    let active_set: BTreeSet<usize> = active.iter().copied().collect();
    let mut out: Vec<TypeSummary> = Vec::new();

    for obs in &net.observations {
        if !active_set.contains(&obs.id) {
            continue;
        }
        let Some(residual) = obs.residual else {
            continue;
        };
        let angular = obs.kind.is_angular();
        let v = if angular {
            rad_to_sec(residual)
        } else {
            residual
        };
        let t = obs.std_res.unwrap_or(0.0);

        let kind = obs.kind.name();
        let idx = match out.iter().position(|e| e.kind == kind) {
            Some(i) => i,
            None => {
                out.push(TypeSummary {
                    kind,
                    count: 0,
                    rms: 0.0,
                    max_abs: 0.0,
                    max_std_res: 0.0,
                    over3: 0,
                    over4: 0,
                    unit: obs.kind.unit(),
                });
                out.len() - 1
            }
        };
        let entry = &mut out[idx];
        entry.count += 1;
        entry.rms += v * v; // sum of squares until the final pass
        entry.max_abs = entry.max_abs.max(v.abs());
        entry.max_std_res = entry.max_std_res.max(t.abs());
        if t.abs() > 3.0 {
            entry.over3 += 1;
        }
        if t.abs() > 4.0 {
            entry.over4 += 1;
        }
    }

    for entry in &mut out {
        entry.rms = (entry.rms / entry.count as f64).sqrt();
    }
    out
}

// Relative ellipses and sigma distance/azimuth for pairs of stations with
// free planar components
fn relative_precision(
    net: &Network,
    index: &ParamIndex,
    q: &Matrix,
    seuw: f64,
) -> Vec<RelativePrecision> {
    let s0sq = seuw * seuw;
    let free: Vec<&crate::station::Station> = net
        .stations
        .iter()
        .filter(|s| {
            let p = index.station(&s.id);
            p.e.is_some() && p.n.is_some()
        })
        .collect();

    let mut out = Vec::new();
    for (i, sa) in free.iter().enumerate() {
        for sb in free.iter().skip(i + 1) {
            let pa = index.station(&sa.id);
            let pb = index.station(&sb.id);
            let (ea, na) = (pa.e.unwrap(), pa.n.unwrap());
            let (eb, nb) = (pb.e.unwrap(), pb.n.unwrap());

            let var_e = s0sq * (q[(ea, ea)] + q[(eb, eb)] - 2.0 * q[(ea, eb)]);
            let var_n = s0sq * (q[(na, na)] + q[(nb, nb)] - 2.0 * q[(na, nb)]);
            let cov_en =
                s0sq * (q[(eb, nb)] - q[(eb, na)] - q[(ea, nb)] + q[(ea, na)]);

            let dx = sb.e - sa.e;
            let dy = sb.n - sa.n;
            let distance = dx.hypot(dy);
            if distance < 1e-9 {
                continue;
            }
            let az = dx.atan2(dy);
            let (sin_az, cos_az) = az.sin_cos();

            let sig_dist = (sin_az * sin_az * var_e
                + cos_az * cos_az * var_n
                + 2.0 * sin_az * cos_az * cov_en)
                .max(0.0)
                .sqrt();
            let sig_az = ((cos_az * cos_az * var_e + sin_az * sin_az * var_n
                - 2.0 * sin_az * cos_az * cov_en)
                .max(0.0)
                .sqrt())
                / distance;

            let ellipse = ellipse_from_cov(var_e, var_n, cov_en);
            out.push(RelativePrecision {
                from: sa.id.clone(),
                to: sb.id.clone(),
                distance,
                semi_major: ellipse.semi_major,
                semi_minor: ellipse.semi_minor,
                theta_deg: ellipse.theta_deg,
                sig_dist,
                sig_az_sec: rad_to_sec(sig_az),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ellipse_axes_order() {
        // Major axis along E: theta = 0 from the E axis
        let e = ellipse_from_cov(0.0004, 0.0001, 0.0);
        assert!((e.semi_major - 0.02).abs() < 1e-12);
        assert!((e.semi_minor - 0.01).abs() < 1e-12);
        assert!(e.theta_deg.abs() < 1e-9);

        // Major axis along N: theta = 90
        let e = ellipse_from_cov(0.0001, 0.0004, 0.0);
        assert!((e.semi_major - 0.02).abs() < 1e-12);
        assert!((e.theta_deg.abs() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn circular_covariance_gives_circle() {
        let e = ellipse_from_cov(0.0001, 0.0001, 0.0);
        assert!((e.semi_major - e.semi_minor).abs() < 1e-12);
    }
}
