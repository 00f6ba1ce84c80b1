//! Observation linearization, shared verbatim between the iteration loop
//! and the statistics pass: one routine turns an observation plus the
//! current coordinates and orientations into Jacobian rows, misclosures
//! and a weight block, so the two can never drift apart.

use super::ParamIndex;
use crate::angles::{wrap_to_2pi, wrap_to_pi};
use crate::observation::{DistMode, ObsKind, Observation};
use crate::parser::{MapMode, Network, VerticalReduction, EARTH_RADIUS};
use crate::station::Station;
use std::collections::HashMap;

/// Weight contribution of one observation: a scalar per row, or the
/// inverse covariance block of a GNSS vector
#[derive(Debug, Clone)]
pub(crate) enum Weight {
    Scalar(f64),
    Block([[f64; 2]; 2]),
}

/// One observation row: sparse Jacobian coefficients and the misclosure
#[derive(Debug, Clone)]
pub(crate) struct ObsRow {
    pub coeffs: Vec<(usize, f64)>,
    pub misclosure: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct ObsEquations {
    pub rows: Vec<ObsRow>,
    pub weight: Weight,
}

/// The shared linearization context: immutable view of the network state
/// at the current iterate.
pub(crate) struct Linearizer<'a> {
    pub net: &'a Network,
    pub index: &'a ParamIndex,
    /// Orientation per direction set id, current iterate
    pub orientations: &'a HashMap<String, f64>,
}

impl<'a> Linearizer<'a> {
    fn station(&self, id: &str) -> Result<&Station, String> {
        self.net
            .stations
            .get(id)
            .ok_or_else(|| format!("unknown station '{id}'"))
    }

    // Parameter coefficients for the azimuth of the leg a->b, signed
    fn az_coeffs(&self, coeffs: &mut Vec<(usize, f64)>, a: &Station, b: &Station, sign: f64) {
        let dx = b.e - a.e;
        let dy = b.n - a.n;
        let d2 = dx * dx + dy * dy;
        let ia = self.index.station(&a.id);
        let ib = self.index.station(&b.id);
        if let Some(p) = ia.e {
            coeffs.push((p, sign * -dy / d2));
        }
        if let Some(p) = ia.n {
            coeffs.push((p, sign * dx / d2));
        }
        if let Some(p) = ib.e {
            coeffs.push((p, sign * dy / d2));
        }
        if let Some(p) = ib.n {
            coeffs.push((p, sign * -dx / d2));
        }
    }

    /// Linearize one observation about the current state. Errors flag
    /// degenerate geometry (coincident stations, vertical sights).
    pub fn equations(&self, obs: &Observation) -> Result<ObsEquations, String> {
        match &obs.kind {
            ObsKind::Distance {
                from,
                to,
                value,
                hi,
                ht,
                mode,
            } => self.distance(obs, from, to, *value, *hi, *ht, *mode),
            ObsKind::Angle {
                at,
                from,
                to,
                value,
            } => self.angle(obs, at, from, to, *value),
            ObsKind::Direction {
                set, at, to, value, ..
            } => self.direction(obs, set, at, to, *value),
            ObsKind::Azimuth {
                from,
                to,
                value,
                flip180,
            } => self.azimuth(obs, from, to, *value, *flip180),
            ObsKind::Bearing { from, to, value } => self.azimuth(obs, from, to, *value, false),
            ObsKind::Zenith {
                from,
                to,
                value,
                hi,
                ht,
            } => self.zenith(obs, from, to, *value, *hi, *ht),
            ObsKind::Baseline {
                from,
                to,
                de,
                dn,
                sig_e,
                sig_n,
                rho,
            } => self.baseline(from, to, *de, *dn, *sig_e, *sig_n, *rho),
            ObsKind::LevelDiff {
                from, to, value, ..
            } => self.level(obs, from, to, *value),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn distance(
        &self,
        obs: &Observation,
        from: &str,
        to: &str,
        value: f64,
        hi: f64,
        ht: f64,
        mode: DistMode,
    ) -> Result<ObsEquations, String> {
        let s1 = self.station(from)?;
        let s2 = self.station(to)?;
        let dx = s2.e - s1.e;
        let dy = s2.n - s1.n;
        let horiz = dx.hypot(dy);
        if horiz < 1e-9 {
            return Err(format!("zero length between {from} and {to}"));
        }

        let two_d = self.net.state.two_d();
        let horizontal = two_d || mode == DistMode::Horizontal;

        // Map reduction scales horizontal distances only
        let scale = if self.net.state.map_mode == MapMode::On && horizontal {
            self.net.state.map_scale
        } else {
            1.0
        };

        let i1 = self.index.station(from);
        let i2 = self.index.station(to);
        let mut coeffs = Vec::new();

        let (calc, misclosure);
        if horizontal {
            calc = horiz * scale;
            misclosure = value - calc;
            if let Some(p) = i1.e {
                coeffs.push((p, -dx / horiz * scale));
            }
            if let Some(p) = i1.n {
                coeffs.push((p, -dy / horiz * scale));
            }
            if let Some(p) = i2.e {
                coeffs.push((p, dx / horiz * scale));
            }
            if let Some(p) = i2.n {
                coeffs.push((p, dy / horiz * scale));
            }
        } else {
            let dh = (s2.h + ht) - (s1.h + hi);
            let slope = horiz.hypot(dh);
            calc = slope;
            misclosure = value - calc;
            if let Some(p) = i1.e {
                coeffs.push((p, -dx / slope));
            }
            if let Some(p) = i1.n {
                coeffs.push((p, -dy / slope));
            }
            if let Some(p) = i2.e {
                coeffs.push((p, dx / slope));
            }
            if let Some(p) = i2.n {
                coeffs.push((p, dy / slope));
            }
            if let Some(p) = i1.h {
                coeffs.push((p, -dh / slope));
            }
            if let Some(p) = i2.h {
                coeffs.push((p, dh / slope));
            }
        }

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }

    fn angle(
        &self,
        obs: &Observation,
        at: &str,
        from: &str,
        to: &str,
        value: f64,
    ) -> Result<ObsEquations, String> {
        let sat = self.station(at)?;
        let sfrom = self.station(from)?;
        let sto = self.station(to)?;
        if coincident(sat, sfrom) || coincident(sat, sto) {
            return Err(format!("degenerate angle at {at}"));
        }

        let az_to = wrap_to_2pi((sto.e - sat.e).atan2(sto.n - sat.n));
        let az_from = wrap_to_2pi((sfrom.e - sat.e).atan2(sfrom.n - sat.n));
        let calc = wrap_to_2pi(az_to - az_from);
        let misclosure = wrap_to_pi(value - calc);

        let mut coeffs = Vec::new();
        self.az_coeffs(&mut coeffs, sat, sto, 1.0);
        self.az_coeffs(&mut coeffs, sat, sfrom, -1.0);

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }

    fn direction(
        &self,
        obs: &Observation,
        set: &str,
        at: &str,
        to: &str,
        value: f64,
    ) -> Result<ObsEquations, String> {
        let sat = self.station(at)?;
        let sto = self.station(to)?;
        if coincident(sat, sto) {
            return Err(format!("degenerate direction {at} -> {to}"));
        }
        let orientation = *self
            .orientations
            .get(set)
            .ok_or_else(|| format!("unknown direction set '{set}'"))?;

        let az = wrap_to_2pi((sto.e - sat.e).atan2(sto.n - sat.n));
        let calc = wrap_to_2pi(orientation + az);
        let misclosure = wrap_to_pi(value - calc);

        let mut coeffs = Vec::new();
        self.az_coeffs(&mut coeffs, sat, sto, 1.0);
        if let Some(p) = self.index.orientation(set) {
            coeffs.push((p, 1.0));
        }

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }

    fn azimuth(
        &self,
        obs: &Observation,
        from: &str,
        to: &str,
        value: f64,
        flip180: bool,
    ) -> Result<ObsEquations, String> {
        let s1 = self.station(from)?;
        let s2 = self.station(to)?;
        if coincident(s1, s2) {
            return Err(format!("degenerate azimuth {from} -> {to}"));
        }

        let calc = wrap_to_2pi((s2.e - s1.e).atan2(s2.n - s1.n));
        let mut misclosure = wrap_to_pi(value - calc);
        if flip180 {
            let flipped = wrap_to_pi(value + std::f64::consts::PI - calc);
            if flipped.abs() < misclosure.abs() {
                misclosure = flipped;
            }
        }

        let mut coeffs = Vec::new();
        self.az_coeffs(&mut coeffs, s1, s2, 1.0);

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }

    fn zenith(
        &self,
        obs: &Observation,
        from: &str,
        to: &str,
        value: f64,
        hi: f64,
        ht: f64,
    ) -> Result<ObsEquations, String> {
        let s1 = self.station(from)?;
        let s2 = self.station(to)?;
        let dx = s2.e - s1.e;
        let dy = s2.n - s1.n;
        let horiz = dx.hypot(dy);
        if horiz < 1e-9 {
            return Err(format!("vertical sight between {from} and {to}"));
        }
        let dh = (s2.h + ht) - (s1.h + hi);
        let dist = horiz.hypot(dh);
        let u = dh / dist;
        let root = (1.0 - u * u).sqrt().max(1e-12);

        let mut calc = (dh / dist).acos();
        let curvref = self.net.state.vertical_reduction == VerticalReduction::CurvRef;
        let curv_slope = if curvref {
            let k = self.net.state.refraction_k;
            calc += (1.0 - k) * horiz / (2.0 * EARTH_RADIUS);
            (1.0 - k) / (2.0 * EARTH_RADIUS)
        } else {
            0.0
        };
        let misclosure = value - calc;

        // Geometric partials plus the curvature term through d(horiz)
        let d3 = dist.powi(3);
        let ze = dh * dx / (d3 * root);
        let zn = dh * dy / (d3 * root);
        let zh = horiz * horiz / (d3 * root);

        let i1 = self.index.station(from);
        let i2 = self.index.station(to);
        let mut coeffs = Vec::new();
        if let Some(p) = i1.e {
            coeffs.push((p, -ze + curv_slope * (-dx / horiz)));
        }
        if let Some(p) = i1.n {
            coeffs.push((p, -zn + curv_slope * (-dy / horiz)));
        }
        if let Some(p) = i2.e {
            coeffs.push((p, ze + curv_slope * (dx / horiz)));
        }
        if let Some(p) = i2.n {
            coeffs.push((p, zn + curv_slope * (dy / horiz)));
        }
        if let Some(p) = i1.h {
            coeffs.push((p, zh));
        }
        if let Some(p) = i2.h {
            coeffs.push((p, -zh));
        }

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn baseline(
        &self,
        from: &str,
        to: &str,
        de: f64,
        dn: f64,
        sig_e: f64,
        sig_n: f64,
        rho: f64,
    ) -> Result<ObsEquations, String> {
        let s1 = self.station(from)?;
        let s2 = self.station(to)?;
        let i1 = self.index.station(from);
        let i2 = self.index.station(to);

        let mut row_e = ObsRow {
            coeffs: Vec::new(),
            misclosure: de - (s2.e - s1.e),
        };
        if let Some(p) = i1.e {
            row_e.coeffs.push((p, -1.0));
        }
        if let Some(p) = i2.e {
            row_e.coeffs.push((p, 1.0));
        }

        let mut row_n = ObsRow {
            coeffs: Vec::new(),
            misclosure: dn - (s2.n - s1.n),
        };
        if let Some(p) = i1.n {
            row_n.coeffs.push((p, -1.0));
        }
        if let Some(p) = i2.n {
            row_n.coeffs.push((p, 1.0));
        }

        Ok(ObsEquations {
            rows: vec![row_e, row_n],
            weight: Weight::Block(baseline_weight(sig_e, sig_n, rho)),
        })
    }

    fn level(
        &self,
        obs: &Observation,
        from: &str,
        to: &str,
        value: f64,
    ) -> Result<ObsEquations, String> {
        let s1 = self.station(from)?;
        let s2 = self.station(to)?;
        let i1 = self.index.station(from);
        let i2 = self.index.station(to);

        let misclosure = value - (s2.h - s1.h);
        let mut coeffs = Vec::new();
        if let Some(p) = i1.h {
            coeffs.push((p, -1.0));
        }
        if let Some(p) = i2.h {
            coeffs.push((p, 1.0));
        }

        Ok(ObsEquations {
            rows: vec![ObsRow { coeffs, misclosure }],
            weight: Weight::Scalar(1.0 / (obs.sigma * obs.sigma)),
        })
    }
}

/// Inverse of the 2x2 baseline covariance; falls back to the uncorrelated
/// diagonal when the covariance is degenerate
pub(crate) fn baseline_weight(sig_e: f64, sig_n: f64, rho: f64) -> [[f64; 2]; 2] {
    let cee = sig_e * sig_e;
    let cnn = sig_n * sig_n;
    let cen = rho * sig_e * sig_n;
    let det = cee * cnn - cen * cen;
    if det.abs() < 1e-30 {
        return [[1.0 / cee, 0.0], [0.0, 1.0 / cnn]];
    }
    [[cnn / det, -cen / det], [-cen / det, cee / det]]
}

/// The a priori cofactors of the two baseline rows (diagonal of the
/// covariance), used by the local-test pass
pub(crate) fn baseline_cofactors(sig_e: f64, sig_n: f64) -> (f64, f64) {
    (sig_e * sig_e, sig_n * sig_n)
}

fn coincident(a: &Station, b: &Station) -> bool {
    (b.e - a.e).hypot(b.n - a.n) < 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::ParamIndex;
    use crate::parser::parse;

    fn linearizer_fixture(dat: &str) -> (Network, ParamIndex) {
        let net = parse(dat);
        let index = ParamIndex::build(&net);
        (net, index)
    }

    #[test]
    fn distance_row_points_along_the_leg() {
        let (net, index) = linearizer_fixture("C A 0 0 ! !\nC B 30 40\nD A B 51.0 0.01\n");
        let orientations = HashMap::new();
        let lin = Linearizer {
            net: &net,
            index: &index,
            orientations: &orientations,
        };
        let eq = lin.equations(&net.observations[0]).unwrap();
        assert_eq!(eq.rows.len(), 1);
        // Unit vector from A to B is (0.6, 0.8); only B is free
        let row = &eq.rows[0];
        assert_eq!(row.coeffs.len(), 2);
        assert!((row.coeffs[0].1 - 0.6).abs() < 1e-12);
        assert!((row.coeffs[1].1 - 0.8).abs() < 1e-12);
        assert!((row.misclosure - 1.0).abs() < 1e-12);
        match eq.weight {
            Weight::Scalar(w) => assert!((w - 1.0 / 0.0001).abs() < 1e-6),
            _ => panic!("expected scalar weight"),
        }
    }

    #[test]
    fn azimuth_flip_prefers_nearer_branch() {
        let (net, index) =
            linearizer_fixture(".AMODE DIR\nC A 0 0 ! !\nC B 0 100\nA A X B 180-00-10\n");
        let orientations = HashMap::new();
        let lin = Linearizer {
            net: &net,
            index: &index,
            orientations: &orientations,
        };
        // True azimuth A->B is 0; observed 180°10" flips to 10 arcsec
        let eq = lin.equations(&net.observations[0]).unwrap();
        assert!(crate::angles::rad_to_sec(eq.rows[0].misclosure.abs()) < 11.0);
    }

    #[test]
    fn baseline_weight_matches_covariance_inverse() {
        let w = baseline_weight(0.01, 0.03, 0.25);
        // C * W = I
        let cee = 0.0001;
        let cnn = 0.0009;
        let cen = 0.25 * 0.01 * 0.03;
        let id00 = cee * w[0][0] + cen * w[1][0];
        let id01 = cee * w[0][1] + cen * w[1][1];
        let id11 = cen * w[0][1] + cnn * w[1][1];
        assert!((id00 - 1.0).abs() < 1e-9);
        assert!(id01.abs() < 1e-9);
        assert!((id11 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_length_leg_is_degenerate() {
        let (net, index) = linearizer_fixture("C A 0 0\nC B 0 0\nD A B 10 0.01\n");
        let orientations = HashMap::new();
        let lin = Linearizer {
            net: &net,
            index: &index,
            orientations: &orientations,
        };
        assert!(lin.equations(&net.observations[0]).is_err());
    }
}
