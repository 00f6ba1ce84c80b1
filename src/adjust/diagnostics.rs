//! Field-procedure diagnostics layered on top of the statistics pass:
//! direction set and per-target quality, setup roll-ups, traverse closure
//! and post-adjustment sideshot coordinates with propagated uncertainty.

use crate::angles::{rad_to_sec, sec_to_rad, wrap_to_2pi, RAD_TO_DEG};
use crate::instrument::FALLBACK_ANGLE_SIGMA;
use crate::observation::{DistMode, ObsKind, Observation};
use crate::parser::Network;
use std::collections::BTreeSet;

/// Quality summary of one direction set
#[derive(Debug, Clone)]
pub struct SetDiagnostics {
    pub set_id: String,
    pub at: String,
    pub raw_count: usize,
    pub reduced_count: usize,
    pub face1_count: usize,
    pub face2_count: usize,
    /// Targets observed on both faces
    pub paired_targets: usize,
    pub orientation_deg: f64,
    pub residual_mean_sec: f64,
    pub residual_rms_sec: f64,
    pub residual_max_sec: f64,
    /// Standard error of the set orientation, rms / sqrt(count)
    pub orientation_se_sec: f64,
}

/// Quality of one reduced direction (a single set/target pairing)
#[derive(Debug, Clone)]
pub struct TargetDiagnostics {
    pub set_id: String,
    pub at: String,
    pub to: String,
    pub raw_count: usize,
    pub face1_count: usize,
    pub face2_count: usize,
    pub balanced: bool,
    pub raw_spread_sec: f64,
    pub reduced_sigma_sec: f64,
    pub residual_sec: Option<f64>,
    pub std_res: Option<f64>,
    pub local_pass: Option<bool>,
    pub mdb_sec: Option<f64>,
    /// Composite 0-and-up blunder score; higher is worse
    pub suspect_score: f64,
}

/// Per-setup (occupied station) roll-up
#[derive(Debug, Clone)]
pub struct SetupDiagnostics {
    pub station: String,
    /// (observation kind, count) pairs, kind order of first appearance
    pub counts: Vec<(&'static str, usize)>,
    pub rms_t: f64,
    pub max_t: f64,
    pub local_fail_count: usize,
    /// Observation id with the worst |t|
    pub worst_obs: Option<usize>,
}

/// Closure of the traverse chain, from the distance residual projections
#[derive(Debug, Clone)]
pub struct TraverseDiagnostics {
    pub misclosure_e: f64,
    pub misclosure_n: f64,
    pub misclosure_mag: f64,
    pub total_distance: f64,
    /// total distance over misclosure magnitude, the "1 : ratio" figure
    pub closure_ratio: f64,
}

/// A sideshot target computed after the adjustment
#[derive(Debug, Clone)]
pub struct SideshotResult {
    pub from: String,
    pub to: String,
    pub line: usize,
    pub e: Option<f64>,
    pub n: Option<f64>,
    pub h: Option<f64>,
    pub sig_e: Option<f64>,
    pub sig_n: Option<f64>,
    pub sig_h: Option<f64>,
    pub note: Option<String>,
}

pub(crate) fn direction_sets(net: &Network) -> Vec<SetDiagnostics> {
    net.sets
        .iter()
        .map(|set| {
            let mut d = SetDiagnostics {
                set_id: set.id.clone(),
                at: set.at.clone(),
                raw_count: 0,
                reduced_count: 0,
                face1_count: 0,
                face2_count: 0,
                paired_targets: 0,
                orientation_deg: set.orientation * RAD_TO_DEG,
                residual_mean_sec: 0.0,
                residual_rms_sec: 0.0,
                residual_max_sec: 0.0,
                orientation_se_sec: 0.0,
            };
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut with_residual = 0;
            for obs in directions_of(net, &set.id) {
                if let ObsKind::Direction {
                    raw_count,
                    face1_count,
                    face2_count,
                    ..
                } = &obs.kind
                {
                    d.raw_count += raw_count;
                    d.reduced_count += 1;
                    d.face1_count += face1_count;
                    d.face2_count += face2_count;
                    if *face1_count > 0 && *face2_count > 0 {
                        d.paired_targets += 1;
                    }
                }
                if let Some(v) = obs.residual {
                    let sec = rad_to_sec(v);
                    sum += sec;
                    sum_sq += sec * sec;
                    d.residual_max_sec = d.residual_max_sec.max(sec.abs());
                    with_residual += 1;
                }
            }
            if with_residual > 0 {
                d.residual_mean_sec = sum / with_residual as f64;
                d.residual_rms_sec = (sum_sq / with_residual as f64).sqrt();
                d.orientation_se_sec = d.residual_rms_sec / (with_residual as f64).sqrt();
            }
            d
        })
        .collect()
}

pub(crate) fn direction_targets(net: &Network) -> Vec<TargetDiagnostics> {
    let mut out = Vec::new();
    for obs in &net.observations {
        let ObsKind::Direction {
            set,
            at,
            to,
            raw_count,
            face1_count,
            face2_count,
            raw_spread_sec,
            ..
        } = &obs.kind
        else {
            continue;
        };
        let balanced = face1_count == face2_count;
        let t = obs.local_t.or(obs.std_res).unwrap_or(0.0);
        let local_fail = obs.local_pass == Some(false);
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let suspect_score = 100.0 * flag(local_fail)
            + 10.0 * t.abs()
            + (raw_spread_sec / 2.0).min(50.0)
            + 8.0 * flag(!balanced)
            + 4.0 * flag(*raw_count < 2);

        out.push(TargetDiagnostics {
            set_id: set.clone(),
            at: at.clone(),
            to: to.clone(),
            raw_count: *raw_count,
            face1_count: *face1_count,
            face2_count: *face2_count,
            balanced,
            raw_spread_sec: *raw_spread_sec,
            reduced_sigma_sec: rad_to_sec(obs.sigma),
            residual_sec: obs.residual.map(rad_to_sec),
            std_res: obs.std_res,
            local_pass: obs.local_pass,
            mdb_sec: obs.mdb.map(rad_to_sec),
            suspect_score,
        });
    }
    out
}

pub(crate) fn setups(net: &Network, active: &[usize]) -> Vec<SetupDiagnostics> {
    let active_set: BTreeSet<usize> = active.iter().copied().collect();
    let mut out: Vec<SetupDiagnostics> = Vec::new();

    for obs in &net.observations {
        if !active_set.contains(&obs.id) {
            continue;
        }
        let station = obs.kind.occupy().to_string();
        let idx = match out.iter().position(|s| s.station == station) {
            Some(i) => i,
            None => {
                out.push(SetupDiagnostics {
                    station,
                    counts: Vec::new(),
                    rms_t: 0.0,
                    max_t: 0.0,
                    local_fail_count: 0,
                    worst_obs: None,
                });
                out.len() - 1
            }
        };
        let entry = &mut out[idx];

        let kind = obs.kind.name();
        match entry.counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, c)) => *c += 1,
            None => entry.counts.push((kind, 1)),
        }

        if let Some(t) = obs.local_t.or(obs.std_res) {
            entry.rms_t += t * t; // finalized below
            if t.abs() > entry.max_t {
                entry.max_t = t.abs();
                entry.worst_obs = Some(obs.id);
            }
        }
        if obs.local_pass == Some(false) {
            entry.local_fail_count += 1;
        }
    }

    for entry in &mut out {
        let n: usize = entry.counts.iter().map(|(_, c)| c).sum();
        if n > 0 {
            entry.rms_t = (entry.rms_t / n as f64).sqrt();
        }
    }
    out
}

pub(crate) fn traverse_closure(net: &Network) -> Option<TraverseDiagnostics> {
    let mut mis_e = 0.0;
    let mut mis_n = 0.0;
    let mut total = 0.0;
    let mut legs = 0;

    for obs in &net.observations {
        if !matches!(obs.set_id.as_deref(), Some("T") | Some("TE")) {
            continue;
        }
        let ObsKind::Distance {
            from, to, value, ..
        } = &obs.kind
        else {
            continue;
        };
        let (Some(a), Some(b)) = (net.stations.get(from), net.stations.get(to)) else {
            continue;
        };
        let az = (b.e - a.e).atan2(b.n - a.n);
        let v = obs.residual.unwrap_or(0.0);
        mis_e += v * az.sin();
        mis_n += v * az.cos();
        total += value;
        legs += 1;
    }

    if legs == 0 {
        return None;
    }
    let mag = mis_e.hypot(mis_n);
    Some(TraverseDiagnostics {
        misclosure_e: mis_e,
        misclosure_n: mis_n,
        misclosure_mag: mag,
        total_distance: total,
        closure_ratio: if mag > 1e-12 { total / mag } else { f64::INFINITY },
    })
}

pub(crate) fn sideshots(net: &Network) -> Vec<SideshotResult> {
    net.sideshots
        .iter()
        .map(|rec| {
            let mut result = SideshotResult {
                from: rec.from.clone(),
                to: rec.to.clone(),
                line: rec.line,
                e: None,
                n: None,
                h: None,
                sig_e: None,
                sig_n: None,
                sig_h: None,
                note: None,
            };
            let Some(from) = net.stations.get(&rec.from) else {
                result.note = Some("setup station unknown".to_string());
                return result;
            };

            let dist_obs = &net.observations[rec.dist_obs];
            let ObsKind::Distance {
                value: dist, mode, ..
            } = &dist_obs.kind
            else {
                result.note = Some("sideshot distance missing".to_string());
                return result;
            };
            let vert_obs = rec.vert_obs.map(|i| &net.observations[i]);

            // Split the measured leg into horizontal and height parts
            let (horiz, dh, sig_dh) = reduce_leg(*dist, *mode, dist_obs.sigma, vert_obs);

            // Azimuth: explicit, from the setup circle, or to the held
            // approximate target position
            let hz_obs = rec.hz;
            let az = rec.az.or_else(|| {
                let hz = hz_obs?;
                let bs = net.stations.get(rec.backsight.as_deref()?)?;
                if !bs.has_coords {
                    return None;
                }
                let az_bs = (bs.e - from.e).atan2(bs.n - from.n);
                Some(wrap_to_2pi(az_bs + hz))
            });
            let az = az.or_else(|| {
                let to = net.stations.get(&rec.to)?;
                if !to.has_coords {
                    return None;
                }
                Some(wrap_to_2pi((to.e - from.e).atan2(to.n - from.n)))
            });

            let Some(az) = az else {
                result.note = Some("no azimuth available".to_string());
                return result;
            };

            let (sin_az, cos_az) = az.sin_cos();
            result.e = Some(from.e + horiz * sin_az);
            result.n = Some(from.n + horiz * cos_az);

            // Linear propagation over (fromE, fromN, horiz, az)
            let sig_az = azimuth_sigma(net, dist_obs);
            let se_from = from.sig_e.unwrap_or(0.0);
            let sn_from = from.sig_n.unwrap_or(0.0);
            let sd = dist_obs.sigma;
            result.sig_e = Some(
                (se_from * se_from
                    + (sin_az * sd).powi(2)
                    + (horiz * cos_az * sig_az).powi(2))
                .sqrt(),
            );
            result.sig_n = Some(
                (sn_from * sn_from
                    + (cos_az * sd).powi(2)
                    + (horiz * sin_az * sig_az).powi(2))
                .sqrt(),
            );

            if let Some(dh) = dh {
                if !net.state.two_d() {
                    result.h = Some(from.h + dh);
                    let sh_from = from.sig_h.unwrap_or(0.0);
                    result.sig_h = Some((sh_from * sh_from + sig_dh * sig_dh).sqrt());
                }
            }
            result
        })
        .collect()
}

// Horizontal distance, height difference and its sigma for a sideshot
// leg: a slope distance pairs with a zenith, a horizontal one with a
// height difference
fn reduce_leg(
    dist: f64,
    mode: DistMode,
    sig_dist: f64,
    vert: Option<&Observation>,
) -> (f64, Option<f64>, f64) {
    match (mode, vert.map(|v| (&v.kind, v.sigma))) {
        (DistMode::Slope, Some((ObsKind::Zenith { value, hi, ht, .. }, sig_z))) => {
            let horiz = dist * value.sin();
            let dh = dist * value.cos() + hi - ht;
            let sig_dh = ((dist * value.sin() * sig_z).powi(2)
                + (value.cos() * sig_dist).powi(2))
            .sqrt();
            (horiz, Some(dh), sig_dh)
        }
        (_, Some((ObsKind::LevelDiff { value, .. }, sig_v))) => (dist, Some(*value), sig_v),
        _ => (dist, None, 0.0),
    }
}

// The azimuth sigma used in sideshot propagation comes from the pointing
// precision of the instrument behind the distance record
fn azimuth_sigma(net: &Network, obs: &Observation) -> f64 {
    let hz_sec = obs
        .inst
        .as_deref()
        .and_then(|code| net.instruments.get(code))
        .map_or(FALLBACK_ANGLE_SIGMA, |i| i.hz_sec);
    sec_to_rad(hz_sec)
}

fn directions_of<'a>(net: &'a Network, set_id: &'a str) -> impl Iterator<Item = &'a Observation> {
    net.observations
        .iter()
        .filter(move |o| o.set_id.as_deref() == Some(set_id))
        .filter(|o| matches!(o.kind, ObsKind::Direction { .. }))
}

#[cfg(test)]
mod tests {
    use crate::adjust::{adjust, AdjustOptions};
    use crate::parser::parse;

    #[test]
    fn suspect_score_weighs_failures() {
        // A clean single-target set: only the unpaired-shot penalty
        let net = parse("C OCC 0 0 ! !\nC BS 0 100 ! !\nC P 100 0\nDB OCC BS\nDN P 090-00-00\nDN BS 000-00-00\nDE\nD OCC P 100.0 0.005\n");
        let result = adjust(net, AdjustOptions::default());
        let targets = &result.target_diagnostics;
        assert_eq!(targets.len(), 2);
        let p = targets.iter().find(|t| t.to == "P").unwrap();
        // single raw shot: +4; balanced is false (1 vs 0): +8
        assert!(p.suspect_score >= 12.0 - 1e-9);
        assert!(p.suspect_score < 30.0);
    }

    #[test]
    fn traverse_closure_reports_ratio() {
        // A closed right-triangle-with-a-jog loop: OCC -> P1 -> P2 -> OCC
        let net = parse(
            "C OCC 0 0 ! !\nC BS 0 100 ! !\n\
             TB OCC BS\nT P1 090.0 100.0 &\nT P2 090.0 100.0 &\nTE OCC 045.0 141.4214 &\n",
        );
        let result = adjust(net, AdjustOptions::default());
        assert!(result.converged);
        let p1 = result.stations.get("P1").unwrap();
        assert!((p1.e - 100.0).abs() < 0.01 && p1.n.abs() < 0.01);
        let traverse = result.traverse.expect("traverse diagnostics");
        assert!(traverse.total_distance > 300.0);
        assert!(traverse.misclosure_mag.is_finite());
        assert!(traverse.closure_ratio > 0.0);
    }

    #[test]
    fn sideshot_with_explicit_azimuth() {
        let net = parse(
            "C A 0 0 ! !\nC B 0 100 ! !\nD A B 100.0 0.003\nSS A P1 AZ=090-00-00 50.0\n",
        );
        let result = adjust(net, AdjustOptions::default());
        assert_eq!(result.sideshots.len(), 1);
        let ss = &result.sideshots[0];
        assert!(ss.note.is_none());
        assert!((ss.e.unwrap() - 50.0).abs() < 1e-6);
        assert!(ss.n.unwrap().abs() < 1e-6);
        assert!(ss.sig_e.unwrap() > 0.0);
    }

    #[test]
    fn sideshot_without_azimuth_gets_note() {
        let net = parse("C A 0 0 ! !\nC B 0 100 ! !\nD A B 100.0 0.003\nSS A P9 50.0\n");
        let result = adjust(net, AdjustOptions::default());
        let ss = &result.sideshots[0];
        assert!(ss.e.is_none());
        assert_eq!(ss.note.as_deref(), Some("no azimuth available"));
    }

    #[test]
    fn sideshot_from_setup_circle() {
        // Traverse setup at OCC backsighting BS due north; HZ=90 swings
        // the sideshot due east
        let net = parse(
            "C OCC 0 0 ! !\nC BS 0 100 ! !\nC P1 100 0 ! !\n\
             TB OCC BS\nSS OCC T1 HZ=090-00-00 25.0\nTE P1 090.0 100.0 &\n",
        );
        let result = adjust(net, AdjustOptions::default());
        let ss = &result.sideshots[0];
        assert!(ss.note.is_none());
        assert!((ss.e.unwrap() - 25.0).abs() < 1e-6);
        assert!(ss.n.unwrap().abs() < 1e-6);
    }
}
