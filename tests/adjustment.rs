//! End-to-end adjustment scenarios: parse a network description, run the
//! engine, check the adjusted coordinates and the reported statistics.

use netadjust::adjust::{adjust, AdjustOptions};
use netadjust::observation::ObsKind;
use netadjust::parser::parse;

#[test]
fn simple_three_station_network() {
    // A and B held, U a free intersection point determined by two
    // distances and the angle at U
    let dat = "
        C A 0 0 ! !
        C B 200 0 ! !
        C U 100 80
        D A U 128.0625 0.003
        D B U 128.0625 0.003
        A U B A 102-40-49.3 1.5
    ";
    let result = adjust(parse(dat), AdjustOptions::default());

    assert!(result.success);
    assert!(result.converged);
    let u = result.stations.get("U").unwrap();
    assert!((u.e - 100.0).abs() < 1e-3, "U.e = {}", u.e);
    assert!((u.n - 80.0).abs() < 1e-3, "U.n = {}", u.n);
    assert!(result.sideshots.is_empty());

    // The dof identity: equations + constraints - parameters
    assert_eq!(result.num_equations, 3);
    assert_eq!(result.num_params, 2);
    assert_eq!(result.dof, 1);
}

#[test]
fn observation_ids_are_dense_and_lines_positive() {
    let dat = "
        C A 0 0 ! !
        C B 100 0
        D A B 100.0 0.01
        B A B 090-00-00 2.0
        G A B 100.0 0.0 0.01
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    for (i, obs) in result.observations.iter().enumerate() {
        assert_eq!(obs.id, i);
        assert!(obs.line > 0);
        assert!(obs.sigma > 0.0);
    }
}

#[test]
fn map_scale_stretches_adjusted_distance() {
    let base = "
        C A 0 0 ! !
        C B 100 0
        B A B 090-00-00 1.0
        D A B 100.0000 0.002
    ";
    let result = adjust(parse(base), AdjustOptions::default());
    assert!(result.converged);
    let b_plain = result.stations.get("B").unwrap().e;

    let scaled = format!(".MAPMODE ON\n.MAPSCALE 0.9996\n{base}");
    let result = adjust(parse(&scaled), AdjustOptions::default());
    assert!(result.converged);
    let b_scaled = result.stations.get("B").unwrap().e;

    // The grid observation maps to a longer ground distance
    let stretch = b_scaled - b_plain;
    assert!(
        (stretch - 0.04).abs() < 0.002,
        "stretch = {stretch} (plain {b_plain}, scaled {b_scaled})"
    );
}

#[test]
fn curvature_refraction_shifts_heights() {
    let base = "
        .3D
        C A 0 0 100 ! ! !
        C B 10000 0 100 ! !
        V A B 90-00-00 2.0
    ";
    let result = adjust(parse(base), AdjustOptions::default());
    assert!(result.converged);
    let h_plain = result.stations.get("B").unwrap().h;
    // A level sight with no reduction leaves the height alone
    assert!((h_plain - 100.0).abs() < 0.01);

    let curved = format!(".CURVREF ON\n.REFRACTION 0.13\n{base}");
    let result = adjust(parse(&curved), AdjustOptions::default());
    assert!(result.converged);
    let h_curved = result.stations.get("B").unwrap().h;

    // (1 - 0.13) * 10000 / (2 R) of zenith correction over 10 km is
    // nearly 7 m of height
    assert!(
        (h_curved - h_plain) > 1.0,
        "curvature shift = {}",
        h_curved - h_plain
    );
    assert!((h_curved - h_plain - 6.82).abs() < 0.1);
}

#[test]
fn direction_set_reduction_and_orientation() {
    // Two faces on each of two targets from a held setup
    let dat = "
        C OCC 0 0 ! !
        C BS 0 100 ! !
        C P 100 0
        DB OCC BS
        DN BS 000-00-00
        DN BS 180-00-02
        DN P 090-00-01
        DN P 270-00-03
        DE
        D OCC P 100.0 0.005
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);

    assert_eq!(result.set_diagnostics.len(), 1);
    let set = &result.set_diagnostics[0];
    assert_eq!(set.raw_count, 4);
    assert_eq!(set.reduced_count, 2);
    assert_eq!(set.face1_count, 2);
    assert_eq!(set.face2_count, 2);
    assert_eq!(set.paired_targets, 2);

    // Orientation of a set backsighting north with a zero reading
    let ori = set.orientation_deg.rem_euclid(360.0);
    assert!(ori < 0.01 || ori > 359.99, "orientation {ori}");

    // The reduced direction to P pairs 90-00-01 and 90-00-03
    let p_dir = result
        .observations
        .iter()
        .find_map(|o| match &o.kind {
            ObsKind::Direction { to, value, .. } if to == "P" => Some(*value),
            _ => None,
        })
        .unwrap();
    let expect = netadjust::angles::dms_to_rad("090-00-02").unwrap();
    assert!((p_dir - expect).abs() < netadjust::angles::sec_to_rad(0.1));
}

#[test]
fn traverse_closure_is_reported() {
    let dat = "
        C OCC 0 0 ! !
        C BS 0 100 ! !
        TB OCC BS
        T P1 090.0 100.0 &
        T P2 090.0 100.0 &
        TE OCC 045.0 141.4214 &
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    let traverse = result.traverse.expect("closed traverse diagnostics");
    assert!((traverse.total_distance - 341.4214).abs() < 1e-3);
    assert!(traverse.misclosure_mag < 0.01);
    assert!(traverse.closure_ratio > 1000.0);
}

#[test]
fn correlated_baseline_solves_exactly() {
    let dat = "
        C A 0 0 ! !
        C B 90 190
        G A B 100.0 200.0 0.01 0.03 0.25
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    let b = result.stations.get("B").unwrap();
    assert!((b.e - 100.0).abs() < 1e-6);
    assert!((b.n - 200.0).abs() < 1e-6);

    // GPS contributes two equations
    assert_eq!(result.num_equations, 2);
    assert_eq!(result.dof, 0);

    let obs = &result.observations[0];
    assert!(obs.residual.unwrap().abs() < 1e-6);
    match &obs.kind {
        ObsKind::Baseline { rho, .. } => assert!((rho - 0.25).abs() < 1e-12),
        _ => panic!("expected a baseline"),
    }
}

#[test]
fn weighted_constraints_split_the_difference() {
    // B carries 10 mm constraints at (100, 0); an equally weighted
    // distance says 100.5. The solution lands halfway.
    let dat = "
        C A 0 0 ! !
        C B 100 0 0.01 0.01
        D A B 100.5 0.01
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    let b = result.stations.get("B").unwrap();
    assert!((b.e - 100.25).abs() < 1e-3, "B.e = {}", b.e);

    // 1 distance + 2 constraint rows - 2 parameters
    assert_eq!(result.num_equations, 3);
    assert_eq!(result.dof, 1);
    assert_eq!(result.constraints.len(), 2);

    let chi = result.chi_square.expect("dof > 0 has a variance test");
    assert!(chi.t > 0.0);
    assert!(result.seuw > 0.0);
}

#[test]
fn leveling_network_adjusts_heights() {
    let dat = "
        .3D
        E BM1 100.0 !
        E BM2 110.0 !
        L BM1 P 5.0 1.0 2.0
        L P BM2 5.2 1.0 2.0
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    let p = result.stations.get("P").unwrap();
    // The runs disagree (105.0 vs 104.8); equal weights split the difference
    assert!((p.h - 104.9).abs() < 1e-6, "P.h = {}", p.h);
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("no horizontal observation")));
}

#[test]
fn redundant_network_produces_full_statistics() {
    // An over-determined quadrilateral with a deliberate small bias on
    // one distance
    let dat = "
        C A 0 0 ! !
        C B 100 0 ! !
        C U 50 80
        D A U 94.3398 0.003
        D B U 94.3398 0.003
        D A B 100.004 0.003
        A U B A 64-00-40 2.0
        B A U 032-00-20 2.0
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    assert!(result.dof > 0);
    assert!(result.seuw > 0.0);
    assert!(result.chi_square.is_some());

    // Every active observation got the full treatment
    for obs in result.observations.iter().filter(|o| !o.sideshot) {
        if matches!(obs.kind, ObsKind::Distance { .. } | ObsKind::Angle { .. }) {
            assert!(obs.calc.is_some(), "obs {} has no calc", obs.id);
            assert!(obs.residual.is_some());
            assert!(obs.redundancy.is_some());
        }
    }

    // Relative precision covers the one free station against none other,
    // so it is empty; station sigmas exist instead
    let u = result.stations.get("U").unwrap();
    assert!(u.sig_e.unwrap() > 0.0);
    assert!(u.sig_n.unwrap() > 0.0);
    assert!(u.ellipse.is_some());
}

#[test]
fn relative_precision_between_free_stations() {
    let dat = "
        C A 0 0 ! !
        C B 200 0 ! !
        C U 50 80
        C W 150 80
        D A U 94.3398 0.003
        D B U 170.0 0.004
        D A W 170.0 0.004
        D B W 94.3398 0.003
        D U W 100.0 0.003
        A U B A 93-55-58.4 2.0
        A W B A 93-55-58.4 2.0
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    let pair = result
        .relative_precision
        .iter()
        .find(|r| (r.from == "U" && r.to == "W") || (r.from == "W" && r.to == "U"))
        .expect("relative precision for the free pair");
    assert!(pair.distance > 90.0);
    assert!(pair.semi_major >= pair.semi_minor);
    assert!(pair.sig_dist >= 0.0);
    assert!(pair.sig_az_sec >= 0.0);
}

#[test]
fn sideshots_ride_along_without_weight() {
    let dat = "
        C A 0 0 ! !
        C B 200 0 ! !
        C U 100 80
        D A U 128.0625 0.003
        D B U 128.0625 0.003
        A U B A 102-40-49.3 1.5
        SS A P1 AZ=045-00-00 70.7107
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);

    // The sideshot does not change the solve
    assert_eq!(result.num_equations, 3);
    let ss = &result.sideshots[0];
    assert!((ss.e.unwrap() - 50.0).abs() < 1e-3);
    assert!((ss.n.unwrap() - 50.0).abs() < 1e-3);
}

#[test]
fn two_d_mode_drops_vertical_observations() {
    let dat = "
        C A 0 0 ! !
        C B 100 0
        D A B 100.0 0.005
        B A B 090-00-00 2.0
        L A B 1.5 1.0
    ";
    let result = adjust(parse(dat), AdjustOptions::default());
    assert!(result.converged);
    // The leveling line parses but contributes no equation in 2D
    assert_eq!(result.observations.len(), 3);
    assert_eq!(result.num_equations, 2);
}

#[test]
fn divergent_network_reports_not_converged() {
    // Free station with a hopeless starting point and a tight iteration cap
    let dat = "
        C A 0 0 ! !
        C B 100 0 ! !
        C U 0.001 0.001
        D A U 5000 0.01
        D B U 5000 0.01
        A U B A 060-00-00 2.0
    ";
    let options = AdjustOptions {
        max_iterations: 1,
        ..AdjustOptions::default()
    };
    let result = adjust(parse(dat), options);
    assert!(!result.converged);
    assert!(result
        .logs
        .iter()
        .any(|l| l.contains("no convergence") || l.contains("Matrix Inversion Failed")));
}
