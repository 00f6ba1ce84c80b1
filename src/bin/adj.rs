//! Command line driver: read a `.dat` network description, run the
//! adjustment, print a compact report.

use anyhow::Context;
use clap::Parser;
use netadjust::adjust::{adjust, AdjustOptions, AdjustmentResult};
use netadjust::angles::rad_to_dms_str;
use netadjust::parser::parse;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "adj", version, about = "Weighted least-squares survey network adjustment")]
struct Cli {
    /// Network description (.dat) file
    input: PathBuf,

    /// Maximum Gauss-Newton iterations
    #[clap(long, default_value_t = 10)]
    iterations: usize,

    /// Convergence threshold on the largest correction
    #[clap(long, default_value_t = 1e-4)]
    convergence: f64,

    /// Observation ids to exclude from the solution (repeatable)
    #[clap(long)]
    exclude: Vec<usize>,

    /// Print residuals for every observation, not only the flagged ones
    #[clap(long)]
    all_residuals: bool,

    /// Verbosity (-v, -vv)
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        _ => log::Level::Debug,
    };
    simple_logger::init_with_level(level)?;

    let text = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("cannot read {}", cli.input.display()))?;

    let net = parse(&text);
    let mut options = AdjustOptions {
        max_iterations: cli.iterations,
        convergence: cli.convergence,
        ..AdjustOptions::default()
    };
    options.exclude.extend(cli.exclude.iter().copied());

    let result = adjust(net, options);
    report(&result, cli.all_residuals);

    if !result.converged {
        anyhow::bail!("adjustment did not converge");
    }
    Ok(())
}

fn report(result: &AdjustmentResult, all_residuals: bool) {
    let state = if result.converged {
        "converged"
    } else {
        "NOT CONVERGED"
    };
    println!(
        "Adjustment {state} after {} iteration(s)   [run {}]",
        result.iterations, result.id
    );
    println!(
        "Equations: {}   Parameters: {}   Degrees of freedom: {}",
        result.num_equations, result.num_params, result.dof
    );
    println!("SEUW: {:.4}   Condition estimate: {:.3e}", result.seuw, result.condition);

    if let Some(chi) = &result.chi_square {
        let verdict = if chi.pass95 { "PASS" } else { "FAIL" };
        println!(
            "Chi-square ({} dof): T = {:.3} in [{:.3}, {:.3}]  p = {:.3}  {verdict}",
            chi.dof, chi.t, chi.lower, chi.upper, chi.p_value
        );
    }

    if !result.logs.is_empty() {
        println!("\nNotes:");
        for log in &result.logs {
            println!("  {log}");
        }
    }

    println!("\nAdjusted stations:");
    for station in result.stations.iter() {
        let mut line = format!(
            "  {:<12} E {:>14.4}  N {:>14.4}",
            station.id, station.e, station.n
        );
        if station.has_height {
            line += &format!("  H {:>10.4}", station.h);
        }
        if let (Some(se), Some(sn)) = (station.sig_e, station.sig_n) {
            line += &format!("  (sE {:.4} sN {:.4})", se, sn);
        }
        if let Some(ellipse) = &station.ellipse {
            line += &format!(
                "  ellipse {:.4} x {:.4} @ {:.1}",
                ellipse.semi_major, ellipse.semi_minor, ellipse.theta_deg
            );
        }
        println!("{line}");
    }

    println!("\nObservation summary:");
    for t in &result.type_summary {
        println!(
            "  {:<10} n {:>4}  rms {:>9.4} {}  max {:>9.4}  max|t| {:>6.2}  >3: {}  >4: {}",
            t.kind, t.count, t.rms, t.unit, t.max_abs, t.max_std_res, t.over3, t.over4
        );
    }

    let flagged: Vec<_> = result
        .observations
        .iter()
        .filter(|o| {
            all_residuals
                || o.local_pass == Some(false)
                || o.std_res.map_or(false, |t| t.abs() > 3.0)
        })
        .collect();
    if !flagged.is_empty() {
        println!("\nFlagged observations:");
        for obs in flagged {
            let value = match obs.calc {
                Some(calc) if obs.kind.is_angular() => rad_to_dms_str(calc),
                Some(calc) => format!("{calc:.4}"),
                None => "-".to_string(),
            };
            println!(
                "  #{:<4} line {:<5} {:<10} calc {:>14}  v {:>10.4}  t {:>7.2}  r {:>5.2}",
                obs.id,
                obs.line,
                obs.kind.name(),
                value,
                obs.residual.unwrap_or(0.0),
                obs.local_t.or(obs.std_res).unwrap_or(0.0),
                obs.redundancy.unwrap_or(0.0),
            );
        }
    }

    if !result.constraints.is_empty() {
        println!("\nControl constraints:");
        for c in &result.constraints {
            println!(
                "  {} {}  target {:.4}  sigma {:.4}  residual {:+.4}",
                c.station, c.component, c.target, c.sigma, c.residual
            );
        }
    }

    for set in &result.set_diagnostics {
        println!(
            "\nDirection set {} at {}: {} raw / {} reduced, F1 {} F2 {} paired {}, \
             orientation {:.4} deg (SE {:.1}\"), residual rms {:.1}\" max {:.1}\"",
            set.set_id,
            set.at,
            set.raw_count,
            set.reduced_count,
            set.face1_count,
            set.face2_count,
            set.paired_targets,
            set.orientation_deg,
            set.orientation_se_sec,
            set.residual_rms_sec,
            set.residual_max_sec
        );
    }

    for target in &result.target_diagnostics {
        if target.suspect_score > 20.0 {
            println!(
                "  suspect direction {} -> {} (score {:.0}): spread {:.1}\", faces {}/{}",
                target.at,
                target.to,
                target.suspect_score,
                target.raw_spread_sec,
                target.face1_count,
                target.face2_count
            );
        }
    }

    if let Some(traverse) = &result.traverse {
        println!(
            "\nTraverse: misclosure {:.4} m over {:.1} m, closure 1:{:.0}",
            traverse.misclosure_mag, traverse.total_distance, traverse.closure_ratio
        );
    }

    if !result.sideshots.is_empty() {
        println!("\nSideshots:");
        for ss in &result.sideshots {
            match (ss.e, ss.n) {
                (Some(e), Some(n)) => {
                    let mut line = format!("  {:<12} E {e:>14.4}  N {n:>14.4}", ss.to);
                    if let Some(h) = ss.h {
                        line += &format!("  H {h:>10.4}");
                    }
                    if let (Some(se), Some(sn)) = (ss.sig_e, ss.sig_n) {
                        line += &format!("  (sE {se:.4} sN {sn:.4})");
                    }
                    println!("{line}");
                }
                _ => println!(
                    "  {:<12} not computed: {}",
                    ss.to,
                    ss.note.as_deref().unwrap_or("unknown")
                ),
            }
        }
    }
}
