//! CLI entrypoint for the shadowscan harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use shadowscan_harness::{HarnessError, StormConfig, scenario};

/// Fault scenario tooling for shadowscan.
#[derive(Debug, Parser)]
#[command(name = "shadowscan-harness")]
#[command(about = "Drive the shadowscan detector through known faults")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run fault scenarios and check the reported bug types.
    Scenario {
        /// Scenario to run (all scenarios when omitted).
        #[arg(long)]
        name: Option<String>,
        /// Detector configuration as JSON (defaults to SHADOWSCAN_OPTIONS).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Evidence directory for reports, the JSONL log and the artifact index.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run identifier used in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
        /// Print report text to stderr.
        #[arg(long)]
        show_reports: bool,
    },
    /// List the scenario catalog.
    List,
    /// Fault from many threads at once and count report banners.
    Storm {
        /// Worker threads.
        #[arg(long, default_value_t = 8)]
        threads: usize,
        /// Overflowing accesses per thread.
        #[arg(long, default_value_t = 4)]
        faults: usize,
        /// Report every fault instead of only the first.
        #[arg(long)]
        multi_shot: bool,
        /// Detector configuration as JSON (defaults to SHADOWSCAN_OPTIONS).
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON result path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective detector configuration.
    Config {
        /// Detector configuration as JSON (defaults to SHADOWSCAN_OPTIONS).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenario {
            name,
            config,
            output,
            run_id,
            show_reports,
        } => {
            let detector_config = shadowscan_harness::load_config(config.as_deref())?;
            let results = match name {
                Some(name) => {
                    let found =
                        scenario::find(&name).ok_or(HarnessError::UnknownScenario(name))?;
                    vec![found.run(&detector_config)?]
                }
                None => scenario::run_all(&detector_config)?,
            };

            for result in &results {
                let verdict = if result.passed { "PASS" } else { "FAIL" };
                eprintln!(
                    "[{verdict}] {} expected={} observed={}",
                    result.scenario,
                    result.expected,
                    result.observed.as_deref().unwrap_or("<none>")
                );
                if show_reports && let Some(text) = &result.report {
                    eprint!("{text}");
                }
            }

            if let Some(dir) = output {
                let paths = shadowscan_harness::write_bundle(&dir, &run_id, &results)?;
                eprintln!(
                    "Wrote {} report(s), log {} and index {}",
                    paths.reports.len(),
                    paths.log.display(),
                    paths.index.display()
                );
            }

            let failed = results.iter().filter(|r| !r.passed).count();
            if failed > 0 {
                return Err(format!("{failed} scenario(s) failed").into());
            }
        }
        Command::List => {
            for s in scenario::SCENARIOS {
                println!("{:<16} {:<22} {}", s.name, s.bug_type, s.summary);
            }
        }
        Command::Storm {
            threads,
            faults,
            multi_shot,
            config,
            output,
        } => {
            let mut detector_config = shadowscan_harness::load_config(config.as_deref())?;
            detector_config.multi_shot |= multi_shot;
            let result = shadowscan_harness::run_storm(
                &detector_config,
                StormConfig {
                    threads,
                    faults_per_thread: faults,
                },
            )?;
            let body = serde_json::to_string_pretty(&result)?;
            if let Some(path) = output {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, body)?;
                eprintln!("Wrote storm result to {}", path.display());
            } else {
                println!("{body}");
            }
            if !result.passed {
                return Err(format!(
                    "Storm failed: banners={} reported={} suppressed={}",
                    result.banners, result.reported, result.suppressed
                )
                .into());
            }
        }
        Command::Config { config } => {
            let detector_config = shadowscan_harness::load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&detector_config)?);
        }
    }

    Ok(())
}
