//! CLI entrypoint for the knight workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use knight_core::KnightConfig;
use knight_harness::structured_log::{ArtifactIndex, LogEmitter, sha256_hex, validate_log_file};
use knight_harness::workload::parse_seed;
use knight_harness::{HarnessError, RunOptions, Scenario, ScenarioReport, run_scenario};

/// Replay allocator workloads and collect evidence.
#[derive(Debug, Parser)]
#[command(name = "knight-harness")]
#[command(about = "Workload harness for the knight allocators")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run allocator scenarios and report invariant checks.
    Run {
        /// Scenario to run; repeat for several. Defaults to all.
        #[arg(long, value_enum)]
        scenario: Vec<Scenario>,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Operations per scenario.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Structured JSONL log path (if omitted, the log is only hashed).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output JSON report path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Artifact index JSON path linking the log and report digests.
        #[arg(long)]
        artifact_index: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
    /// Print the configuration picked up from the `KNIGHT_*` environment.
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenario,
            seed,
            ops,
            log,
            output,
            artifact_index,
        } => {
            let seed = parse_seed(&seed).map_err(|source| HarnessError::Seed {
                raw: seed.clone(),
                source,
            })?;
            let options = RunOptions {
                seed,
                ops,
                config: KnightConfig::from_env(),
            };
            let scenarios = if scenario.is_empty() {
                Scenario::all().to_vec()
            } else {
                scenario
            };

            let run_id = format!("run-{seed:x}");
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_sink(&run_id),
            };

            let mut reports: Vec<ScenarioReport> = Vec::with_capacity(scenarios.len());
            for scenario in scenarios {
                eprintln!("Running {} (seed={seed:#x}, ops={ops})", scenario.as_str());
                let report = run_scenario(scenario, &options, &mut emitter)?;
                for check in report.failed_checks() {
                    eprintln!("  FAIL {}: {}", check.name, check.detail);
                }
                reports.push(report);
            }
            emitter.flush()?;

            let failed = reports.iter().filter(|r| !r.passed()).count();
            let body = serde_json::to_string_pretty(&serde_json::json!({
                "run_id": &run_id,
                "seed": seed,
                "ops": ops,
                "log_sha256": emitter.digest(),
                "log_lines": emitter.lines(),
                "failed": failed,
                "reports": &reports,
            }))?;

            match &output {
                Some(path) => std::fs::write(path, &body)?,
                None => println!("{body}"),
            }

            if let Some(path) = artifact_index {
                let mut index = ArtifactIndex::new(&run_id);
                if let Some(log) = &log {
                    index.add(
                        log.display().to_string(),
                        "log",
                        emitter.digest(),
                        Some(emitter.bytes_written()),
                    );
                }
                if let Some(out) = &output {
                    index.add(
                        out.display().to_string(),
                        "report",
                        sha256_hex(body.as_bytes()),
                        Some(body.len() as u64),
                    );
                }
                std::fs::write(&path, index.to_json()?)?;
                eprintln!("Artifact index written to {}", path.display());
            }

            if failed > 0 {
                return Err(HarnessError::ScenariosFailed {
                    failed,
                    total: reports.len(),
                }
                .into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            println!(
                "{}",
                serde_json::json!({
                    "log": log.display().to_string(),
                    "lines": lines,
                    "errors": errors.len(),
                    "valid": errors.is_empty(),
                })
            );
            if !errors.is_empty() {
                return Err(format!("{} invalid field(s) in {}", errors.len(), log.display()).into());
            }
        }
        Command::Config => {
            let config = KnightConfig::from_env();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "page_size": config.memory.page_size,
                    "granularity": config.memory.granularity,
                    "lump_size": config.lump_size,
                    "code_region_size": config.code_region_size,
                    "lifecycle_log": config.lifecycle_log,
                }))?
            );
        }
    }

    Ok(())
}
