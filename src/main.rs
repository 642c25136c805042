use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fight_ledger::{
    batch::process_bundles,
    config::{self, AppConfig},
    db::spawn_db_writer,
    init_logging,
    install_panic_hook,
    loader::find_match_bundles,
    rules::RuleTable,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fight-ledger")]
#[command(about = "Reconstruct pairwise fights from match telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct every match bundle in a data directory
    Process {
        /// Directory holding Match_<id>.json and PlayerUpdate_<id>.csv files
        #[arg(long)]
        data: PathBuf,

        /// Output directory for fights_<id>.json / summary_<id>.json (default: --data)
        #[arg(long)]
        out: Option<PathBuf>,

        /// SQLite ledger to store fights in
        #[arg(long)]
        db: Option<PathBuf>,

        /// Directory containing config.toml
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker pool size (overrides config; 0 = available parallelism)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print the active item attribution rules in match order
    Rules {
        /// Directory containing config.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(dir: Option<&Path>) -> Result<AppConfig> {
    match dir {
        Some(dir) => config::load_or_default(dir),
        None => Ok(AppConfig::default()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Process { data, out, db, config, workers } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(n) = workers {
                cfg.workers = n;
            }

            let _guard = init_logging(Some(&cfg.log_dir));
            install_panic_hook();

            let rules = RuleTable::for_config(&cfg)?;
            let bundles = find_match_bundles(&data)
                .with_context(|| format!("Failed to scan {}", data.display()))?;
            let out_dir = out.unwrap_or_else(|| data.clone());
            std::fs::create_dir_all(&out_dir)?;

            let report = process_bundles(bundles, Arc::new(cfg), Arc::new(rules)).await;

            let writer = db.as_deref().map(spawn_db_writer).transpose()?;
            for output in &report.outputs {
                write_json(&out_dir.join(format!("fights_{}.json", output.match_id)), &output.fights)?;
                write_json(&out_dir.join(format!("summary_{}.json", output.match_id)), &output.summary)?;

                if let Some(writer) = &writer {
                    if let Err(e) = writer
                        .insert_match(output.match_id.clone(), output.meta.clone(), output.fights.clone())
                        .await
                    {
                        tracing::warn!("Ledger write for match {} failed: {:#}", output.match_id, e);
                    }
                }
            }
            if let Some(writer) = writer {
                writer.shutdown();
            }

            let fights: usize = report.outputs.iter().map(|o| o.fights.len()).sum();
            println!("Processed {} matches, {} fights", report.outputs.len(), fights);
            println!("   Output: {}", out_dir.display());
            if !report.failures.is_empty() {
                println!("Failed ({}):", report.failures.len());
                for failure in &report.failures {
                    println!("   {}: {}", failure.match_id, failure.reason);
                }
            }
        }

        Commands::Rules { config } => {
            let cfg = load_config(config.as_deref())?;
            let _guard = init_logging(None);
            let rules = RuleTable::for_config(&cfg)?;
            for (i, rule) in rules.rules.iter().enumerate() {
                println!("{:>3}. {:<20} -> {}", i + 1, rule.pattern, rule.item);
            }
        }
    }

    Ok(())
}
