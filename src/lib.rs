pub mod batch;
pub mod config;
pub mod db;
pub mod engine;
pub mod finalize;
pub mod identity;
pub mod loader;
pub mod loadout;
pub mod parser;
pub mod rules;
pub mod snapshot;
pub mod state;
pub mod summary;

use crate::{
    config::AppConfig,
    finalize::Fight,
    loader::MatchInput,
    parser::MatchMeta,
    rules::RuleTable,
    state::MatchState,
    summary::MatchSummary,
};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Everything reconstructed from one match. The lookup structures in `state`
/// are kept so consumers can resolve identities and loadouts themselves.
#[derive(Debug, Clone)]
pub struct MatchOutput {
    pub match_id: String,
    pub meta:     MatchMeta,
    pub fights:   Vec<Fight>,
    pub summary:  MatchSummary,
    pub state:    MatchState,
}

/// Run the whole per-match pipeline: index, detect, finalize, summarize.
/// Strictly sequential; safe to call from any worker thread.
pub fn reconstruct(input: MatchInput, cfg: &AppConfig, rules: &RuleTable) -> MatchOutput {
    let MatchInput { match_id, log, snapshots, performance } = input;

    let state = MatchState::build(&log, snapshots, cfg);
    let closed = engine::detect_fights(&log.events, &state.identity, rules, cfg, &match_id);
    let fights = finalize::finalize_fights(closed, &state, cfg);
    let summary = summary::summarize(&match_id, &log, &state, &fights, &performance, cfg);

    tracing::info!("Match {}: {} events -> {} fights", match_id, log.events.len(), fights.len());
    MatchOutput { match_id, meta: log.meta, fights, summary, state }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber. With a log dir, output goes to a daily
/// rotating file and the returned guard must be held until exit (drop =
/// flush); otherwise it goes to stderr. `RUST_LOG` overrides the default
/// `fight_ledger=info` filter.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fight_ledger=info"));

    match log_dir {
        Some(dir) if !dir.as_os_str().is_empty() => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Cannot create log dir {}: {}", dir.display(), e);
            }
            let file_appender = tracing_appender::rolling::daily(dir, "fight-ledger.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(non_blocking)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        _ => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Route panic messages through tracing so they reach the log file.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        tracing::error!("PANIC at {}: {}", location, panic_message(info.payload()));
    }));
}
