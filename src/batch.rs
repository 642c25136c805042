/// Bounded worker pool over independent matches.
///
/// Each match is reconstructed on a blocking worker with no shared mutable
/// state. At most `workers` run at once (a tokio semaphore gates
/// `spawn_blocking`). An error or panic in one match is logged and reported
/// in `BatchReport::failures`; siblings are unaffected and the batch never
/// aborts. Results come back in input order regardless of completion order.
use crate::{
    config::AppConfig,
    loader::{MatchBundle, MatchInput},
    panic_message,
    reconstruct,
    rules::RuleTable,
    MatchOutput,
};
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFailure {
    pub match_id: String,
    pub reason:   String,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outputs:  Vec<MatchOutput>,
    pub failures: Vec<MatchFailure>,
}

/// Run `work` over every job with at most `workers` in flight. Each job is
/// keyed for reporting; the key travels with its result.
pub async fn map_bounded<T, R, F>(jobs: Vec<(String, T)>, workers: usize, work: F) -> Vec<(String, Result<R, String>)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for (index, (key, job)) in jobs.into_iter().enumerate() {
        let work = Arc::clone(&work);
        let permits = Arc::clone(&permits);
        set.spawn(async move {
            // held until the blocking job finishes
            let _permit = permits.acquire_owned().await;
            let outcome = match tokio::task::spawn_blocking(move || work(job)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(e) if e.is_panic() => Err(format!("panicked: {}", panic_message(&*e.into_panic()))),
                Err(e) => Err(e.to_string()),
            };
            (index, key, outcome)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!("Worker task lost: {}", e),
        }
    }
    results.sort_by_key(|(index, _, _)| *index);
    results.into_iter().map(|(_, key, outcome)| (key, outcome)).collect()
}

fn collect(results: Vec<(String, Result<MatchOutput, String>)>) -> BatchReport {
    let mut report = BatchReport::default();
    for (match_id, outcome) in results {
        match outcome {
            Ok(output) => report.outputs.push(output),
            Err(reason) => {
                tracing::error!("Match {} excluded: {}", match_id, reason);
                report.failures.push(MatchFailure { match_id, reason });
            }
        }
    }
    tracing::info!(
        "Batch finished: {} matches reconstructed, {} failed",
        report.outputs.len(),
        report.failures.len()
    );
    report
}

/// Load and reconstruct every bundle.
pub async fn process_bundles(bundles: Vec<MatchBundle>, cfg: Arc<AppConfig>, rules: Arc<RuleTable>) -> BatchReport {
    let workers = cfg.worker_count();
    tracing::info!("Processing {} matches on {} workers", bundles.len(), workers);

    let jobs = bundles.into_iter().map(|b| (b.match_id.clone(), b)).collect();
    let results = map_bounded(jobs, workers, move |bundle: MatchBundle| {
        let input = bundle.load()?;
        Ok(reconstruct(input, &cfg, &rules))
    })
    .await;
    collect(results)
}

/// Reconstruct matches that are already in memory.
pub async fn process_inputs(inputs: Vec<MatchInput>, cfg: Arc<AppConfig>, rules: Arc<RuleTable>) -> BatchReport {
    let workers = cfg.worker_count();
    let jobs = inputs.into_iter().map(|i| (i.match_id.clone(), i)).collect();
    let results = map_bounded(jobs, workers, move |input: MatchInput| Ok(reconstruct(input, &cfg, &rules))).await;
    collect(results)
}
