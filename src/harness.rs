use crate::client::HttpClient;
use crate::config::RunOptions;
use crate::error::{HarnessError, Result};
use crate::metrics::{self, LiveCounters, Summary};
use crate::scenario::Scenario;
use crate::scheduler::Scheduler;
use crate::threshold::{self, ThresholdOutcome};
use std::sync::Arc;
use tracing::{info, warn};

/// Exit code when every threshold holds.
pub const EXIT_PASSED: u8 = 0;
/// Exit code when at least one threshold fails.
pub const EXIT_THRESHOLDS_FAILED: u8 = 99;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: Summary,
    pub thresholds: Vec<ThresholdOutcome>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|outcome| outcome.passed)
    }

    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            EXIT_PASSED
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }
}

/// Runs `scenario` along the configured ramp and judges the result.
///
/// Thresholds are only evaluated once the last VU has stopped; a failing threshold is
/// reported in the outcome, not as an error.
pub async fn execute(options: &RunOptions, scenario: Arc<dyn Scenario>) -> Result<RunOutcome> {
    let live = Arc::new(LiveCounters::default());
    let (sink, aggregator) = metrics::channel(live)?;
    let collector = aggregator.spawn();
    let client = HttpClient::new(options.request_timeout)?;

    // Requests at the deadline are given their full timeout before any VU is aborted.
    let mut scheduler_options = options.scheduler;
    scheduler_options.graceful_stop = scheduler_options.graceful_stop.max(options.request_timeout);

    let scheduler = Scheduler::new(
        options.profile.clone(),
        scheduler_options,
        scenario,
        client,
        sink,
    );
    let stats = scheduler.run().await?;

    let aggregate = collector
        .await
        .map_err(|e| HarnessError::Fatal(format!("metrics aggregator failed: {}", e)))?;
    let summary = aggregate.into_summary(stats.elapsed, stats.vus_max);
    if summary.interrupted_iterations > 0 {
        warn!(
            "{} iterations were interrupted before completing",
            summary.interrupted_iterations
        );
    }

    let thresholds = threshold::evaluate_all(&options.thresholds, &summary);
    info!(
        "Run finished: {} requests, {} iterations, {}/{} thresholds passed",
        summary.http_reqs,
        summary.iterations,
        thresholds.iter().filter(|t| t.passed).count(),
        thresholds.len()
    );

    Ok(RunOutcome {
        summary,
        thresholds,
    })
}
