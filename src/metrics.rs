use hdrhistogram::{CreationError, Histogram};
use reqwest::Method;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const HTTP_REQS: &str = "http_reqs";
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const CHECKS: &str = "checks";
pub const VUS_MAX: &str = "vus_max";

/// Latencies are tracked in microseconds, up to one hour.
const MAX_TRACKABLE_MICROS: u64 = 3_600_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

// =============================================================================
// Samples
// =============================================================================

/// Outcome of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    pub method: Method,
    pub url: String,
    /// Zero when no response was received.
    pub status: u16,
    pub duration: Duration,
    pub timestamp: SystemTime,
    pub failed: bool,
    pub error: Option<String>,
}

impl RequestResult {
    pub fn new(method: Method, url: impl Into<String>, status: u16, duration: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            status,
            duration,
            timestamp: SystemTime::now(),
            failed: !(200..400).contains(&status),
            error: None,
        }
    }
}

#[derive(Debug)]
enum Sample {
    Request(RequestResult),
    Check { name: String, passed: bool },
    Iteration { duration: Duration },
    Interrupted { duration: Duration },
}

/// Counters readable while the run is in progress.
#[derive(Debug, Default)]
pub struct LiveCounters {
    pub active_vus: AtomicUsize,
    pub requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub iterations: AtomicU64,
}

/// Write side of the metrics pipeline. Cheap to clone, one per VU.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tx: mpsc::UnboundedSender<Sample>,
    live: Arc<LiveCounters>,
}

impl MetricsSink {
    pub fn request(&self, result: RequestResult) {
        self.live.requests.fetch_add(1, Ordering::Relaxed);
        if result.failed {
            self.live.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.send(Sample::Request(result));
    }

    pub fn check(&self, name: &str, passed: bool) {
        self.send(Sample::Check {
            name: name.to_string(),
            passed,
        });
    }

    pub fn iteration(&self, duration: Duration) {
        self.live.iterations.fetch_add(1, Ordering::Relaxed);
        self.send(Sample::Iteration { duration });
    }

    /// An iteration that was cut off before it could finish.
    pub fn interrupted(&self, duration: Duration) {
        self.send(Sample::Interrupted { duration });
    }

    pub fn live(&self) -> &Arc<LiveCounters> {
        &self.live
    }

    fn send(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            debug!("Metrics aggregator closed, dropping sample");
        }
    }
}

/// Creates a connected sink/aggregator pair.
pub fn channel(live: Arc<LiveCounters>) -> Result<(MetricsSink, Aggregator), CreationError> {
    let (tx, rx) = mpsc::unbounded_channel();
    Ok((MetricsSink { tx, live }, Aggregator::new(rx)?))
}

// =============================================================================
// Aggregation
// =============================================================================

/// Bounded-memory latency distribution.
#[derive(Debug, Clone)]
pub struct Trend {
    histogram: Histogram<u64>,
}

impl Trend {
    pub fn new() -> Result<Self, CreationError> {
        Ok(Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKABLE_MICROS, SIGNIFICANT_DIGITS)?,
        })
    }

    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros().clamp(1, MAX_TRACKABLE_MICROS as u128) as u64;
        self.histogram.saturating_record(micros);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn min_ms(&self) -> f64 {
        self.read(|h| h.min() as f64)
    }

    pub fn max_ms(&self) -> f64 {
        self.read(|h| h.max() as f64)
    }

    pub fn avg_ms(&self) -> f64 {
        self.read(|h| h.mean())
    }

    pub fn med_ms(&self) -> f64 {
        self.percentile_ms(50.0)
    }

    /// `percentile` is in `0.0..=100.0`.
    pub fn percentile_ms(&self, percentile: f64) -> f64 {
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        self.read(|h| h.value_at_quantile(quantile) as f64)
    }

    fn read(&self, f: impl FnOnce(&Histogram<u64>) -> f64) -> f64 {
        if self.histogram.len() == 0 {
            0.0
        } else {
            f(&self.histogram) / 1000.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

impl CheckTally {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    pub fn rate(&self) -> f64 {
        ratio(self.passes, self.total())
    }
}

/// Single consumer of every sample produced during a run.
pub struct Aggregator {
    rx: mpsc::UnboundedReceiver<Sample>,
    aggregate: Aggregate,
}

impl Aggregator {
    fn new(rx: mpsc::UnboundedReceiver<Sample>) -> Result<Self, CreationError> {
        Ok(Self {
            rx,
            aggregate: Aggregate::new()?,
        })
    }

    /// Runs until every sink has been dropped.
    pub fn spawn(self) -> JoinHandle<Aggregate> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Aggregate {
        while let Some(sample) = self.rx.recv().await {
            self.aggregate.ingest(sample);
        }
        debug!(
            "Metrics aggregator drained: {} requests",
            self.aggregate.req_duration.count()
        );
        self.aggregate
    }
}

/// Everything the aggregator accumulated, before the run clock is attached.
#[derive(Debug, Clone)]
pub struct Aggregate {
    req_duration: Trend,
    iteration_duration: Trend,
    failed_requests: u64,
    interrupted_iterations: u64,
    checks: BTreeMap<String, CheckTally>,
}

impl Aggregate {
    fn new() -> Result<Self, CreationError> {
        Ok(Self {
            req_duration: Trend::new()?,
            iteration_duration: Trend::new()?,
            failed_requests: 0,
            interrupted_iterations: 0,
            checks: BTreeMap::new(),
        })
    }

    fn ingest(&mut self, sample: Sample) {
        match sample {
            Sample::Request(result) => {
                self.req_duration.record(result.duration);
                if result.failed {
                    self.failed_requests += 1;
                }
            }
            Sample::Check { name, passed } => {
                let tally = self.checks.entry(name).or_default();
                if passed {
                    tally.passes += 1;
                } else {
                    tally.fails += 1;
                }
            }
            Sample::Iteration { duration } => self.iteration_duration.record(duration),
            Sample::Interrupted { duration } => {
                debug!("Iteration interrupted after {:?}", duration);
                self.interrupted_iterations += 1;
            }
        }
    }

    pub fn into_summary(self, elapsed: Duration, vus_max: usize) -> Summary {
        Summary {
            http_reqs: self.req_duration.count(),
            iterations: self.iteration_duration.count(),
            req_duration: self.req_duration,
            iteration_duration: self.iteration_duration,
            failed_requests: self.failed_requests,
            interrupted_iterations: self.interrupted_iterations,
            checks: self.checks,
            vus_max,
            elapsed,
        }
    }
}

/// Final, immutable view of a run.
#[derive(Debug, Clone)]
pub struct Summary {
    pub req_duration: Trend,
    pub iteration_duration: Trend,
    pub http_reqs: u64,
    pub failed_requests: u64,
    pub iterations: u64,
    /// Iterations aborted at the end of the graceful stop, or by a panic.
    pub interrupted_iterations: u64,
    pub checks: BTreeMap<String, CheckTally>,
    pub vus_max: usize,
    pub elapsed: Duration,
}

impl Summary {
    pub fn failed_rate(&self) -> f64 {
        ratio(self.failed_requests, self.http_reqs)
    }

    pub fn checks_total(&self) -> CheckTally {
        self.checks
            .values()
            .fold(CheckTally::default(), |acc, tally| CheckTally {
                passes: acc.passes + tally.passes,
                fails: acc.fails + tally.fails,
            })
    }

    /// Events per second over the whole run.
    pub fn per_second(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            count as f64 / secs
        } else {
            0.0
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn result(ms: u64, status: u16) -> RequestResult {
        RequestResult::new(
            Method::GET,
            "http://127.0.0.1:8000/",
            status,
            Duration::from_millis(ms),
        )
    }

    #[test]
    fn non_success_status_marks_result_failed() {
        assert!(!result(10, 200).failed);
        assert!(!result(10, 302).failed);
        assert!(result(10, 404).failed);
        assert!(result(10, 500).failed);
        assert!(result(10, 0).failed);
    }

    #[test]
    fn empty_trend_reports_zero() {
        let trend = Trend::new().unwrap();
        assert_eq!(trend.count(), 0);
        assert_eq!(trend.avg_ms(), 0.0);
        assert_eq!(trend.percentile_ms(95.0), 0.0);
    }

    #[test]
    fn percentile_estimate_converges_to_exact_value() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for &samples in &[1_000usize, 10_000, 100_000] {
            let mut trend = Trend::new().unwrap();
            let mut exact: Vec<u64> = Vec::with_capacity(samples);

            for _ in 0..samples {
                let micros = rng.random_range(1_000..2_000_000u64);
                trend.record(Duration::from_micros(micros));
                exact.push(micros);
            }

            exact.sort_unstable();
            let rank = ((0.95 * samples as f64).ceil() as usize).max(1) - 1;
            let exact_p95_ms = exact[rank] as f64 / 1000.0;
            let estimate = trend.percentile_ms(95.0);

            let relative_error = (estimate - exact_p95_ms).abs() / exact_p95_ms;
            assert!(
                relative_error < 0.01,
                "n={samples} exact={exact_p95_ms} estimate={estimate}"
            );
        }
    }

    #[tokio::test]
    async fn aggregator_collects_from_many_sinks() {
        let live = Arc::new(LiveCounters::default());
        let (sink, aggregator) = channel(live.clone()).unwrap();
        let collector = aggregator.spawn();

        let mut producers = Vec::new();
        for vu in 0..4u64 {
            let sink = sink.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    let status = if (vu * 25 + i) % 10 == 0 { 500 } else { 200 };
                    sink.request(result(40 + i, status));
                    sink.check("status is 200", status == 200);
                    sink.iteration(Duration::from_millis(1000 + i));
                }
                sink.interrupted(Duration::from_secs(3));
            }));
        }
        drop(sink);
        for producer in producers {
            producer.await.unwrap();
        }

        let summary = collector
            .await
            .unwrap()
            .into_summary(Duration::from_secs(10), 4);

        assert_eq!(summary.http_reqs, 100);
        assert_eq!(summary.iterations, 100);
        assert_eq!(summary.interrupted_iterations, 4);
        assert_eq!(summary.failed_requests, 10);
        assert!((summary.failed_rate() - 0.1).abs() < f64::EPSILON);
        assert_eq!(
            summary.checks["status is 200"],
            CheckTally {
                passes: 90,
                fails: 10
            }
        );
        assert!((summary.per_second(summary.http_reqs) - 10.0).abs() < f64::EPSILON);
        assert_eq!(live.requests.load(Ordering::Relaxed), 100);
        assert_eq!(live.failed_requests.load(Ordering::Relaxed), 10);
    }
}
