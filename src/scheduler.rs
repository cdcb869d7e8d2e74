use crate::client::HttpClient;
use crate::error::{HarnessError, Result};
use crate::metrics::MetricsSink;
use crate::runner::VirtualUser;
use crate::scenario::{Scenario, VuContext};
use crate::stages::RampProfile;
use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// How often the target VU count is recomputed.
    pub tick: Duration,
    /// Sleep between iterations of one VU.
    pub pacing: Duration,
    /// How long VUs get to wind down after the deadline before being aborted.
    pub graceful_stop: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            pacing: Duration::from_secs(1),
            graceful_stop: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub elapsed: Duration,
    pub vus_max: usize,
    pub vus_started: usize,
}

struct VuHandle {
    id: usize,
    stop: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

/// Drives the VU population along the ramp profile.
pub struct Scheduler {
    profile: RampProfile,
    options: SchedulerOptions,
    scenario: Arc<dyn Scenario>,
    client: HttpClient,
    sink: MetricsSink,
}

impl Scheduler {
    pub fn new(
        profile: RampProfile,
        options: SchedulerOptions,
        scenario: Arc<dyn Scenario>,
        client: HttpClient,
        sink: MetricsSink,
    ) -> Self {
        Self {
            profile,
            options,
            scenario,
            client,
            sink,
        }
    }

    pub async fn run(self) -> Result<SchedulerStats> {
        let (deadline_tx, _) = broadcast::channel::<()>(1);
        let mut active: Vec<VuHandle> = Vec::new();
        let mut retired: Vec<JoinHandle<u64>> = Vec::new();
        let mut next_id = 0usize;
        let mut vus_max = 0usize;

        let total = self.profile.total_duration();
        let start = Instant::now();
        let deadline = start + total;
        let live = Arc::clone(self.sink.live());

        info!(
            "Starting ramp: {} stages over {:?}, peak {} VUs",
            self.profile.stages().len(),
            total,
            self.profile.peak_target()
        );

        let mut ticker = interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_log = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => break,
            }

            let elapsed = start.elapsed();
            if elapsed >= total {
                break;
            }

            if let Some(vu) = active.iter().find(|vu| vu.task.is_finished()) {
                let id = vu.id;
                abort_all(&active, &retired);
                return Err(HarnessError::Fatal(format!(
                    "virtual user {} terminated unexpectedly",
                    id
                )));
            }

            let target = self.profile.target_at(elapsed);

            while active.len() < target {
                let id = next_id;
                next_id += 1;
                active.push(self.spawn_vu(id, deadline_tx.subscribe()));
            }

            while active.len() > target {
                if let Some(vu) = active.pop() {
                    debug!("Stopping VU {}", vu.id);
                    vu.stop.send(true).ok();
                    retired.push(vu.task);
                }
            }

            retired.retain(|task| !task.is_finished());
            // Stopped VUs still finishing their last iteration are load too.
            vus_max = vus_max.max(active.len() + retired.len());

            if last_log.elapsed() >= PROGRESS_INTERVAL {
                info!(
                    "t={:.0}s target={} active={} requests={} failed={} iterations={}",
                    elapsed.as_secs_f64(),
                    target,
                    live.active_vus.load(Ordering::Relaxed),
                    live.requests.load(Ordering::Relaxed),
                    live.failed_requests.load(Ordering::Relaxed),
                    live.iterations.load(Ordering::Relaxed),
                );
                last_log = Instant::now();
            }
        }

        let elapsed = start.elapsed();
        info!(
            "Ramp complete after {:.1}s; signalling {} active VUs",
            elapsed.as_secs_f64(),
            active.len()
        );

        deadline_tx.send(()).ok();

        let tasks: Vec<JoinHandle<u64>> = active
            .into_iter()
            .map(|vu| vu.task)
            .chain(retired)
            .collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        info!(
            "Waiting for graceful shutdown (max {:?})",
            self.options.graceful_stop
        );
        match timeout(self.options.graceful_stop, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("VU task ended abnormally: {}", e);
                    }
                }
                info!("All VUs completed before timeout");
            }
            Err(_) => {
                let remaining: Vec<_> = aborts.into_iter().filter(|a| !a.is_finished()).collect();
                warn!(
                    "Graceful shutdown timeout reached, aborting {} remaining VUs",
                    remaining.len()
                );
                for abort in remaining {
                    abort.abort();
                }
            }
        }

        Ok(SchedulerStats {
            elapsed,
            vus_max,
            vus_started: next_id,
        })
    }

    fn spawn_vu(&self, id: usize, deadline: broadcast::Receiver<()>) -> VuHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = VuContext::new(id, self.client.clone(), self.sink.clone());
        let user = VirtualUser::new(
            Arc::clone(&self.scenario),
            ctx,
            self.options.pacing,
            stop_rx,
            deadline,
        );

        debug!("Starting VU {}", id);
        VuHandle {
            id,
            stop: stop_tx,
            task: tokio::spawn(user.run()),
        }
    }
}

fn abort_all(active: &[VuHandle], retired: &[JoinHandle<u64>]) {
    for vu in active {
        vu.task.abort();
    }
    for task in retired {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_REQUEST_TIMEOUT;
    use crate::metrics::{self, Aggregate, LiveCounters, RequestResult};
    use crate::stages::Stage;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use reqwest::Method;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Counts iterations per VU.
    #[derive(Default)]
    struct Probe {
        per_vu: Mutex<HashMap<usize, u64>>,
    }

    impl Scenario for Probe {
        fn iterate<'a>(&'a self, ctx: &'a mut VuContext) -> BoxFuture<'a, ()> {
            async move {
                *self.per_vu.lock().unwrap().entry(ctx.id()).or_default() += 1;
                ctx.record(RequestResult::new(
                    Method::GET,
                    "fake://",
                    200,
                    Duration::from_millis(5),
                ));
            }
            .boxed()
        }
    }

    /// Every iteration stays in flight for `latency`.
    struct Slow {
        latency: Duration,
    }

    impl Scenario for Slow {
        fn iterate<'a>(&'a self, ctx: &'a mut VuContext) -> BoxFuture<'a, ()> {
            async move {
                tokio::time::sleep(self.latency).await;
                ctx.record(RequestResult::new(Method::GET, "fake://", 200, self.latency));
            }
            .boxed()
        }
    }

    struct Panics;

    impl Scenario for Panics {
        fn iterate<'a>(&'a self, _ctx: &'a mut VuContext) -> BoxFuture<'a, ()> {
            async move {
                panic!("scenario blew up");
            }
            .boxed()
        }
    }

    fn scheduler(stages: Vec<Stage>, scenario: Arc<dyn Scenario>) -> Scheduler {
        with_options(stages, SchedulerOptions::default(), scenario).0
    }

    fn with_options(
        stages: Vec<Stage>,
        options: SchedulerOptions,
        scenario: Arc<dyn Scenario>,
    ) -> (Scheduler, JoinHandle<Aggregate>, Arc<LiveCounters>) {
        let live = Arc::new(LiveCounters::default());
        let (sink, aggregator) = metrics::channel(Arc::clone(&live)).unwrap();
        let collector = aggregator.spawn();
        let scheduler = Scheduler::new(
            RampProfile::new(stages).unwrap(),
            options,
            scenario,
            HttpClient::new(DEFAULT_REQUEST_TIMEOUT).unwrap(),
            sink,
        );
        (scheduler, collector, live)
    }

    #[tokio::test(start_paused = true)]
    async fn constant_load_is_bounded_by_pacing() {
        let probe = Arc::new(Probe::default());
        let stats = scheduler(
            vec![Stage::new(Duration::ZERO, 3), Stage::new(Duration::from_secs(5), 3)],
            probe.clone(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(stats.vus_max, 3);
        assert_eq!(stats.vus_started, 3);
        assert!(stats.elapsed >= Duration::from_secs(5));
        assert!(stats.elapsed < Duration::from_millis(5_100));

        let per_vu = probe.per_vu.lock().unwrap();
        assert_eq!(per_vu.len(), 3);
        for (&id, &count) in per_vu.iter() {
            assert!((5..=6).contains(&count), "VU {id} ran {count} iterations");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ramps_up_and_down_along_profile() {
        let probe = Arc::new(Probe::default());
        let stats = scheduler(
            vec![
                Stage::new(Duration::from_secs(10), 10),
                Stage::new(Duration::from_secs(20), 10),
                Stage::new(Duration::from_secs(10), 0),
            ],
            probe.clone(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(stats.vus_max, 10);
        assert_eq!(stats.vus_started, 10);

        // Later VUs join later, so they run fewer iterations.
        let per_vu = probe.per_vu.lock().unwrap();
        assert!(per_vu[&0] > per_vu[&9]);
        // No VU can outrun the pacing: 40s of wall clock at one iteration per second.
        assert!(per_vu.values().all(|&count| count <= 41));
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_vu_aborts_the_run() {
        let result = scheduler(
            vec![Stage::new(Duration::ZERO, 2), Stage::new(Duration::from_secs(10), 2)],
            Arc::new(Panics),
        )
        .run()
        .await;

        assert!(matches!(result, Err(HarnessError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_timeout_aborts_and_reports_stragglers() {
        let options = SchedulerOptions {
            graceful_stop: Duration::from_secs(5),
            ..SchedulerOptions::default()
        };
        let (scheduler, collector, live) = with_options(
            vec![Stage::new(Duration::ZERO, 5), Stage::new(Duration::from_secs(10), 5)],
            options,
            Arc::new(Slow {
                latency: Duration::from_secs(45),
            }),
        );

        let started = Instant::now();
        let stats = scheduler.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(16));
        assert_eq!(stats.vus_started, 5);

        let summary = collector
            .await
            .unwrap()
            .into_summary(stats.elapsed, stats.vus_max);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.interrupted_iterations, 5);
        assert_eq!(live.active_vus.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vus_max_counts_vus_still_winding_down() {
        // 4 VUs stop at t=2s mid-iteration, 4 fresh ones start at t=4s while the
        // first batch is still finishing.
        let stats = scheduler(
            vec![
                Stage::new(Duration::ZERO, 4),
                Stage::new(Duration::from_secs(2), 4),
                Stage::new(Duration::ZERO, 0),
                Stage::new(Duration::from_secs(2), 0),
                Stage::new(Duration::ZERO, 4),
                Stage::new(Duration::from_secs(2), 4),
            ],
            Arc::new(Slow {
                latency: Duration::from_secs(10),
            }),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(stats.vus_started, 8);
        assert_eq!(stats.vus_max, 8);
    }
}
