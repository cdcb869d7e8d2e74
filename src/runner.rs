use crate::metrics::{LiveCounters, MetricsSink};
use crate::scenario::{Scenario, VuContext};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// One simulated client looping over the scenario.
///
/// Two ways out: the scheduler flips `stop` when scaling down (the current iteration
/// finishes first), or the run-wide `deadline` fires. Neither interrupts an iteration
/// in flight; both cut the pacing sleep short.
pub struct VirtualUser {
    scenario: Arc<dyn Scenario>,
    ctx: VuContext,
    pacing: Duration,
    stop: watch::Receiver<bool>,
    deadline: broadcast::Receiver<()>,
}

impl VirtualUser {
    pub fn new(
        scenario: Arc<dyn Scenario>,
        ctx: VuContext,
        pacing: Duration,
        stop: watch::Receiver<bool>,
        deadline: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            scenario,
            ctx,
            pacing,
            stop,
            deadline,
        }
    }

    /// Returns the number of completed iterations.
    pub async fn run(mut self) -> u64 {
        let id = self.ctx.id();
        let _active = ActiveGuard::enter(Arc::clone(self.ctx.sink().live()));
        debug!("VU {} started", id);

        let mut iterations = 0u64;

        while !self.should_stop() {
            self.ctx.set_iteration(iterations);
            let in_flight = InFlightIteration::start(self.ctx.sink().clone());
            self.scenario.iterate(&mut self.ctx).await;
            in_flight.complete();
            iterations += 1;

            if self.should_stop() {
                break;
            }

            tokio::select! {
                _ = self.deadline.recv() => {
                    debug!("VU {} interrupted by deadline while pacing", id);
                    break;
                }
                _ = stopped(&mut self.stop) => {
                    debug!("VU {} stopped while pacing", id);
                    break;
                }
                _ = sleep(self.pacing) => {}
            }
        }

        debug!("VU {} finished after {} iterations", id, iterations);
        iterations
    }

    fn should_stop(&mut self) -> bool {
        if *self.stop.borrow() {
            return true;
        }
        !matches!(
            self.deadline.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

/// Holds one slot of `active_vus` for as long as the VU task lives, including when the
/// task is aborted or panics.
struct ActiveGuard(Arc<LiveCounters>);

impl ActiveGuard {
    fn enter(live: Arc<LiveCounters>) -> Self {
        live.active_vus.fetch_add(1, Ordering::Relaxed);
        Self(live)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_vus.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Records the iteration when it completes, or reports it as interrupted when dropped
/// before that.
struct InFlightIteration {
    sink: MetricsSink,
    started: Instant,
    completed: bool,
}

impl InFlightIteration {
    fn start(sink: MetricsSink) -> Self {
        Self {
            sink,
            started: Instant::now(),
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
        self.sink.iteration(self.started.elapsed());
    }
}

impl Drop for InFlightIteration {
    fn drop(&mut self) {
        if !self.completed {
            self.sink.interrupted(self.started.elapsed());
        }
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
