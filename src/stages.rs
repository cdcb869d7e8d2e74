use crate::error::ConfigError;
use std::time::Duration;

/// One ramp window: move linearly to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Ordered, validated stage list.
///
/// The first stage ramps up from zero VUs. A zero-duration stage jumps straight to its
/// target. Once the summed duration has elapsed the target is zero and the run is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    stages: Vec<Stage>,
    total: Duration,
}

impl RampProfile {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }

        let mut total = Duration::ZERO;
        for (index, stage) in stages.iter().enumerate() {
            total = total
                .checked_add(stage.duration)
                .ok_or_else(|| ConfigError::Stage {
                    index,
                    reason: "total duration overflows".to_string(),
                })?;
        }

        if total.is_zero() {
            return Err(ConfigError::Stage {
                index: stages.len() - 1,
                reason: "total stage duration must be greater than zero".to_string(),
            });
        }

        Ok(Self { stages, total })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target any stage asks for.
    pub fn peak_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    pub fn start_target(&self) -> usize {
        self.target_at(Duration::ZERO)
    }

    /// Desired number of active VUs `elapsed` into the run.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        if elapsed >= self.total {
            return 0;
        }

        let mut stage_start = Duration::ZERO;
        let mut from = 0usize;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let progress =
                    (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = stage.target as f64 - from as f64;
                return (from as f64 + delta * progress).max(0.0) as usize;
            }
            stage_start = stage_end;
            from = stage.target;
        }

        0
    }
}
