//! Ramping HTTP load generator.
//!
//! A [`stages::RampProfile`] decides how many virtual users should be active at each
//! instant. The [`scheduler::Scheduler`] grows and shrinks the population on a fixed
//! tick, each [`runner::VirtualUser`] loops a [`scenario::Scenario`] with a pacing sleep,
//! and every result flows over a channel into a single [`metrics::Aggregator`]. When the
//! run ends, [`threshold::Threshold`]s are evaluated against the final
//! [`metrics::Summary`] to decide the exit code.

pub mod client;
pub mod config;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod stages;
pub mod threshold;

pub use config::{RunOptions, TestConfig};
pub use error::{ConfigError, HarnessError, RequestError};
pub use harness::{execute, RunOutcome};
pub use scenario::{Scenario, VuContext};
pub use stages::{RampProfile, Stage};
pub use threshold::Threshold;
