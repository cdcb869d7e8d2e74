use crate::client::{RequestOptions, DEFAULT_REQUEST_TIMEOUT};
use crate::error::ConfigError;
use crate::scenario::{Check, CheckCondition, HttpScenario, RequestStep};
use crate::scheduler::SchedulerOptions;
use crate::stages::{RampProfile, Stage};
use crate::threshold::Threshold;
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

// =============================================================================
// Command line
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "loadramp")]
#[command(about = "Ramping HTTP load generator with latency thresholds", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a load test profile
    Run(RunArgs),
    /// Load and validate a profile without generating load
    Validate(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the JSON test profile
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Command-line values that take precedence over the profile file.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Replace the profile's stages, e.g. `--stage 10s:10 --stage 20s:10 --stage 10s:0`
    #[arg(long = "stage", value_name = "DURATION:TARGET")]
    pub stages: Vec<String>,

    /// Add a threshold, e.g. `--threshold 'http_req_duration=p(95)<500'`
    #[arg(long = "threshold", value_name = "METRIC=EXPR")]
    pub thresholds: Vec<String>,

    /// Sleep between iterations of one virtual user
    #[arg(long, env = "LOADRAMP_PACING")]
    pub pacing: Option<String>,

    /// Scheduler tick period
    #[arg(long, env = "LOADRAMP_TICK")]
    pub tick: Option<String>,

    /// Time allowed for virtual users to finish after the last stage
    #[arg(long, env = "LOADRAMP_GRACEFUL_STOP")]
    pub graceful_stop: Option<String>,

    /// Per-request timeout
    #[arg(long, env = "LOADRAMP_REQUEST_TIMEOUT")]
    pub request_timeout: Option<String>,
}

// =============================================================================
// Profile file
// =============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProfileFile {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub pacing: Option<String>,
    pub tick: Option<String>,
    pub graceful_stop: Option<String>,
    pub request_timeout: Option<String>,
    #[serde(default)]
    pub scenario: ScenarioSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub duration: String,
    pub target: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    #[serde(default)]
    pub requests: Vec<RequestSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Option<String>,
    /// Inclusive `[low, high]` status range counted as success.
    pub expected_statuses: Option<[u16; 2]>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum CheckSpec {
    Status { name: String, equals: u16 },
    MaxDuration { name: String, below: String },
    BodyContains { name: String, text: String },
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Immutable settings that drive a run, independent of which scenario executes.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub profile: RampProfile,
    pub thresholds: Vec<Threshold>,
    pub scheduler: SchedulerOptions,
    pub request_timeout: Duration,
}

impl RunOptions {
    pub fn new(profile: RampProfile) -> Self {
        Self {
            profile,
            thresholds: Vec::new(),
            scheduler: SchedulerOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.scheduler.pacing = pacing;
        self
    }
}

/// A fully validated profile file.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub options: RunOptions,
    pub scenario: HttpScenario,
}

impl TestConfig {
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content, overrides)?;
        info!("Loaded profile from {:?}", path);
        Ok(config)
    }

    pub fn from_json(content: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file: ProfileFile =
            sonic_rs::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_profile(file, overrides)
    }

    pub fn from_profile(file: ProfileFile, overrides: &Overrides) -> Result<Self, ConfigError> {
        let stages = if overrides.stages.is_empty() {
            file.stages
                .iter()
                .enumerate()
                .map(|(index, spec)| stage_from_spec(index, spec))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            overrides
                .stages
                .iter()
                .enumerate()
                .map(|(index, raw)| parse_stage_arg(index, raw))
                .collect::<Result<Vec<_>, _>>()?
        };
        let profile = RampProfile::new(stages)?;

        let mut thresholds = Vec::new();
        for (metric, exprs) in &file.thresholds {
            for expr in exprs {
                thresholds.push(Threshold::parse(metric, expr)?);
            }
        }
        for raw in &overrides.thresholds {
            let (metric, expr) = raw.split_once('=').ok_or_else(|| ConfigError::Threshold {
                metric: String::new(),
                expr: raw.clone(),
                reason: "expected METRIC=EXPR".to_string(),
            })?;
            thresholds.push(Threshold::parse(metric.trim(), expr)?);
        }

        let defaults = SchedulerOptions::default();
        let mut scheduler = SchedulerOptions {
            tick: pick("tick", &overrides.tick, &file.tick, defaults.tick)?,
            pacing: pick("pacing", &overrides.pacing, &file.pacing, defaults.pacing)?,
            graceful_stop: pick(
                "graceful_stop",
                &overrides.graceful_stop,
                &file.graceful_stop,
                defaults.graceful_stop,
            )?,
        };
        if scheduler.tick.is_zero() {
            return Err(ConfigError::Option {
                name: "tick",
                reason: "must be greater than zero".to_string(),
            });
        }

        let request_timeout = pick(
            "request_timeout",
            &overrides.request_timeout,
            &file.request_timeout,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        if request_timeout.is_zero() {
            return Err(ConfigError::Option {
                name: "request_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }

        let scenario = build_scenario(&file.scenario)?;

        // Requests still running at the deadline must end by their own timeout,
        // never by the graceful-stop abort.
        let longest_request = scenario
            .steps()
            .iter()
            .filter_map(|step| step.options.timeout)
            .fold(request_timeout, Duration::max);
        if scheduler.graceful_stop < longest_request {
            warn!(
                "graceful_stop {:?} is shorter than the request timeout; raising it to {:?}",
                scheduler.graceful_stop, longest_request
            );
            scheduler.graceful_stop = longest_request;
        }

        Ok(Self {
            options: RunOptions {
                profile,
                thresholds,
                scheduler,
                request_timeout,
            },
            scenario,
        })
    }
}

fn pick(
    name: &'static str,
    cli: &Option<String>,
    file: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match cli.as_ref().or(file.as_ref()) {
        Some(raw) => parse_duration(raw).map_err(|e| ConfigError::Option {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn stage_from_spec(index: usize, spec: &StageSpec) -> Result<Stage, ConfigError> {
    let duration = parse_duration(&spec.duration).map_err(|e| ConfigError::Stage {
        index,
        reason: e.to_string(),
    })?;
    let target = usize::try_from(spec.target).map_err(|_| ConfigError::Stage {
        index,
        reason: format!("target {} must not be negative", spec.target),
    })?;
    Ok(Stage::new(duration, target))
}

/// Parses `DURATION:TARGET`.
fn parse_stage_arg(index: usize, raw: &str) -> Result<Stage, ConfigError> {
    let (duration, target) = raw.rsplit_once(':').ok_or_else(|| ConfigError::Stage {
        index,
        reason: format!("'{}' is not DURATION:TARGET", raw),
    })?;
    let target: i64 = target.trim().parse().map_err(|_| ConfigError::Stage {
        index,
        reason: format!("'{}' is not a valid target", target),
    })?;
    stage_from_spec(
        index,
        &StageSpec {
            duration: duration.trim().to_string(),
            target,
        },
    )
}

fn build_scenario(spec: &ScenarioSpec) -> Result<HttpScenario, ConfigError> {
    if spec.requests.is_empty() {
        return Err(ConfigError::Scenario(
            "at least one request is required".to_string(),
        ));
    }

    let steps = spec
        .requests
        .iter()
        .map(build_step)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HttpScenario::new(steps))
}

fn build_step(spec: &RequestSpec) -> Result<RequestStep, ConfigError> {
    let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ConfigError::Scenario(format!("invalid method '{}'", spec.method)))?;

    let url = Url::parse(&spec.url).map_err(|e| ConfigError::Url {
        url: spec.url.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Url {
            url: spec.url.clone(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    let timeout = spec.timeout.as_deref().map(parse_duration).transpose()?;

    let expected_statuses = match spec.expected_statuses {
        Some([low, high]) if low <= high => Some(low..=high),
        Some([low, high]) => {
            return Err(ConfigError::Scenario(format!(
                "expected_statuses [{}, {}] is empty",
                low, high
            )))
        }
        None => None,
    };

    let checks = spec
        .checks
        .iter()
        .map(|check| -> Result<Check, ConfigError> {
            Ok(match check {
                CheckSpec::Status { name, equals } => Check {
                    name: name.clone(),
                    condition: CheckCondition::Status(*equals),
                },
                CheckSpec::MaxDuration { name, below } => Check {
                    name: name.clone(),
                    condition: CheckCondition::MaxDuration(parse_duration(below)?),
                },
                CheckSpec::BodyContains { name, text } => Check {
                    name: name.clone(),
                    condition: CheckCondition::BodyContains(text.clone()),
                },
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RequestStep {
        method,
        url: url.to_string(),
        options: RequestOptions {
            headers: spec
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: spec.body.clone(),
            timeout,
            expected_statuses,
        },
        checks,
    })
}

/// Parses durations such as `500ms`, `10s`, `1h`, or compounds like `1m30s`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.starts_with('-') {
        return Err(ConfigError::NegativeDuration(input.to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|_| ConfigError::Duration(input.to_string()))
}
