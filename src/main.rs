use anyhow::{Context, Result};
use clap::Parser;
use loadramp::config::{Cli, Command, RunArgs};
use loadramp::{report, ConfigError, HarnessError, TestConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const EXIT_FATAL: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 104;

fn load(args: &RunArgs) -> Result<TestConfig> {
    TestConfig::load(&args.config, &args.overrides)
        .with_context(|| format!("Failed to load profile {:?}", args.config))
}

fn print_banner(config: &TestConfig) {
    let options = &config.options;

    info!("════════════════════════════════════════════════════════════");
    info!("                    LOADRAMP HTTP LOAD TEST");
    info!("════════════════════════════════════════════════════════════");
    for (i, stage) in options.profile.stages().iter().enumerate() {
        info!(
            "Stage {}: {:?} -> {} VUs",
            i + 1,
            stage.duration,
            stage.target
        );
    }
    info!("Total Duration: {:?}", options.profile.total_duration());
    info!("Pacing: {:?}", options.scheduler.pacing);
    for step in config.scenario.steps() {
        info!("Request: {} {}", step.method, step.url);
    }
    for threshold in &options.thresholds {
        info!("Threshold: {}", threshold);
    }
    info!("════════════════════════════════════════════════════════════");
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Command::Validate(args) => {
            let config = load(&args)?;
            print_banner(&config);
            info!("Profile is valid");
            Ok(0)
        }
        Command::Run(args) => {
            let config = load(&args)?;
            print_banner(&config);

            let scenario = Arc::new(config.scenario.clone());
            let outcome = loadramp::execute(&config.options, scenario)
                .await
                .context("Load test aborted")?;

            report::print_summary(&outcome);
            Ok(outcome.exit_code())
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let invalid_config = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<HarnessError>(),
                Some(HarnessError::Config(_))
            )
    });

    if invalid_config {
        EXIT_INVALID_CONFIG
    } else {
        EXIT_FATAL
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}
