//! `steadfast`: validate reliability policies and dry-run them against
//! scripted model outcomes.

mod script;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use steadfast_core::{ReliabilityConfig, RetryStrategy};
use steadfast_runtime::{ExecutionError, Executor, MemoryAlertSink, MemoryCounterStore};

use script::Script;

#[derive(Parser)]
#[command(name = "steadfast", about = "Reliability policies for LLM calls", version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Agent type the policy applies to
    #[arg(long, global = true, default_value = "CliAgent")]
    agent_type: String,

    /// Tenant for breaker and budget keys
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config and print the effective policy
    Validate {
        /// YAML or JSON config file
        config: PathBuf,
    },
    /// Print the model chain and retry schedule for a primary model
    Plan {
        config: PathBuf,

        /// Primary model
        #[arg(short, long)]
        primary: String,
    },
    /// Run the executor against scripted outcomes
    Simulate {
        config: PathBuf,

        /// Primary model
        #[arg(short, long)]
        primary: String,

        /// Outcomes per model, e.g. `m1=timeout,ok`
        #[arg(short, long = "script")]
        scripts: Vec<String>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<ReliabilityConfig> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config = if is_json {
        ReliabilityConfig::from_json_file(path)
    } else {
        ReliabilityConfig::from_yaml_file(path)
    };
    config.with_context(|| format!("Invalid config '{}'", path.display()))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn plan(config: &ReliabilityConfig, primary: &str) -> anyhow::Result<serde_json::Value> {
    let retry = RetryStrategy::from_config(&config.retries)?;
    let schedule: Vec<_> = (0..retry.max_retries())
        .map(|attempt| {
            json!({
                "retry": attempt + 1,
                "delay_ms": millis(retry.deterministic_delay_for(attempt)),
                "max_delay_with_jitter_ms": millis(retry.max_jittered_delay_for(attempt)),
            })
        })
        .collect();

    Ok(json!({
        "models": config.models_to_try(primary),
        "retry_mode": config.retry_mode,
        "retry_schedule": schedule,
        "circuit_breaker": config.circuit_breaker,
        "total_timeout_secs": config.total_timeout.map(|t| t.as_secs_f64()),
    }))
}

async fn simulate(
    cli: &Cli,
    config: ReliabilityConfig,
    primary: &str,
    scripts: &[String],
) -> anyhow::Result<bool> {
    let mut script = Script::parse(scripts)?;
    let alerts = Arc::new(MemoryAlertSink::new());

    let executor = Executor::new(config, primary, cli.agent_type.as_str(), cli.tenant.as_deref())?
        .with_store(Arc::new(MemoryCounterStore::new()))
        .with_alerts(alerts.clone());

    info!(models = ?executor.models_to_try(), "Simulating execution");

    let outcome = executor
        .execute_optional(|model| {
            let next = script.next(&model);
            async move { next.play(&model).await }
        })
        .await;

    let (succeeded, report) = match outcome {
        Ok(execution) => (
            true,
            json!({
                "status": "succeeded",
                "model": execution.model,
                "value": execution.value,
                "models_tried": execution.models_tried,
                "elapsed_ms": millis(execution.elapsed),
                "attempts": execution.attempts,
            }),
        ),
        Err(err) => {
            let kind = match &err {
                ExecutionError::TotalTimeout { .. } => "total_timeout",
                ExecutionError::AllModelsExhausted { .. } if err.is_circuit_open() => "circuit_open",
                ExecutionError::AllModelsExhausted { .. } => "all_models_exhausted",
                ExecutionError::BudgetExceeded { .. } => "budget_exceeded",
                ExecutionError::Aborted { .. } => "aborted",
            };
            (
                false,
                json!({
                    "status": "failed",
                    "kind": kind,
                    "error": err.to_string(),
                    "last_error": err.last_error().map(ToString::to_string),
                    "models_tried": err.models_tried(),
                    "attempts": err.attempts(),
                }),
            )
        }
    };

    let mut report = report;
    report["alerts"] = serde_json::to_value(alerts.alerts())?;
    print_json(&report)?;
    Ok(succeeded)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "steadfast=debug" } else { "steadfast=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Validate { config } => {
            let parsed = load_config(config)?;
            info!(path = %config.display(), "Config is valid");
            print_json(&serde_json::to_value(&parsed)?)?;
        }
        Commands::Plan { config, primary } => {
            let parsed = load_config(config)?;
            print_json(&plan(&parsed, primary)?)?;
        }
        Commands::Simulate {
            config,
            primary,
            scripts,
        } => {
            let parsed = load_config(config)?;
            if !simulate(&cli, parsed, primary, scripts).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
