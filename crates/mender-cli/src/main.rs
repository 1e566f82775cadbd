//! mender command-line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use mender_core::{ErrorCategory, ErrorClassifier, ErrorReport, HealthReport, RecoveryStrategy};
use mender_runtime::{Resilience, RuntimeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mender")]
#[command(about = "Failure classification, health checks and recovery strategies for local AI services")]
#[command(version)]
struct Cli {
    /// Runtime config file (YAML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every configured service and print the aggregate
    Health {
        /// Ignore cached probe results
        #[arg(long)]
        force: bool,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify an error message and show the strategy it gets
    Classify {
        /// Error text, as it would appear in a log
        message: String,

        /// Extra context folded into classification (e.g. "skill execution: weather")
        #[arg(long)]
        context: Option<String>,
    },

    /// Print the effective recovery strategy table
    Strategies {
        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },

    /// Check a config file against the schema
    ValidateConfig {
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::ValidateConfig { path } => {
            RuntimeConfig::from_file(&path)
                .with_context(|| format!("{} is not a valid mender config", path.display()))?;
            println!("{}: ok", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Classify { message, context } => {
            let config = load_config(&cli.config)?;
            let classifier = ErrorClassifier::with_strategies(config.strategy_table());
            print!("{}", describe_classification(&classifier, &message, context.as_deref()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Strategies { format } => {
            let config = load_config(&cli.config)?;
            println!("{}", render_strategies(&config, format)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Health { force, json } => {
            let config = load_config(&cli.config)?;
            let resilience = Resilience::from_config(config)?;
            let report = resilience.health().overall_health(force).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", describe_health(&report));
            }

            Ok(if report.is_ready() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "mender=debug" } else { "mender=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<RuntimeConfig> {
    RuntimeConfig::load(path.as_deref()).context("failed to load runtime config")
}

fn describe_classification(
    classifier: &ErrorClassifier,
    message: &str,
    context: Option<&str>,
) -> String {
    let report = ErrorReport::new(message);
    let category = classifier.classify(&report, context);
    let strategy = classifier.strategy(category);

    let mut out = format!("category:    {category}\n");
    out.push_str(&format!("strategy:    {}\n", describe_strategy(&strategy)));
    if let Some(wait) = classifier.retry_after(&report) {
        out.push_str(&format!("retry after: {}s\n", wait.as_secs()));
    }
    out
}

fn describe_strategy(strategy: &RecoveryStrategy) -> String {
    if !strategy.should_retry || strategy.max_retries == 0 {
        return "no retry".to_string();
    }
    let jitter = if strategy.use_jitter { ", jitter" } else { "" };
    format!(
        "{} retries, {}ms base, x{}{jitter}",
        strategy.max_retries, strategy.base_delay_ms, strategy.backoff_multiplier
    )
}

fn render_strategies(config: &RuntimeConfig, format: Format) -> anyhow::Result<String> {
    let table: BTreeMap<ErrorCategory, RecoveryStrategy> = config.strategy_table().iter().collect();
    let rendered = match format {
        Format::Yaml => serde_yaml::to_string(&table)?,
        Format::Json => serde_json::to_string_pretty(&table)?,
    };
    Ok(rendered.trim_end().to_string())
}

fn describe_health(report: &HealthReport) -> String {
    let mut out = format!("overall: {}\n", report.overall);
    for service in &report.services {
        out.push_str(&format!("  {:<10} {}", service.service, service.status));
        if let Some(ms) = service.response_time_ms {
            out.push_str(&format!(" ({ms}ms)"));
        }
        if let Some(error) = &service.error {
            out.push_str(&format!(" - {error}"));
        }
        out.push('\n');
    }
    out
}
