//! # Orchestrator Configuration Validator
//!
//! Command-line tool for validating orchestrator configuration files across
//! environments before starting the orchestration core.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_core::config::{ConfigManager, OrchestratorConfig, BASE_CONFIG_FILE};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate orchestrator configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate all configuration sections
    All,

    /// Validate and summarize one section
    Component {
        /// Section name (queue, backoff, circuit_breakers, events, deployment, scaling, load_balancer, health_checks)
        name: String,
    },

    /// List environments with an override file
    Environments,

    /// Print the merged configuration as JSON
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Show) => show_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<OrchestratorConfig> {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(cli.config_dir.clone()), &cli.environment)
            .with_context(|| {
                format!(
                    "loading {} for environment '{}'",
                    cli.config_dir.display(),
                    cli.environment
                )
            })?;
    Ok(manager.config().clone())
}

fn validate_all(cli: &Cli) -> Result<()> {
    println!("🔧 Validating Orchestrator Configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", cli.config_dir.display());
    println!();

    let config = load(cli)?;
    println!("✅ Configuration loaded, merged and validated");

    for section in SECTIONS {
        summarize(&config, section)?;
    }

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

const SECTIONS: [&str; 8] = [
    "queue",
    "backoff",
    "circuit_breakers",
    "events",
    "deployment",
    "scaling",
    "load_balancer",
    "health_checks",
];

fn validate_component(cli: &Cli, name: &str) -> Result<()> {
    let section = name.to_lowercase().replace('-', "_");
    if !SECTIONS.contains(&section.as_str()) {
        bail!("Unknown component: {name} (expected one of {})", SECTIONS.join(", "));
    }
    let config = load(cli)?;
    summarize(&config, &section)?;
    println!("✅ Component '{section}' validation passed!");
    Ok(())
}

fn summarize(config: &OrchestratorConfig, section: &str) -> Result<()> {
    match section {
        "queue" => {
            println!("📬 Queue");
            println!(
                "   ✅ max depth {}, {} concurrent, shed below {}",
                config.queue.max_queue_depth,
                config.queue.max_concurrent_requests,
                config.queue.shed_below_priority
            );
        }
        "backoff" => {
            println!("⏱️  Backoff");
            println!(
                "   ✅ base {}ms, max {}ms, {} attempts",
                config.backoff.base_delay_ms, config.backoff.max_delay_ms, config.backoff.max_attempts
            );
        }
        "circuit_breakers" => {
            println!("🛡️  Circuit Breakers");
            println!(
                "   ✅ enabled: {}, default threshold {}, {} override(s)",
                config.circuit_breakers.enabled,
                config.circuit_breakers.default_config.failure_threshold,
                config.circuit_breakers.component_configs.len()
            );
        }
        "events" => {
            println!("📡 Events");
            println!("   ✅ channel capacity {}", config.events.channel_capacity);
        }
        "deployment" => {
            println!("🚀 Deployment");
            let stages: Vec<&str> = config
                .deployment
                .promotion_stages
                .iter()
                .map(|s| s.name.as_str())
                .collect();
            println!("   ✅ promotion pipeline: {}", stages.join(" → "));
        }
        "scaling" => {
            println!("📈 Scaling");
            println!(
                "   ✅ evaluation every {}ms over a {}s window, {} polic(ies)",
                config.scaling.evaluation_interval_ms,
                config.scaling.metrics_window_seconds,
                config.scaling.policies.len()
            );
            for policy in &config.scaling.policies {
                println!(
                    "      • {} → {} on {} ({}..={} instances{})",
                    policy.id,
                    policy.component_id,
                    policy.target_metric,
                    policy.min_instances,
                    policy.max_instances,
                    if policy.enabled { "" } else { ", disabled" }
                );
            }
        }
        "load_balancer" => {
            println!("⚖️  Load Balancer");
            println!("   ✅ default algorithm {}", config.load_balancer.default_algorithm);
        }
        "health_checks" => {
            println!("🩺 Health Checks");
            println!(
                "   ✅ every {}ms, timeout {}ms, unhealthy after {}, healthy after {}",
                config.health_checks.interval_ms,
                config.health_checks.timeout_ms,
                config.health_checks.unhealthy_threshold,
                config.health_checks.healthy_threshold
            );
        }
        other => bail!("Unknown component: {other}"),
    }
    Ok(())
}

fn list_environments(cli: &Cli) -> Result<()> {
    println!("📋 Available Environments:");
    let dir: &Path = &cli.config_dir;
    if !dir.join(BASE_CONFIG_FILE).is_file() {
        bail!("{} not found in {}", BASE_CONFIG_FILE, dir.display());
    }

    let mut environments: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix("orchestrator.")
                .and_then(|rest| rest.strip_suffix(".yaml"))
                .filter(|env| !env.is_empty())
                .map(str::to_string)
        })
        .collect();
    environments.sort();

    for environment in environments {
        println!("  • {environment}");
    }
    Ok(())
}

fn show_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
