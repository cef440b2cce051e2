use anyhow::Context;
use clap::{Parser, Subcommand};
use hostward::config::{self, Configs, TaskConfig, TaskKind};
use hostward::{http, query, Agent};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostward")]
#[command(
    about = "Host telemetry agent: scheduled collectors, shippers, executors, and log forwarding"
)]
#[command(version)]
struct Cli {
    /// Configuration directory (default: $HOSTWARD_CONFIG_DIR, /etc/hostward if it exists, otherwise ~/.config/hostward)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured task until interrupted
    Agent,
    /// Execute a single task config once and print its envelope
    Run {
        /// Task kind: collector, shipper, or executor
        kind: TaskKind,
        /// Task config file (yaml, json, or toml)
        file: PathBuf,
    },
    /// Run all collectors once and evaluate a condition query against the results
    Check {
        /// Query such as `/r/load.LoadAvg1m > 2`
        query: String,
    },
    /// Load and validate the config directory
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = cli.config.clone().unwrap_or_else(config::default_config_dir);

    let configs = match &cli.command {
        // run and check work without a config directory
        Commands::Run { .. } | Commands::Check { .. } if !config_dir.is_dir() => {
            Ok(Configs::default())
        }
        _ => Configs::load(&config_dir),
    };

    let configured_level = configs
        .as_ref()
        .ok()
        .map(|c| c.general.log_level.clone())
        .filter(|level| !level.is_empty());
    init_tracing(cli.log_level.clone().or(configured_level));

    let configs = configs
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;

    match cli.command {
        Commands::Agent => run_agent(configs, &config_dir).await,
        Commands::Run { kind, file } => run_once(configs, kind, &file).await,
        Commands::Check { query } => check(configs, &query).await,
        Commands::Validate => {
            println!(
                "{}: {} collectors, {} shippers, {} executors, {} loggers, {} access tokens",
                config_dir.display(),
                configs.collectors.len(),
                configs.shippers.len(),
                configs.executors.len(),
                configs.loggers.len(),
                configs.access_tokens.len()
            );
            Ok(())
        }
    }
}

/// Level precedence: CLI flag, then the configured level, then `RUST_LOG`, then `info`
fn init_tracing(level: Option<String>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

async fn run_agent(configs: Configs, config_dir: &Path) -> anyhow::Result<()> {
    info!(
        config_dir = %config_dir.display(),
        tasks = configs.task_count(),
        "Starting agent"
    );

    let listen_addr = configs.general.listen_addr.clone();
    let agent = Agent::new(configs)?;
    info!(id = %agent.id(), host = %agent.host().name, "Agent identity");

    let mut supervisor = agent.run_all_forever().await?;

    let listener = tokio::net::TcpListener::bind(listen_addr.as_str())
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    let facade_agent = agent.clone();
    let token = supervisor.token().child_token();
    supervisor.spawn(async move {
        if let Err(e) = http::serve(facade_agent, listener, token).await {
            error!(error = %e, "HTTP facade stopped");
        }
    });

    info!("Agent started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    supervisor.shutdown().await;
    Ok(())
}

async fn run_once(configs: Configs, kind: TaskKind, file: &Path) -> anyhow::Result<()> {
    if kind == TaskKind::Logger {
        anyhow::bail!("loggers run continuously, use the agent command instead");
    }

    let mut task: TaskConfig = config::load_config_file(file)?;
    task.kind = kind;
    task.validate()
        .with_context(|| format!("invalid task config {}", file.display()))?;

    let agent = Agent::new(configs)?;
    let result = agent.execute(&task).await;

    match agent.get_run_by_path(&task.path_with_prefix()) {
        Some(envelope) => println!("{}", String::from_utf8_lossy(&envelope)),
        None => {
            if let Ok(output) = &result {
                println!("{}", String::from_utf8_lossy(output));
            }
        }
    }

    result?;
    Ok(())
}

async fn check(configs: Configs, query_text: &str) -> anyhow::Result<()> {
    let agent = Agent::new(configs)?;
    for collector in &agent.configs().collectors {
        if let Err(e) = agent.execute(collector).await {
            warn!(path = %collector.path, error = %e, "Collector failed");
        }
    }

    let host = agent.host();
    let passed = query::evaluate(
        query_text,
        &**agent.cache(),
        &agent.configs().general.tags,
        &host.name,
    )?;
    println!("{}", passed);

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
