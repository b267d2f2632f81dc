use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use metering_proxy::env::Env;
use metering_proxy::gateway::config::{
    ConfigError, DEFAULT_MAX_BODY_BYTES, DEFAULT_USAGE_MAX_BODY_BYTES,
};
use metering_proxy::gateway::logging::init_tracing;
use metering_proxy::gateway::{GatewayHttpState, router};
use metering_proxy::{MeteringRecorder, PricingTable, ProxyConfig, SqliteStore, StreamUsagePolicy};

#[derive(Debug, Parser)]
#[command(name = "metering-proxy", version, about = "Metering reverse proxy for OpenAI-compatible APIs")]
struct Cli {
    /// SQLite file holding issued keys and the usage ledger.
    #[arg(long, env = "DATABASE_PATH", default_value = "./data/proxy.sqlite", global = true)]
    database: PathBuf,

    /// Append logs to this file in addition to stderr.
    #[arg(long, env = "PROXY_LOG_PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "PROXY_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy.
    Serve(ServeArgs),
    /// Print recorded usage for one label as JSON lines.
    Usage(UsageArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "PROXY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    #[arg(long, env = "UPSTREAM_API_KEY", hide_env_values = true)]
    upstream_api_key: Option<String>,

    #[arg(long, env = "UPSTREAM_BASE")]
    upstream_base: Option<String>,

    /// Appended as `api-version` when the client did not send one.
    #[arg(long, env = "UPSTREAM_API_VERSION")]
    api_version: Option<String>,

    /// Inline pricing overrides: `{"model": {"input": 0.005, "output": 0.015}}` (USD per 1K tokens).
    #[arg(long, env = "MODEL_PRICING_JSON")]
    pricing_json: Option<String>,

    /// Pricing overrides read from a file; applied before `--pricing-json`.
    #[arg(long, env = "MODEL_PRICING_FILE")]
    pricing_file: Option<PathBuf>,

    #[arg(long, env = "STREAM_USAGE_POLICY", value_enum, default_value_t = StreamUsagePolicy::HonorClient)]
    stream_usage_policy: StreamUsagePolicy,

    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, env = "UPSTREAM_READ_TIMEOUT_SECS", default_value_t = 60)]
    read_timeout_secs: u64,

    #[arg(long, env = "PROXY_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    #[arg(long, env = "PROXY_USAGE_MAX_BODY_BYTES", default_value_t = DEFAULT_USAGE_MAX_BODY_BYTES)]
    usage_max_body_bytes: usize,

    /// How long to keep reading an abandoned stream for its usage event.
    #[arg(long, env = "PROXY_DISCONNECT_DRAIN_SECS", default_value_t = 30)]
    disconnect_drain_secs: u64,
}

#[derive(Debug, Args)]
struct UsageArgs {
    #[arg(long)]
    label: String,

    /// Inclusive lower bound, unix milliseconds.
    #[arg(long)]
    since_ms: Option<u64>,

    /// Exclusive upper bound, unix milliseconds.
    #[arg(long)]
    until_ms: Option<u64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Environment mutation must finish before the runtime spawns worker threads.
    load_dotenv()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs, cli.log_file.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

fn load_dotenv() -> Result<(), ConfigError> {
    Env::load_dir(Path::new("."))?.apply();
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::new(&cli.database);
    store.init().await?;

    match cli.command {
        Command::Serve(args) => serve(args, store).await,
        Command::Usage(args) => {
            let rows = store
                .list_usage(&args.label, args.since_ms, args.until_ms)
                .await?;
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs, store: SqliteStore) -> Result<(), Box<dyn std::error::Error>> {
    let pricing = load_pricing(args.pricing_file.as_deref(), args.pricing_json.as_deref())?;

    let mut config = ProxyConfig::new(args.upstream_api_key.unwrap_or_default())?
        .with_api_version(args.api_version)
        .with_stream_usage_policy(args.stream_usage_policy)
        .with_timeouts(
            Duration::from_secs(args.connect_timeout_secs),
            Duration::from_secs(args.read_timeout_secs),
        )
        .with_max_body_bytes(args.max_body_bytes)
        .with_usage_max_body_bytes(args.usage_max_body_bytes)
        .with_disconnect_drain_timeout(Duration::from_secs(args.disconnect_drain_secs));
    if let Some(base) = args.upstream_base.as_deref() {
        config = config.with_upstream_base(base)?;
    }

    tracing::info!(
        config = ?config,
        database = %store.path().display(),
        priced_models = pricing.len(),
        "starting metering proxy"
    );

    let store = Arc::new(store);
    let recorder = MeteringRecorder::new(Arc::new(pricing), store.clone());
    let state = GatewayHttpState::new(&config, store, recorder)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn load_pricing(file: Option<&Path>, inline: Option<&str>) -> metering_proxy::Result<PricingTable> {
    let mut pricing = PricingTable::with_defaults();
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        pricing = pricing.merged(PricingTable::from_override_json_str(&raw)?);
    }
    if let Some(raw) = inline.map(str::trim).filter(|raw| !raw.is_empty()) {
        pricing = pricing.merged(PricingTable::from_override_json_str(raw)?);
    }
    Ok(pricing)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received ctrl-c; shutting down"),
        () = terminate => tracing::info!("received SIGTERM; shutting down"),
    }
}
