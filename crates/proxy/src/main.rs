use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use toolscope_mcp_proxy::config::ProxyConfig;
use toolscope_mcp_proxy::runtime::ProxyRuntime;
use toolscope_mcp_proxy::server::{ListChangedNotifier, ProxyServer, spawn_update_forwarder};
use toolscope_store::Store;

/// How long shutdown waits for in-flight work before forcing closure.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "toolscope-mcp-proxy",
    version,
    about = "Expose a curated toolset aggregated from many MCP servers"
)]
struct Cli {
    /// Path to the proxy configuration file (YAML or JSON).
    #[arg(long)]
    config: PathBuf,

    /// Directory for the embedded state store (saved toolsets,
    /// preferences). Defaults to the platform data directory.
    #[arg(long, env = "TOOLSCOPE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Namespace separator between server and tool names, overriding the
    /// config file.
    #[arg(long)]
    separator: Option<String>,

    /// Accept tools whose callable contract drifted since their toolset
    /// was saved.
    #[arg(long)]
    insecure: bool,

    /// Expose administrative and toolset tools together, without the mode
    /// split.
    #[arg(long)]
    legacy_combined_mode: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    let code = run(cli).await;
    std::process::exit(code);
}

/// Exit codes: 0 normal shutdown, 1 configuration load failure, 2 routing
/// or front-end initialization failure.
async fn run(cli: Cli) -> i32 {
    let mut config = match ProxyConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %cli.config.display(), error = %e, "failed to load configuration");
            return 1;
        }
    };
    if let Some(separator) = cli.separator.clone() {
        if separator.is_empty() {
            tracing::error!("--separator must not be empty");
            return 1;
        }
        config.proxy.namespace_separator = separator;
    }
    if cli.insecure {
        config.proxy.secure_mode = false;
    }
    if cli.legacy_combined_mode {
        config.proxy.legacy_combined_mode = true;
    }

    let store = match open_store(cli.state_dir.clone()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open state store");
            return 2;
        }
    };

    let runtime = ProxyRuntime::build(&config, store);
    let initial_mode = runtime.start().await;
    tracing::info!(
        servers = config.servers.len(),
        mode = ?initial_mode,
        "proxy initialized"
    );

    let notifier = Arc::new(ListChangedNotifier::new());
    spawn_update_forwarder(&runtime.toolsets, &notifier, tokio_util::sync::CancellationToken::new());

    let server = ProxyServer::new(
        Arc::clone(&runtime.connections),
        Arc::clone(&runtime.discovery),
        Some(Arc::clone(&runtime.router)),
        Arc::clone(&runtime.toolsets),
        Arc::clone(&notifier),
        initial_mode,
        config.proxy.legacy_combined_mode,
    );

    // MCP is served on stdout; logging stays on stderr.
    let (stdin, stdout) = rmcp::transport::io::stdio();
    let running = match rmcp::ServiceExt::serve(server, (stdin, stdout)).await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!(error = %e, "failed to start front-end MCP server");
            runtime.stop().await;
            return 2;
        }
    };
    notifier.observe_peer(running.peer().clone());
    tracing::info!("front-end serving on stdio");

    tokio::select! {
        result = running.waiting() => match result {
            Ok(_) => tracing::info!("peer disconnected"),
            Err(e) => tracing::warn!(error = %e, "front-end task ended abnormally"),
        },
        () = shutdown_signal() => tracing::info!("shutdown signal received"),
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, runtime.stop())
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period elapsed; forcing exit");
    }
    0
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn open_store(state_dir: Option<PathBuf>) -> anyhow::Result<Store> {
    let dir = match state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create state dir {}", dir.display()))?;
    Store::open(dir.join("state"))
        .with_context(|| format!("open state store in {}", dir.display()))
}

fn default_state_dir() -> anyhow::Result<PathBuf> {
    if let Ok(v) = std::env::var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(v).join("toolscope"));
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("toolscope"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
