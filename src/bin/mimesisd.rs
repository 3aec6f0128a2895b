// Daemon entry point: wires the Transcript Watcher, Session Store, PTY
// Bridge, Commander, Gateway, and the status-file/compaction-marker poll
// loop together and serves the three Gateway ports until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimesis::commander::CommanderManager;
use mimesis::config::Config;
use mimesis::db::Db;
use mimesis::gateway::{build_api_router, build_pty_router, build_stream_router, GatewayState};
use mimesis::pty::PtyBridge;
use mimesis::store::SessionStore;
use mimesis::transcript;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mimesisd", about = "Local fleet orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground until SIGINT/SIGTERM.
    Serve {
        /// Directory the Transcript Watcher recursively watches for *.jsonl.
        #[arg(long, default_value = "~/.claude/projects")]
        projects_root: String,
        /// Working directory the Commander's `claude` CLI runs in.
        #[arg(long, default_value = ".")]
        commander_cwd: String,
        /// Command used to launch the Commander's `claude` session.
        #[arg(long, default_value = "claude")]
        commander_cli: String,
    },
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("mimesisd: failed to start async runtime: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command)) {
        Ok(()) => std::process::ExitCode::from(0),
        Err(e) => {
            eprintln!("mimesisd: {e:#}");
            std::process::ExitCode::from(e.downcast_ref::<StartupError>().map(|s| s.code()).unwrap_or(1))
        }
    }
}

#[derive(Debug)]
enum StartupError {
    Config(String),
    PortInUse(String),
}

impl StartupError {
    fn code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::PortInUse(_) => 2,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(msg) => write!(f, "configuration failure: {msg}"),
            StartupError::PortInUse(msg) => write!(f, "port in use after retry: {msg}"),
        }
    }
}
impl std::error::Error for StartupError {}

async fn run(command: Command) -> Result<()> {
    let Command::Serve {
        projects_root,
        commander_cwd,
        commander_cli,
    } = command;

    let config = Config::from_env()
        .map_err(|e| anyhow::Error::new(StartupError::Config(e.to_string())))?;
    config.ensure_dirs().context("failed to create daemon directories")?;

    if config.is_daemon_running() {
        anyhow::bail!(StartupError::Config(
            "daemon already running (pid file locked)".to_string()
        ));
    }
    config.write_pid().context("failed to write pid file")?;

    let db = Arc::new(Db::open(&config.db_path).context("failed to open database")?);
    let store = SessionStore::new();
    let pty = PtyBridge::new();

    let projects_root_path = shellexpand_home(&projects_root);
    let watcher = transcript::watcher::spawn(projects_root_path.clone());
    spawn_watcher_bridge(Arc::clone(&store), &watcher, config.max_age_hours);

    mimesis::briefing_watcher::spawn(Arc::clone(&store), Arc::clone(&db));

    let commander_cli_parts: Vec<String> = commander_cli.split_whitespace().map(String::from).collect();
    let commander = CommanderManager::spawn(
        Arc::clone(&db),
        Arc::clone(&pty),
        Arc::clone(&store),
        commander_cwd,
        commander_cli_parts,
        projects_root_path,
    )
    .await
    .context("failed to start commander")?;

    let gateway = GatewayState::new(Arc::clone(&store), Arc::clone(&pty), commander, Arc::clone(&db));

    let stream_listener = bind_with_retry(&config.stream_host, config.stream_port).await?;
    let api_listener = bind_with_retry(&config.stream_host, config.api_port).await?;
    let pty_listener = bind_with_retry(&config.stream_host, config.pty_ws_port).await?;

    tracing::info!(
        stream_port = config.stream_port,
        api_port = config.api_port,
        pty_ws_port = config.pty_ws_port,
        "mimesisd listening"
    );

    let stream_server = axum::serve(stream_listener, build_stream_router(Arc::clone(&gateway)));
    let api_server = axum::serve(api_listener, build_api_router(Arc::clone(&gateway)));
    let pty_server = axum::serve(pty_listener, build_pty_router(gateway));

    tokio::select! {
        result = stream_server => { result.context("stream server failed")?; }
        result = api_server => { result.context("api server failed")?; }
        result = pty_server => { result.context("pty server failed")?; }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping pty children");
            pty.shutdown_all(SHUTDOWN_TIMEOUT).await;
        }
    }

    config.remove_pid().ok();
    Ok(())
}

async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(_) => {
            tokio::time::sleep(BIND_RETRY_DELAY).await;
            TcpListener::bind(&addr)
                .await
                .map_err(|_| anyhow::Error::new(StartupError::PortInUse(format!("failed to bind {addr}"))))
        }
    }
}

/// Sessions whose first entry predates `MAX_AGE_HOURS` never enter the
/// Store at all — stale fleets from days-old `claude` invocations shouldn't
/// clutter a freshly started daemon's snapshot. The cutoff only gates first
/// discovery: a session already admitted keeps receiving updates regardless
/// of how long it's been running.
fn spawn_watcher_bridge(store: Arc<SessionStore>, watcher: &Arc<transcript::watcher::TranscriptWatcher>, max_age_hours: u64) {
    let mut events = watcher.events();
    let max_age = chrono::Duration::hours(max_age_hours as i64);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            };
            match event {
                transcript::watcher::WatcherEvent::Created(state) => {
                    if let Some(started_at) = state.started_at {
                        if chrono::Utc::now() - started_at > max_age {
                            continue;
                        }
                    }
                    store.add_from_watcher(&state).await;
                }
                transcript::watcher::WatcherEvent::Updated(state) => {
                    store.add_from_watcher(&state).await;
                }
                transcript::watcher::WatcherEvent::Deleted { session_id } => {
                    store.remove(&session_id).await;
                }
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn shellexpand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
