//! McpBridge daemon
//!
//! Loads configuration, binds the Unix-domain socket, runs the bridge until
//! SIGINT/SIGTERM, then shuts it down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use mcpbridge_core::branding::{self, CONFIG_ENV, SOCKET_ENV};
use mcpbridge_core::{BridgeConfig, EventReceiver, SnapshotStore};
use mcpbridge_gateway::{Bridge, BridgeDependencies, TokioProcessSpawner, UnixSocketTransport};
use mcpbridge_storage::{EnvKeyProvider, SnapshotCipher, FileSnapshotStore, MasterKeyProvider};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the transport → bridge event channel
const TRANSPORT_CHANNEL_CAPACITY: usize = 1024;

/// Config file looked up in the data dir when `MCPBRIDGE_CONFIG` is unset
const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Initialize tracing with console and file logging
///
/// - Console: colored, compact format
/// - File: daily rotation in ~/.local/share/mcpbridge/logs/ (Linux)
///
/// The returned guard must be kept alive for the duration of the program.
pub fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::filter::Directive;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let logs_dir = branding::logs_dir();
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
    }

    // mcpbridge.2026-01-22.log
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(branding::LOG_PREFIX)
        .filename_suffix("log")
        .build(&logs_dir)
        .context("Failed to create log file appender")?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG takes precedence; crate targets use underscores
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        [
            "mcpbridge_core=debug",
            "mcpbridge_gateway=debug",
            "mcpbridge_storage=debug",
            "mcpbridge_daemon=debug",
        ]
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new("info"), |filter, directive| {
            filter.add_directive(directive)
        })
    });

    let console_layer = fmt::layer()
        .with_ansi(true)
        .compact()
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Build the config from an optional file and an optional socket override
pub fn resolve_config(config_path: Option<&Path>, socket_override: Option<&str>) -> Result<BridgeConfig> {
    let mut config = match config_path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(socket) = socket_override.filter(|s| !s.is_empty()) {
        config.socket_path = PathBuf::from(socket);
    }
    Ok(config)
}

/// Config from `MCPBRIDGE_CONFIG`, else `<data dir>/config.json` if present, else defaults
pub fn load_config() -> Result<BridgeConfig> {
    let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let fallback = branding::data_dir().join(DEFAULT_CONFIG_FILE);
    let path = explicit.or_else(|| fallback.exists().then_some(fallback));
    let socket = std::env::var(SOCKET_ENV).ok();

    let config = resolve_config(path.as_deref(), socket.as_deref())?;
    match &path {
        Some(path) => info!(path = %path.display(), "[Daemon] Loaded config"),
        None => info!("[Daemon] Using default config"),
    }
    Ok(config)
}

/// Snapshot store for `snapshotPath`, encrypted when `MCPBRIDGE_SNAPSHOT_KEY` is set
fn snapshot_store(config: &BridgeConfig) -> Result<Option<Arc<dyn SnapshotStore>>> {
    let Some(dir) = &config.snapshot_path else {
        return Ok(None);
    };
    let mut store = FileSnapshotStore::new(dir);

    let keys = EnvKeyProvider;
    if keys.key_exists() {
        let key = keys.get_or_create_key()?;
        store = store.with_cipher(Arc::new(SnapshotCipher::new(&key)?));
        info!(dir = %dir.display(), "[Daemon] Encrypted snapshots enabled");
    } else {
        info!(dir = %dir.display(), "[Daemon] Snapshots enabled");
    }
    Ok(Some(Arc::new(store)))
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(event_type = event.type_name(), "[Daemon] Event {}", json),
            Err(_) => debug!(event_type = event.type_name(), "[Daemon] Event"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "[Daemon] Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "[Daemon] Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[Daemon] Received Ctrl+C"),
        _ = terminate => info!("[Daemon] Received SIGTERM"),
    }
}

/// Run the bridge until a shutdown signal arrives
pub async fn run(config: BridgeConfig) -> Result<()> {
    info!(
        "Starting {} v{}",
        branding::DISPLAY_NAME,
        env!("CARGO_PKG_VERSION")
    );
    info!("Logs directory: {}", branding::logs_dir().display());

    let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
    let transport = Arc::new(UnixSocketTransport::new(transport_tx));
    let _accept_loop = transport
        .listen(&config.socket_path)
        .with_context(|| format!("Failed to bind {}", config.socket_path.display()))?;

    let snapshot_store = snapshot_store(&config)?;
    let bridge = Bridge::new(
        config,
        BridgeDependencies {
            transport: transport.clone(),
            spawner: Arc::new(TokioProcessSpawner::new()),
            snapshot_store,
        },
    );
    tokio::spawn(log_events(bridge.subscribe()));

    bridge.start(transport_rx).await?;
    info!(
        socket = %bridge.config().socket_path.display(),
        "[Daemon] Bridge listening"
    );

    shutdown_signal().await;
    bridge.shutdown().await;
    Ok(())
}
