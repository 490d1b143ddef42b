mod api;
mod events;
mod send;
mod session;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wagate_core::config::{self, Config, LoggingConfig};
use wagate_core::session::SessionFilter;
use wagate_store::Store;
use wagate_whatsapp::{Emulator, EmulatorConfig};

use events::{Dispatcher, DispatcherConfig, SinkRegistry};
use send::MediaFetcher;
use session::SessionManager;

#[derive(Parser)]
#[command(
    name = "wagate",
    version,
    about = "Multi-tenant WhatsApp session gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file.
    #[arg(short, long, env = "WAGATE_CONFIG", default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default).
    Serve,
    /// Print the effective configuration and stored sessions.
    Status,
}

/// Install the global subscriber. The guard must live as long as the process
/// when file logging is on.
fn init_logging(cfg: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.filter_directive()));
    let stdout = tracing_subscriber::fmt::layer();

    match cfg.dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wagate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let mut cfg = config::load(path)?;
    cfg.apply_env();
    Ok(cfg)
}

/// Load the config while `bootstrap` collects its log lines. Logging settings
/// live in the config, so the real subscriber can only be installed after.
fn load_config_logged<S>(path: &str, bootstrap: S) -> anyhow::Result<Config>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::with_default(bootstrap, || load_config(path))
}

/// Cancel the returned token on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {e}");
                    let _ = ctrl_c.await;
                    info!("received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, shutting down");
        }

        cancel.cancel();
        debug!("signal handler completed");
    });

    token
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    cfg.validate()?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.server.bind_addr()))?;

    let store = Store::new(&cfg.database).await?;
    let registry = Arc::new(SinkRegistry::load(store.clone(), &cfg.webhook).await?);
    if registry.has_global() {
        info!("global webhook enabled");
    }
    let dispatcher = Dispatcher::new(registry, DispatcherConfig::from(&cfg.webhook));
    let factory = Arc::new(Emulator::new(EmulatorConfig::from(&cfg.whatsapp)));
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        dispatcher.clone(),
        factory,
        &cfg,
    ));

    let report = manager.restore_all().await?;
    info!(
        restored = report.restored,
        reconnecting = report.reconnecting,
        orphan_devices = report.orphan_devices,
        "sessions restored"
    );

    let state = api::AppState::new(
        manager.clone(),
        MediaFetcher::new(&cfg.media),
        &cfg.server.api_key,
    );
    let router = api::build_router(state, cfg.server.body_limit_bytes);

    let shutdown = install_signal_handler();
    let served = api::serve(addr, router, shutdown.clone()).await;
    shutdown.cancel();

    info!("stopping session runtimes");
    manager.shutdown_all().await;
    dispatcher.shutdown().await;
    store.close().await;
    info!("gateway stopped");

    served.with_context(|| format!("API server on {addr} failed"))
}

async fn status(cli_config: &str, cfg: &Config) -> anyhow::Result<()> {
    println!("wagate status\n");
    println!("Config:   {cli_config}");
    println!("Listen:   {}", cfg.server.bind_addr());
    println!("Database: {}", cfg.database.url);
    println!(
        "API key:  {}",
        if cfg.server.api_key.is_empty() {
            "missing"
        } else {
            "configured"
        }
    );
    println!(
        "Webhook:  {}",
        cfg.webhook.global_url.as_deref().unwrap_or("none")
    );
    println!();

    let store = Store::new(&cfg.database).await?;
    let all = store.count_sessions(&SessionFilter::default()).await?;
    let online = store
        .count_sessions(&SessionFilter {
            connected: Some(true),
            ..SessionFilter::default()
        })
        .await?;
    println!("  sessions: {all} ({online} meant to be online)");
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let cfg = load_config_logged(&cli.config, bootstrap)?;
    let _guard = init_logging(&cfg.logging);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("wagate {} starting", env!("CARGO_PKG_VERSION"));
            serve(cfg).await
        }
        Commands::Status => status(&cli.config, &cfg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_config_fallback_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let captured = Captured::default();
        let writer = captured.clone();
        let bootstrap = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let cfg = load_config_logged(path.to_str().unwrap(), bootstrap).unwrap();
        assert_eq!(cfg.database.max_connections, Config::default().database.max_connections);

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("Config file not found"), "{logs}");
    }
}
