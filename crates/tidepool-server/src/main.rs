use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use tidepool_proto::JsonCodec;
use tidepool_server::telemetry::Telemetry;
use tidepool_server::{
    router, AppState, BusyPolicy, EmptyControllerFactory, ServerConfig, SessionRegistry,
};

#[derive(Debug, Parser)]
#[command(
    name = "tidepool-server",
    author,
    version,
    about = "Presentation-model remoting server (long-poll command transport)"
)]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "TIDEPOOL_LISTEN_ADDR", default_value = "127.0.0.1:8910")]
    listen_addr: String,

    /// Upper bound, in milliseconds, on how long a long poll stays parked.
    #[arg(long, env = "TIDEPOOL_MAX_POLL_TIME_MS", default_value_t = 20_000)]
    max_poll_time_ms: u64,

    /// Run the garbage collector every N poll cycles (0 disables it).
    #[arg(long, env = "TIDEPOOL_GC_EVERY_POLLS", default_value_t = 1)]
    gc_every_polls: u64,

    /// What a concurrent batch for an already-active session gets.
    #[arg(long, env = "TIDEPOOL_BUSY_POLICY", value_enum, default_value_t = BusyPolicy::Wait)]
    busy_policy: BusyPolicy,

    /// Sessions quiet for longer than this are recycled.
    #[arg(long, env = "TIDEPOOL_SESSION_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    session_idle_timeout_secs: u64,

    /// How often the session recycler sweeps.
    #[arg(long, env = "TIDEPOOL_RECYCLE_INTERVAL_SECS", default_value_t = 30)]
    recycle_interval_secs: u64,
}

struct BinConfig {
    listen_addr: SocketAddr,
    server: ServerConfig,
}

impl TryFrom<Cli> for BinConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(BinConfig {
            listen_addr,
            server: ServerConfig {
                max_poll_time: Duration::from_millis(cli.max_poll_time_ms),
                gc_every_polls: cli.gc_every_polls,
                busy_policy: cli.busy_policy,
                session_idle_timeout: Duration::from_secs(cli.session_idle_timeout_secs),
                recycle_interval: Duration::from_secs(cli.recycle_interval_secs),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = BinConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        max_poll_time_ms = config.server.max_poll_time.as_millis() as u64,
        busy_policy = ?config.server.busy_policy,
        "starting tidepool server"
    );

    let registry = SessionRegistry::new(config.server.clone(), Arc::new(EmptyControllerFactory));
    let recycler_handle = registry.spawn_recycler();

    let app = router(Arc::new(AppState {
        registry,
        codec: Arc::new(JsonCodec),
        metrics: Some(telemetry.metrics_handle()),
    }));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tidepool listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    recycler_handle.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
