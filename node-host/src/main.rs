use std::sync::Arc;

use node_host::{api, channel::ChannelHub, config::Config, handlers::BoundaryHandlers, AppState};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_host=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        install_home = %config.install_home.display(),
        network = %config.default_network,
        "node-host starting"
    );

    let hub = ChannelHub::new();
    let handlers = BoundaryHandlers::from_config(&config, hub.clone())?;
    handlers.session().refresh().await?;
    let supervisor = handlers.supervisor().clone();

    let state = Arc::new(AppState { handlers, hub });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    // Loopback only: the UI process is the sole client.
    let addr = format!("127.0.0.1:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    supervisor.shutdown().await;
    let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !supervisor.registry().is_empty().await {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(pids = ?supervisor.running_pids().await, "node processes still exiting");
    }
    info!("node processes stopped");
    Ok(())
}
