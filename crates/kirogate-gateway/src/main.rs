use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod admission;
mod app;
mod http;
mod synth;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kirogate=info,tower_http=debug".into()),
        )
        .init();

    let config = kirogate_core::config::KirogateConfig::load()?;

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::new(config)?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("kirogate listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
