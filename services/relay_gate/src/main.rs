use relay_gate::{app_with_state, config::Settings, AppState};
use relay_kv::RedisStore;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();
    let settings = Settings::from_env()?;
    let store = RedisStore::shared(&settings.redis).await?;
    let state = AppState::new(settings, store)?;
    let app = app_with_state(state);
    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
