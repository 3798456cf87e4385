use config::CONFIG;
use service::app_state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod proxy;
mod security;
mod service;
mod utils;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(CONFIG.log_level.clone())),
        )
        .init();

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    info!(environment = ?CONFIG.environment, "gateway starting at {addr}");

    let state = AppState::new(CONFIG.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, proxy::create_proxy_router(state))
        .await
        .expect("failed to start server");
}
