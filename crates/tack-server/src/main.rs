use std::sync::Arc;

use tack_server::{app_router, AppState, NoteStore, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tack_server=info".parse().expect("valid directive")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(?config, "starting tack-server");

    let store = NoteStore::open(&config.db_path)?;
    let state = AppState {
        store: Arc::new(store),
    };
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("tack-server listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
