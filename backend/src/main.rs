use std::env;

use backend::{app, load_topics, sample_topics, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let topics = match env::var("TOPICS_PATH") {
        Ok(path) => load_topics(&path).await.expect("load topics"),
        Err(_) => sample_topics(),
    };

    let state = if let Ok(path) = env::var("PERSIST_PATH") {
        AppState::with_persistence(topics, path).await
    } else {
        AppState::new(topics)
    };

    let addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let app = app(state);
    tracing::info!(%addr, "starting server");
    axum::serve(
        tokio::net::TcpListener::bind(&addr).await.expect("bind"),
        app,
    )
    .await
    .expect("server error");
}
