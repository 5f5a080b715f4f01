use std::time::Duration;

mod app;
mod auth;
mod config;
mod db;
mod error;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "authgate=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let app_state = state::AppState::init().await?;

    let sweep_every = Duration::from_secs(app_state.config.session.sweep_seconds.max(1));
    app::spawn_session_sweeper(app_state.sessions.clone(), sweep_every);

    app::serve(app::build_app(app_state)).await
}
