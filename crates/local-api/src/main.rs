use tracing::info;
use tracing_subscriber::EnvFilter;

use tabs_local_api::{AppState, router};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("tabs-local: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = tabs_config::config_path()?;
    let cfg = tabs_config::load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.local.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let base_dir = tabs_daemon::paths::ensure_base_dir()?;
    let state = AppState::new(base_dir, config_path, cfg.local.ui_port);
    let app = router(state);

    let addr = format!("127.0.0.1:{}", cfg.local.ui_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "tabs-local listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
