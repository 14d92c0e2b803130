use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use leadfunnel_server::state::AppState;

/// `leadfunnel health` - liveness check for container health checks.
///
/// Calls `GET http://127.0.0.1:$LEADFUNNEL_PORT/health` and exits 0 on
/// HTTP 200, 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("LEADFUNNEL_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://127.0.0.1:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(|s| s.as_str()) == Some("health") {
        run_health_check();
    }

    // Structured JSON logging. Level controlled via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leadfunnel=info".parse()?),
        )
        .json()
        .init();

    let cfg = leadfunnel_server::config::Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/leadfunnel.db", cfg.data_dir);
    let db = leadfunnel_duckdb::DuckDbEventStore::open(&db_path, &cfg.duckdb_memory_limit)?;

    info!(
        timezone = %cfg.default_timezone,
        workers = cfg.worker_count,
        fetch_timeout_ms = cfg.fetch_timeout_ms,
        cache_ttl_secs = cfg.cache_ttl_secs,
        forecast_days = cfg.forecast_days,
        channels = ?cfg.channels.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        "Funnel engine configured"
    );

    let addr = format!("0.0.0.0:{}", cfg.port);
    let state = Arc::new(AppState::new(db, cfg.clone()));
    let app = leadfunnel_server::app::build_app(state);

    info!(port = cfg.port, "leadfunnel listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("leadfunnel stopped");
    Ok(())
}
