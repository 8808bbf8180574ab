//! Analytics service: time-bucketed weight and fill averages for charts.
//!
//! # Environment variables
//! | Var                                | Default                  |
//! |------------------------------------|--------------------------|
//! | `DATABASE_URL`                     | required                 |
//! | `ANALYTICS_CONFIG`                 | `config/analytics.toml`  |
//! | `ANALYTICS__HTTP_ADDR`             | `0.0.0.0:5001`           |
//! | `ANALYTICS__DISPLAY_OFFSET_MINUTES`| `420` (+07:00)           |
//! | `RUST_LOG`                         | `analytics_service=info` |

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use analytics_service::{
    config,
    engine::AggregationEngine,
    handlers::{self, AppState},
    source::PgSampleSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("analytics_service=info".parse()?),
        )
        .json()
        .init();

    let cfg = config::load()?;
    cfg.log_summary();
    let offset = cfg.display_offset()?;
    let default_interval = cfg.default_interval()?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let source = PgSampleSource::connect(&database_url, cfg.max_connections).await?;

    let app = handlers::router(Arc::new(AppState {
        engine: AggregationEngine::new(Arc::new(source), offset),
        default_interval,
    }));

    let listener = TcpListener::bind(&cfg.http_addr).await?;
    info!(addr = %cfg.http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        })
        .await?;

    info!("analytics-service stopped");
    Ok(())
}
