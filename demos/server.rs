//! Example server: entity declarations from `RESTGATE_ENTITIES`, PostgreSQL from `DATABASE_URL`,
//! mounts common routes and the REST surface under the configured prefix.

use restgate::{app_router, load_entities_from_path, AppState, Dispatcher, PgStorage, RestConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("restgate=info".parse()?))
        .init();

    let config = RestConfig::from_env()?;
    let entities_path = std::env::var("RESTGATE_ENTITIES").unwrap_or_else(|_| "entities.json".into());
    let entities = load_entities_from_path(&entities_path)?;
    tracing::info!(path = %entities_path, count = entities.entities.len(), "entities loaded");

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/restgate".into());
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let storage = Arc::new(PgStorage::new(pool, entities, config.max_limit));
    let dispatcher = Dispatcher::for_storage(config, storage)?;
    let app = app_router(AppState::new(dispatcher));

    let addr = std::env::var("RESTGATE_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
