mod config;
mod db;
mod error;
mod http;
mod ledger;
mod migration;
mod orchestrator;
mod proxy;
mod transport;

use std::sync::Arc;

use config::AppConfig;
use http::AppState;
use orchestrator::RetrievalService;
use proxy::health::HealthRegistry;
use sea_orm::EntityTrait;
use sea_orm_migration::MigratorTrait;
use transport::MailTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("MailCard starting...");
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);

    // Connect to database
    let db = db::connect(&config.database.url).await?;

    // Run migrations
    migration::Migrator::up(&db, None).await?;
    tracing::info!("Database migrations complete");

    // Health registry, seeded from the persisted proxy counters
    let registry = Arc::new(
        HealthRegistry::new(config.fetch.unreachable_after).with_store(db.clone()),
    );
    let endpoints = db::entities::proxy_endpoint::Entity::find().all(&db).await?;
    registry.sync_endpoints(&endpoints).await;
    tracing::info!("Loaded {} proxy endpoint(s)", endpoints.len());

    // Real transport behind the fetcher seam
    let transport = Arc::new(MailTransport::new(
        config.fetch.connect_timeout(),
        config.fetch.attempt_timeout(),
    ));
    let service = Arc::new(RetrievalService::new(
        db.clone(),
        registry.clone(),
        transport,
    ));

    // Build router
    let state = AppState {
        db,
        registry,
        service,
    };
    let app = http::build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("MailCard API listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
