use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

use campaign_common::datasets::{CachedDatasets, PgDatasetLoader};
use campaign_common::metrics::{serve, setup_metrics_routes};
use campaign_engine::deploy::{DeploymentOrchestrator, PgTargetWriter, TargetDatabases};
use campaign_engine::engine::CampaignEngine;
use campaign_engine::filters::FilterPipeline;
use campaign_engine::identifiers::{MaxScanAllocator, PgIdentifierStore};

mod config;
mod handlers;

fn build_engine(config: &Config) -> Result<CampaignEngine> {
    // The reference cache owns its pool; target writes use dedicated connections.
    let reference_pool = PgPoolOptions::new()
        .max_connections(config.max_reference_connections)
        .connect_lazy(&config.reference_database_url)?;
    let datasets = CachedDatasets::new(
        Arc::new(
            PgDatasetLoader::new(reference_pool)
                .with_aliases(config.datasets.dataset_aliases.0.clone()),
        ),
        config.dataset_cache_ttl_secs.0,
        config.dataset_cache_capacity,
    );

    let campaign_options: PgConnectOptions = config.campaign_database_url.parse()?;
    let user_lists_options: PgConnectOptions = config.user_lists_database_url.parse()?;

    let store = PgIdentifierStore::new(
        campaign_options.clone(),
        Some(config.campaign_schema.as_str()),
    )?;

    let writer = PgTargetWriter::new(TargetDatabases {
        campaign: campaign_options,
        campaign_schema: Some(config.campaign_schema.clone()),
        user_lists: user_lists_options,
        user_lists_schema: Some(config.user_lists_schema.clone()),
        batch_size: config.insert_batch_size,
    })?;

    Ok(CampaignEngine::new(
        Arc::new(MaxScanAllocator::new(store)),
        FilterPipeline::new(Arc::new(datasets), (&config.datasets).into()),
        DeploymentOrchestrator::new(Arc::new(writer)),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let engine = build_engine(&config)?;

    let app = handlers::add_routes(
        Router::new(),
        engine,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app)?;

    let bind = config.bind();
    info!("campaign api listening on {}", bind);

    match serve(app, &bind).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start campaign-api http server, {}", e),
    }

    Ok(())
}
