mod classifier;
mod config;
mod error;
mod fetch;
mod handlers;
mod labels;
mod logging;
mod models;
mod preprocess;
mod service;

use std::path::Path;

use actix_web::{middleware::Logger, web, App, HttpServer};

use crate::{config::AppConfig, logging::setup_logging, service::InferenceService};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    setup_logging(config.environment)?;

    tracing::info!(
        config = ?config,
        environment = config.environment.as_str(),
        "Loaded configuration"
    );

    fetch::ensure_cached(
        "MODEL",
        Path::new(&config.model_path),
        config.model_url.as_deref(),
    )
    .await?;
    fetch::ensure_cached(
        "LABELS",
        Path::new(&config.labels_path),
        config.labels_url.as_deref(),
    )
    .await?;

    let service = InferenceService::from_config(&config)?;
    service.warm_up()?;
    tracing::info!("Model loaded successfully");

    let service = web::Data::new(service);
    let allowed_origin = config.allowed_origin.clone();
    let max_upload_bytes = config.max_upload_bytes;

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .wrap(handlers::cors(&allowed_origin))
            .wrap(Logger::default())
            .configure(handlers::configure(max_upload_bytes))
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }

    tracing::info!(address = %config.bind_address, "Server running");
    server.bind(&config.bind_address)?.run().await?;

    Ok(())
}
