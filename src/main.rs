mod call_state;
mod config;
mod db_types;
mod dispatch;
mod engine;
mod error;
mod event;
mod handlers;
mod locks;
mod outcome;
mod ownership;
mod pg_store;
mod recording;
mod signature;
mod store;
mod tasks;
#[cfg(test)]
mod test_support;
mod types;
mod utils;
mod vapi_client;
mod vapi_types;

use crate::config::Config;
use crate::engine::CallEngine;
use crate::outcome::Classifier;
use crate::pg_store::PgStore;
use crate::recording::Downloader;
use crate::signature::SignatureVerifier;
use crate::store::{MemoryStore, Store};
use crate::types::AppState;
use crate::vapi_client::VapiClient;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const WEBHOOK_PATH: &str = "/webhook/vapi";
}

#[tokio::main]
async fn main() {
    // a missing .env is fine; the environment may already be set
    let _ = dotenvy::dotenv();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::filter::Targets::new()
                .with_targets([
                    ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
                    (
                        "interview_calls",
                        tracing_subscriber::filter::LevelFilter::DEBUG,
                    ),
                ])
                .with_default(tracing_subscriber::filter::LevelFilter::INFO),
        );
    tracing::subscriber::set_global_default(subscriber).expect("tracing already initialized");

    let config = Config::from_env().expect("invalid configuration");

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await.expect("database unavailable")),
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let platform = Arc::new(
        VapiClient::new(&config.vapi_base_url, config.http_timeout)
            .expect("failed to build platform client"),
    );
    let verifier = SignatureVerifier::new(config.server_url_secret.clone());
    if !verifier.is_enabled() {
        warn!("VAPI_SERVER_URL_SECRET not set, webhook signature verification disabled");
    }
    let (recording_tx, recording_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(
        CallEngine::new(
            store,
            platform,
            verifier,
            Classifier::new(config.thresholds.clone()),
            Arc::new(recording_tx),
        )
        .with_webhook_log(config.webhook_log_dir.clone()),
    );

    let downloader = Downloader::new(&config.recordings_dir, config.http_timeout)
        .expect("failed to build recording client");
    tokio::spawn(tasks::download_recordings(
        engine.clone(),
        downloader,
        recording_rx,
    ));
    tokio::spawn(tasks::dispatch_scheduled_calls(
        engine.clone(),
        config.dispatch_interval,
    ));
    if let Some(interval) = config.refresh_interval {
        tokio::spawn(tasks::refresh_open_calls(
            engine.clone(),
            interval,
            config.refresh_window,
        ));
    }

    let app_state = Arc::new(AppState { engine });
    let app = Router::new()
        .route(consts::WEBHOOK_PATH, post(handlers::vapi_webhook))
        .route("/calls", post(handlers::place_call))
        .route("/calls/:call_id/refresh", post(handlers::refresh_call))
        .route("/scheduled-calls/execute", post(handlers::execute_scheduled))
        .route("/scheduled-calls/:id/cancel", post(handlers::cancel_scheduled))
        .route("/", get(handlers::health))
        .with_state(app_state);

    info!(addr = %config.bind_addr, "listening");
    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}
