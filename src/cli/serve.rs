use crate::services::delivery::DeliveryClient;
use crate::services::dispatcher::{spawn_event_dispatcher, EventQueue};
use crate::services::notification::NotificationService;
use crate::services::rate_limit::run_sweeper;
use crate::services::worker::DeliveryWorker;
use crate::web::{self, AppState};
use crate::{Config, Database};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn run(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = Config::load(config_path)?;
    let db = Database::open_with_pool_size(&config.database.path, config.database.pool_size)?;

    db.migrate()?;

    let cancel = CancellationToken::new();
    let client = DeliveryClient::new(&config.webhooks)?;

    let notifications =
        NotificationService::new(db.clone(), client.clone(), config.webhooks.max_attempts);
    let (events, rx) = EventQueue::new(config.webhooks.event_queue_capacity);
    let dispatcher = spawn_event_dispatcher(notifications, rx, cancel.clone());

    let worker = DeliveryWorker::new(db.clone(), client, &config.webhooks);
    let worker = tokio::spawn(worker.run(cancel.clone()));

    let state = Arc::new(AppState::new(config.clone(), db, events)?);
    let sweeper = tokio::spawn(run_sweeper(
        state.rate_limiter.clone(),
        config.rate_limit.sweep_interval(),
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr = format!("{}:{}", host, port);

    let result = web::serve(state, &addr, cancel.clone()).await;

    cancel.cancel();
    let (worker, sweeper, dispatcher) = tokio::join!(worker, sweeper, dispatcher);
    for (name, joined) in [("worker", worker), ("sweeper", sweeper), ("dispatcher", dispatcher)] {
        if let Err(e) = joined {
            tracing::error!("Background {} task failed: {}", name, e);
        }
    }

    result
}
