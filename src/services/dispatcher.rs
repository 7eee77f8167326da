//! Bounded hand-off from request handlers to [`NotificationService::publish`].

use crate::services::notification::NotificationService;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventQueueError {
    #[error("event queue is full")]
    Full,

    #[error("event queue is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub tenant_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Sending half handed to request handlers.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<DomainEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an event without waiting.
    pub fn submit(
        &self,
        tenant_id: Uuid,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), EventQueueError> {
        let event = DomainEvent {
            tenant_id,
            event_type: event_type.into(),
            data,
        };
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => {
                tracing::warn!(
                    tenant_id = %event.tenant_id,
                    event_type = %event.event_type,
                    "Event queue full, dropping event"
                );
                EventQueueError::Full
            }
            mpsc::error::TrySendError::Closed(_) => EventQueueError::Closed,
        })
    }
}

/// Publish queued events one at a time. On cancellation the queue is closed,
/// whatever is already buffered is still published, and the task exits.
pub fn spawn_event_dispatcher(
    service: NotificationService,
    mut rx: mpsc::Receiver<DomainEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                event = rx.recv() => event,
            };
            match next {
                Some(event) => dispatch(&service, event).await,
                None => break,
            }
        }

        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            dispatch(&service, event).await;
            drained += 1;
        }
        tracing::info!(drained, "Event dispatcher stopped");
    })
}

async fn dispatch(service: &NotificationService, event: DomainEvent) {
    match service
        .publish(event.tenant_id, &event.event_type, &event.data)
        .await
    {
        Ok(report) => tracing::debug!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            matched = report.matched,
            delivered = report.delivered,
            queued = report.queued,
            "Event published"
        ),
        Err(e) => tracing::error!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            error = %e,
            "Failed to publish event"
        ),
    }
}
