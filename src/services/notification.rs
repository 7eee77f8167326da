//! Event fan-out to subscriptions: inline delivery first, durable queue on failure.

use crate::models::{EventEnvelope, Subscription};
use crate::services::delivery::DeliveryClient;
use crate::services::usage::{record_usage, UsageMetric};
use crate::services::{queue, subscription};
use crate::Database;
use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

/// What happened to one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub matched: usize,
    pub delivered: usize,
    pub queued: usize,
    /// Failed inline and could not be queued either.
    pub dropped: usize,
}

#[derive(Clone)]
pub struct NotificationService {
    db: Database,
    client: DeliveryClient,
    max_attempts: u32,
}

impl NotificationService {
    pub fn new(db: Database, client: DeliveryClient, max_attempts: u32) -> Self {
        Self {
            db,
            client,
            max_attempts,
        }
    }

    /// Deliver `event_type` to every enabled subscription of `tenant_id` that
    /// wants it. Only a failed subscription lookup is returned as an error;
    /// delivery problems end up in the queue or the log.
    pub async fn publish(
        &self,
        tenant_id: Uuid,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<PublishReport> {
        let subscriptions = subscription::list_enabled_for_event(&self.db, tenant_id, event_type)?;
        let mut report = PublishReport {
            matched: subscriptions.len(),
            ..PublishReport::default()
        };

        for sub in &subscriptions {
            let envelope = EventEnvelope {
                event_type,
                data,
                tenant_id,
                timestamp: Utc::now(),
            };
            let payload = match serde_json::to_vec(&envelope) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(subscription_id = %sub.id, error = %e, "Failed to serialize webhook payload");
                    report.dropped += 1;
                    continue;
                }
            };

            match self
                .client
                .deliver(&sub.url, &sub.secret, event_type, &payload)
                .await
            {
                Ok(status) => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        event_type,
                        status,
                        "Webhook delivered"
                    );
                    report.delivered += 1;
                    self.after_delivery(sub);
                }
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        event_type,
                        error = %e,
                        "Inline webhook delivery failed, queueing for retry"
                    );
                    match queue::enqueue(
                        &self.db,
                        sub.id,
                        event_type,
                        &payload,
                        self.max_attempts,
                        Utc::now(),
                    ) {
                        Ok(job_id) => {
                            tracing::debug!(job_id = %job_id, subscription_id = %sub.id, "Delivery job queued");
                            report.queued += 1;
                        }
                        Err(e) => {
                            tracing::error!(
                                subscription_id = %sub.id,
                                event_type,
                                error = %e,
                                "Failed to queue webhook delivery"
                            );
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn after_delivery(&self, sub: &Subscription) {
        let now = Utc::now();
        if let Err(e) = subscription::touch_last_triggered(&self.db, sub.id, now) {
            tracing::error!(subscription_id = %sub.id, error = %e, "Failed to update last triggered time");
        }
        if let Err(e) = record_usage(&self.db, sub.tenant_id, UsageMetric::WebhookDeliveries, 1, now) {
            tracing::error!(tenant_id = %sub.tenant_id, error = %e, "Failed to record webhook usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::models::JobStatus;
    use crate::services::signer;
    use crate::services::usage::daily_usage;
    use std::sync::atomic::{AtomicU64, Ordering};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn setup_test_db() -> Database {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db = Database::open_memory(&format!("notification_test_{}", id)).unwrap();
        db.migrate().unwrap();
        db
    }

    fn service(db: &Database) -> NotificationService {
        let client = DeliveryClient::new(&WebhookConfig::default()).unwrap();
        NotificationService::new(db.clone(), client, 5)
    }

    #[tokio::test]
    async fn test_publish_delivers_signed_envelope_inline() {
        let db = setup_test_db();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-event-type", "face.registered"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tenant = Uuid::new_v4();
        let (secret, sub) =
            subscription::create_subscription(&db, tenant, "a", &server.uri(), &["face.registered"])
                .unwrap();

        let data = serde_json::json!({"face_id": "f-1"});
        let report = service(&db)
            .publish(tenant, "face.registered", &data)
            .await
            .unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.queued, 0);

        let received = &server.received_requests().await.unwrap()[0];
        let body: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body["type"], "face.registered");
        assert_eq!(body["data"]["face_id"], "f-1");
        assert_eq!(body["tenant_id"], tenant.to_string());
        let signature = received.headers.get("x-signature").unwrap().to_str().unwrap();
        assert!(signer::verify(&secret, &received.body, signature));

        let sub = subscription::get_subscription(&db, sub.id).unwrap().unwrap();
        assert!(sub.last_triggered_at.is_some());
        assert!(queue::list_jobs(&db, None, 10).unwrap().is_empty());
        let usage = daily_usage(&db, tenant, Utc::now().date_naive()).unwrap();
        assert_eq!(usage.webhook_deliveries, 1);
    }

    #[tokio::test]
    async fn test_publish_queues_on_failure_without_erroring() {
        let db = setup_test_db();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tenant = Uuid::new_v4();
        let (_, sub) =
            subscription::create_subscription(&db, tenant, "a", &server.uri(), &["face.deleted"])
                .unwrap();

        let report = service(&db)
            .publish(tenant, "face.deleted", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(report.queued, 1);

        let jobs = queue::list_jobs(&db, Some(JobStatus::Pending), 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].subscription_id, sub.id);
        assert_eq!(jobs[0].attempts, 0);
        assert_eq!(jobs[0].max_attempts, 5);
        let payload: serde_json::Value = serde_json::from_slice(&jobs[0].payload).unwrap();
        assert_eq!(payload["type"], "face.deleted");

        let sub = subscription::get_subscription(&db, sub.id).unwrap().unwrap();
        assert!(sub.last_triggered_at.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_matching_subscriptions_is_a_no_op() {
        let db = setup_test_db();
        let tenant = Uuid::new_v4();
        let (_, sub) = subscription::create_subscription(
            &db,
            tenant,
            "a",
            "http://127.0.0.1:9/hook",
            &["face.registered"],
        )
        .unwrap();
        subscription::set_enabled(&db, sub.id, false).unwrap();

        let svc = service(&db);
        let data = serde_json::json!({});
        assert_eq!(
            svc.publish(tenant, "face.registered", &data).await.unwrap(),
            PublishReport::default()
        );
        assert_eq!(
            svc.publish(Uuid::new_v4(), "face.registered", &data)
                .await
                .unwrap(),
            PublishReport::default()
        );
    }
}
