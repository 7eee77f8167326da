//! Background replay of queued deliveries with exponential backoff.

use crate::config::WebhookConfig;
use crate::models::DeliveryJob;
use crate::services::delivery::DeliveryClient;
use crate::services::queue::{self, retry_delay};
use crate::services::subscription;
use crate::services::usage::{record_usage, UsageMetric};
use crate::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts for one pass over a claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Jobs left untouched because of a storage error; they are picked up
    /// again when their lease runs out.
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    Failed,
    /// The job changed state underneath us.
    Stale,
}

pub struct DeliveryWorker {
    db: Database,
    client: DeliveryClient,
    batch_size: u32,
    poll_interval: Duration,
    base_delay: Duration,
    claim_lease: Duration,
    fail_fast_on_client_error: bool,
}

impl DeliveryWorker {
    pub fn new(db: Database, client: DeliveryClient, config: &WebhookConfig) -> Self {
        Self {
            db,
            client,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            base_delay: config.base_delay(),
            claim_lease: config.claim_lease(),
            fail_fast_on_client_error: config.fail_fast_on_client_error,
        }
    }

    /// Claim one batch due at `now` and try each job once. A failing job
    /// never stops the rest of the batch.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let jobs = queue::claim_batch(&self.db, self.batch_size, self.claim_lease, now)?;
        let mut report = TickReport {
            claimed: jobs.len(),
            ..TickReport::default()
        };

        for mut job in jobs {
            match self.process(&mut job, now).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Stale) => {
                    tracing::warn!(job_id = %job.id, "Delivery job is no longer held by this worker");
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to process delivery job");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, job: &mut DeliveryJob, now: DateTime<Utc>) -> Result<Outcome> {
        let sub = match subscription::get_subscription(&self.db, job.subscription_id)? {
            Some(sub) => sub,
            None => return self.fail(job, "subscription not found", now),
        };
        if !sub.enabled {
            return self.fail(job, "subscription disabled", now);
        }
        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&job.payload) {
            return self.fail(job, &format!("malformed payload: {}", e), now);
        }

        // Earlier jobs in the batch may have used up most of the claim lease.
        let started = now.max(Utc::now());
        if !queue::renew_lease(&self.db, job, self.claim_lease, started)? {
            return Ok(Outcome::Stale);
        }

        let result = self
            .client
            .deliver(&sub.url, &sub.secret, &job.event_type, &job.payload)
            .await;
        // The attempt may have taken up to the client timeout.
        let finished = now.max(Utc::now());

        match result {
            Ok(status) => {
                if !queue::mark_delivered(&self.db, job.id, finished)? {
                    return Ok(Outcome::Stale);
                }
                tracing::info!(
                    job_id = %job.id,
                    subscription_id = %sub.id,
                    attempt = job.attempts,
                    status,
                    "Queued webhook delivered"
                );
                if let Err(e) = subscription::touch_last_triggered(&self.db, sub.id, finished) {
                    tracing::error!(subscription_id = %sub.id, error = %e, "Failed to update last triggered time");
                }
                if let Err(e) =
                    record_usage(&self.db, sub.tenant_id, UsageMetric::WebhookDeliveries, 1, finished)
                {
                    tracing::error!(tenant_id = %sub.tenant_id, error = %e, "Failed to record webhook usage");
                }
                Ok(Outcome::Delivered)
            }
            Err(e) if self.fail_fast_on_client_error && e.is_permanent() => {
                self.fail(job, &e.to_string(), finished)
            }
            Err(e) if !job.attempts_exhausted() => {
                let delay = retry_delay(self.base_delay, job.attempts);
                let error = e.to_string();
                if !queue::schedule_retry(&self.db, job.id, job.attempts, delay, &error, finished)? {
                    return Ok(Outcome::Stale);
                }
                tracing::warn!(
                    job_id = %job.id,
                    subscription_id = %sub.id,
                    attempt = job.attempts + 1,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Webhook delivery failed, retry scheduled"
                );
                Ok(Outcome::Retried)
            }
            Err(e) => self.fail(job, &e.to_string(), finished),
        }
    }

    fn fail(&self, job: &DeliveryJob, error: &str, now: DateTime<Utc>) -> Result<Outcome> {
        if !queue::mark_failed(&self.db, job.id, error, now)? {
            return Ok(Outcome::Stale);
        }
        tracing::warn!(
            job_id = %job.id,
            subscription_id = %job.subscription_id,
            attempt = job.attempts,
            error,
            "Webhook delivery failed permanently"
        );
        Ok(Outcome::Failed)
    }

    /// Poll until `cancel` fires. Cancellation is only observed between
    /// ticks, so an attempt in flight always runs to completion.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "Webhook delivery worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(Utc::now()).await {
                Ok(report) if report.claimed > 0 => {
                    tracing::debug!(
                        claimed = report.claimed,
                        delivered = report.delivered,
                        retried = report.retried,
                        failed = report.failed,
                        errors = report.errors,
                        "Delivery tick finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Delivery tick failed"),
            }
        }

        tracing::info!("Webhook delivery worker stopped");
    }
}
