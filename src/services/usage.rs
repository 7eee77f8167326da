use crate::db::timestamp;
use crate::Database;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use uuid::Uuid;

/// Billable counters kept per tenant and day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMetric {
    Detections,
    Embeddings,
    Comparisons,
    WebhookDeliveries,
}

impl UsageMetric {
    fn upsert_sql(&self) -> &'static str {
        match self {
            Self::Detections => {
                "INSERT INTO usage_counters (tenant_id, day, detections, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, day) DO UPDATE SET detections = detections + excluded.detections, updated_at = excluded.updated_at"
            }
            Self::Embeddings => {
                "INSERT INTO usage_counters (tenant_id, day, embeddings, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, day) DO UPDATE SET embeddings = embeddings + excluded.embeddings, updated_at = excluded.updated_at"
            }
            Self::Comparisons => {
                "INSERT INTO usage_counters (tenant_id, day, comparisons, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, day) DO UPDATE SET comparisons = comparisons + excluded.comparisons, updated_at = excluded.updated_at"
            }
            Self::WebhookDeliveries => {
                "INSERT INTO usage_counters (tenant_id, day, webhook_deliveries, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, day) DO UPDATE SET webhook_deliveries = webhook_deliveries + excluded.webhook_deliveries, updated_at = excluded.updated_at"
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub detections: u64,
    pub embeddings: u64,
    pub comparisons: u64,
    pub webhook_deliveries: u64,
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub fn record_usage(
    db: &Database,
    tenant_id: Uuid,
    metric: UsageMetric,
    amount: u64,
    at: DateTime<Utc>,
) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let amount = i64::try_from(amount)?;
    let conn = db.get()?;
    conn.execute(
        metric.upsert_sql(),
        rusqlite::params![
            tenant_id.to_string(),
            day_key(at.date_naive()),
            amount,
            timestamp(at)
        ],
    )?;
    Ok(())
}

/// Counters for one tenant-day; all zero when nothing was recorded.
pub fn daily_usage(db: &Database, tenant_id: Uuid, day: NaiveDate) -> Result<DailyUsage> {
    let conn = db.get()?;
    let usage = conn
        .query_row(
            "SELECT detections, embeddings, comparisons, webhook_deliveries
             FROM usage_counters WHERE tenant_id = ?1 AND day = ?2",
            rusqlite::params![tenant_id.to_string(), day_key(day)],
            |row| {
                Ok(DailyUsage {
                    detections: row.get::<_, i64>(0)? as u64,
                    embeddings: row.get::<_, i64>(1)? as u64,
                    comparisons: row.get::<_, i64>(2)? as u64,
                    webhook_deliveries: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()?;
    Ok(usage.unwrap_or_default())
}
