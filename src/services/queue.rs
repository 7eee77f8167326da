//! Durable delivery queue backed by the `delivery_jobs` table.
//!
//! Claiming uses a `BEGIN IMMEDIATE` transaction plus a `locked_until` lease:
//! the first claimer stamps the rows it selects, and any concurrent claimer
//! that gets the write lock afterwards skips them. A claimed job that is never
//! resolved becomes claimable again once its lease runs out.
//!
//! A batch is worked through one job at a time, so the claim lease alone may
//! run out before the later jobs are attempted. Workers call [`renew_lease`]
//! right before each attempt and skip the job when it fails.

use crate::db::{parse_optional_timestamp, parse_timestamp, parse_uuid, timestamp};
use crate::models::{DeliveryJob, JobStatus};
use crate::Database;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::time::Duration;
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, subscription_id, event_type, payload, attempts, max_attempts, next_retry_at, status, last_error, created_at, updated_at, locked_until FROM delivery_jobs";

/// Backoff for the retry that follows a failure at `attempt`: `base * 2^attempt`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    1u32.checked_shl(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

fn add_delay(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| anyhow::anyhow!("Retry delay of {:?} is out of range", delay))
}

/// Store a new pending job that is due immediately.
pub fn enqueue(
    db: &Database,
    subscription_id: Uuid,
    event_type: &str,
    payload: &[u8],
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = timestamp(now);
    let conn = db.get()?;
    conn.execute(
        "INSERT INTO delivery_jobs (id, subscription_id, event_type, payload, attempts, max_attempts, next_retry_at, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 'pending', ?6, ?6)",
        rusqlite::params![
            id.to_string(),
            subscription_id.to_string(),
            event_type,
            payload,
            max_attempts,
            now
        ],
    )?;
    Ok(id)
}

/// Claim up to `limit` due pending jobs, oldest first, hiding them from
/// other claimers for `lease`.
pub fn claim_batch(
    db: &Database,
    limit: u32,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<DeliveryJob>> {
    let now_ts = timestamp(now);
    let lease_end = add_delay(now, lease)?;
    let locked_until = timestamp(lease_end);

    let mut conn = db.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut jobs = {
        let mut stmt = tx.prepare(&format!(
            "{} WHERE status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
               AND (locked_until IS NULL OR locked_until <= ?1)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(rusqlite::params![now_ts, limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jobs
    };

    {
        let mut lock = tx.prepare("UPDATE delivery_jobs SET locked_until = ?1 WHERE id = ?2")?;
        for job in &mut jobs {
            lock.execute(rusqlite::params![locked_until, job.id.to_string()])?;
            job.locked_until = Some(lease_end);
        }
    }

    tx.commit()?;
    Ok(jobs)
}

/// Extend a claimed job's lease to `now + lease`.
///
/// Succeeds only while the job is pending and still carries the lease last
/// stamped for `job`. Returns false once another claimer has taken it over or
/// it was resolved.
pub fn renew_lease(
    db: &Database,
    job: &mut DeliveryJob,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(held_until) = job.locked_until else {
        return Ok(false);
    };
    let lease_end = add_delay(now, lease)?;
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE delivery_jobs SET locked_until = ?1
         WHERE id = ?2 AND status = 'pending' AND locked_until = ?3",
        rusqlite::params![
            timestamp(lease_end),
            job.id.to_string(),
            timestamp(held_until)
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    job.locked_until = Some(lease_end);
    Ok(true)
}

/// Returns false when the job was not pending.
pub fn mark_delivered(db: &Database, job_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE delivery_jobs
         SET status = 'delivered', next_retry_at = NULL, last_error = NULL, locked_until = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        rusqlite::params![timestamp(now), job_id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Record a failed `attempt` and push the job back by `delay`.
///
/// Applies only while the job is still pending at `attempt`, so a stale
/// worker cannot double-count.
pub fn schedule_retry(
    db: &Database,
    job_id: Uuid,
    attempt: u32,
    delay: Duration,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let next_retry_at = timestamp(add_delay(now, delay)?);
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE delivery_jobs
         SET attempts = ?1 + 1, next_retry_at = ?2, last_error = ?3, locked_until = NULL, updated_at = ?4
         WHERE id = ?5 AND status = 'pending' AND attempts = ?1 AND ?1 < max_attempts",
        rusqlite::params![
            attempt,
            next_retry_at,
            error,
            timestamp(now),
            job_id.to_string()
        ],
    )?;
    Ok(changed > 0)
}

/// Terminally fail a pending job. Attempts are left as they are.
pub fn mark_failed(db: &Database, job_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE delivery_jobs
         SET status = 'failed', next_retry_at = NULL, last_error = ?1, locked_until = NULL, updated_at = ?2
         WHERE id = ?3 AND status = 'pending'",
        rusqlite::params![error, timestamp(now), job_id.to_string()],
    )?;
    Ok(changed > 0)
}

pub fn get_job(db: &Database, job_id: Uuid) -> Result<Option<DeliveryJob>> {
    let conn = db.get()?;
    let job = conn
        .query_row(
            &format!("{} WHERE id = ?", SELECT_COLUMNS),
            [job_id.to_string()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Look up a job through its subscription's owner. Jobs whose subscription
/// has been deleted are no longer visible to the tenant.
pub fn get_job_for_tenant(
    db: &Database,
    job_id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<DeliveryJob>> {
    let conn = db.get()?;
    let job = conn
        .query_row(
            "SELECT j.id, j.subscription_id, j.event_type, j.payload, j.attempts, j.max_attempts, j.next_retry_at, j.status, j.last_error, j.created_at, j.updated_at, j.locked_until
             FROM delivery_jobs j
             JOIN webhook_subscriptions s ON s.id = j.subscription_id
             WHERE j.id = ?1 AND s.tenant_id = ?2",
            rusqlite::params![job_id.to_string(), tenant_id.to_string()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Newest first.
pub fn list_jobs(db: &Database, status: Option<JobStatus>, limit: u32) -> Result<Vec<DeliveryJob>> {
    let conn = db.get()?;
    let jobs = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                SELECT_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(rusqlite::params![status.as_str(), limit], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            jobs
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{} ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                SELECT_COLUMNS
            ))?;
            let jobs = stmt
                .query_map([limit], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            jobs
        }
    };
    Ok(jobs)
}

/// Delete delivered and failed jobs last updated before `older_than`.
/// Pending jobs are never touched.
pub fn prune_terminal(db: &Database, older_than: DateTime<Utc>) -> Result<usize> {
    let conn = db.get()?;
    let deleted = conn.execute(
        "DELETE FROM delivery_jobs WHERE status IN ('delivered', 'failed') AND updated_at < ?",
        [timestamp(older_than)],
    )?;
    if deleted > 0 {
        tracing::info!(deleted, "Pruned terminal delivery jobs");
    }
    Ok(deleted)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryJob> {
    let status: String = row.get(7)?;
    let status = JobStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown job status '{}'", status).into(),
        )
    })?;

    Ok(DeliveryJob {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        subscription_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        next_retry_at: parse_optional_timestamp(6, row.get(6)?)?,
        status,
        last_error: row.get(8)?,
        locked_until: parse_optional_timestamp(11, row.get(11)?)?,
        created_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
        updated_at: parse_timestamp(10, &row.get::<_, String>(10)?)?,
    })
}
