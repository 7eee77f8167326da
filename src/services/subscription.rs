use crate::db::{parse_optional_timestamp, parse_timestamp, parse_uuid, timestamp};
use crate::models::Subscription;
use crate::Database;
use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::OptionalExtension;
use uuid::Uuid;

const SECRET_PREFIX: &str = "whsec_";
const SECRET_BYTE_LENGTH: usize = 32;

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, name, url, secret, events, enabled, last_triggered_at, created_at, updated_at FROM webhook_subscriptions";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookInputError {
    #[error("Invalid webhook URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("A webhook must subscribe to at least one event type")]
    NoEvents,

    #[error("Invalid event type '{0}'")]
    InvalidEventType(String),

    #[error("Webhook name must not be empty")]
    EmptyName,
}

/// Generate a signing secret with the `whsec_` prefix.
fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTE_LENGTH];
    rand::thread_rng().fill(&mut bytes);
    format!("{}{}", SECRET_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

pub fn validate_url(raw: &str) -> std::result::Result<(), WebhookInputError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| WebhookInputError::InvalidUrl(raw.to_string(), e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookInputError::InvalidUrl(
            raw.to_string(),
            "scheme must be http or https".to_string(),
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(WebhookInputError::InvalidUrl(
            raw.to_string(),
            "missing host".to_string(),
        ));
    }
    Ok(())
}

/// Trim, de-duplicate and join event types into the stored comma list.
pub fn normalize_events<S: AsRef<str>>(events: &[S]) -> std::result::Result<String, WebhookInputError> {
    let mut normalized: Vec<&str> = Vec::new();
    for event in events {
        let event = event.as_ref().trim();
        if event.is_empty() {
            continue;
        }
        if event.contains(',') || event.chars().any(char::is_whitespace) {
            return Err(WebhookInputError::InvalidEventType(event.to_string()));
        }
        if !normalized.contains(&event) {
            normalized.push(event);
        }
    }
    if normalized.is_empty() {
        return Err(WebhookInputError::NoEvents);
    }
    Ok(normalized.join(","))
}

/// Register a webhook. Returns the signing secret (shown once) and the stored record.
pub fn create_subscription<S: AsRef<str>>(
    db: &Database,
    tenant_id: Uuid,
    name: &str,
    url: &str,
    events: &[S],
) -> Result<(String, Subscription)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WebhookInputError::EmptyName.into());
    }
    validate_url(url)?;
    let events = normalize_events(events)?;

    let id = Uuid::new_v4();
    let secret = generate_secret();
    let now = timestamp(Utc::now());

    let conn = db.get()?;
    conn.execute(
        "INSERT INTO webhook_subscriptions (id, tenant_id, name, url, secret, events, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
        rusqlite::params![
            id.to_string(),
            tenant_id.to_string(),
            name,
            url,
            secret,
            events,
            now
        ],
    )?;
    drop(conn);

    let subscription = get_subscription(db, id)?
        .ok_or_else(|| anyhow::anyhow!("Subscription {} vanished after insert", id))?;

    tracing::info!(
        subscription_id = %id,
        tenant_id = %tenant_id,
        events = %subscription.events,
        "Webhook subscription created"
    );

    Ok((secret, subscription))
}

/// Get a single subscription by ID, including its secret for signing.
pub fn get_subscription(db: &Database, id: Uuid) -> Result<Option<Subscription>> {
    let conn = db.get()?;
    let subscription = conn
        .query_row(
            &format!("{} WHERE id = ?", SELECT_COLUMNS),
            [id.to_string()],
            row_to_subscription,
        )
        .optional()?;
    Ok(subscription)
}

/// List a tenant's subscriptions, newest first.
pub fn list_subscriptions(db: &Database, tenant_id: Uuid) -> Result<Vec<Subscription>> {
    let conn = db.get()?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE tenant_id = ? ORDER BY created_at DESC",
        SELECT_COLUMNS
    ))?;
    let subscriptions = stmt
        .query_map([tenant_id.to_string()], row_to_subscription)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(subscriptions)
}

/// Enabled subscriptions of `tenant_id` that receive `event_type`.
pub fn list_enabled_for_event(
    db: &Database,
    tenant_id: Uuid,
    event_type: &str,
) -> Result<Vec<Subscription>> {
    let conn = db.get()?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE tenant_id = ? AND enabled = 1 ORDER BY created_at ASC",
        SELECT_COLUMNS
    ))?;
    let subscriptions = stmt
        .query_map([tenant_id.to_string()], row_to_subscription)?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .filter(|s| s.handles_event(event_type))
        .collect();
    Ok(subscriptions)
}

/// Enable or disable a subscription. Returns false if it does not exist.
pub fn set_enabled(db: &Database, id: Uuid, enabled: bool) -> Result<bool> {
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE webhook_subscriptions SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![enabled, timestamp(Utc::now()), id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Replace the subscribed event types. Already-queued jobs are unaffected.
pub fn update_events<S: AsRef<str>>(db: &Database, id: Uuid, events: &[S]) -> Result<bool> {
    let events = normalize_events(events)?;
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE webhook_subscriptions SET events = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![events, timestamp(Utc::now()), id.to_string()],
    )?;
    Ok(changed > 0)
}

/// Issue a new signing secret. Pending jobs are signed with the new secret
/// when they are next attempted.
pub fn rotate_secret(db: &Database, id: Uuid) -> Result<Option<String>> {
    let secret = generate_secret();
    let conn = db.get()?;
    let changed = conn.execute(
        "UPDATE webhook_subscriptions SET secret = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![secret, timestamp(Utc::now()), id.to_string()],
    )?;
    if changed == 0 {
        return Ok(None);
    }

    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM delivery_jobs WHERE subscription_id = ? AND status = 'pending'",
        [id.to_string()],
        |row| row.get(0),
    )?;
    if pending > 0 {
        tracing::warn!(
            subscription_id = %id,
            pending_jobs = pending,
            "Secret rotated with deliveries still queued; they will be signed with the new secret"
        );
    }

    Ok(Some(secret))
}

/// Delete a subscription. Queued jobs stay behind and fail when claimed.
pub fn delete_subscription(db: &Database, id: Uuid) -> Result<bool> {
    let conn = db.get()?;
    let changed = conn.execute(
        "DELETE FROM webhook_subscriptions WHERE id = ?",
        [id.to_string()],
    )?;
    Ok(changed > 0)
}

pub fn touch_last_triggered(db: &Database, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    let conn = db.get()?;
    conn.execute(
        "UPDATE webhook_subscriptions SET last_triggered_at = ?1 WHERE id = ?2",
        rusqlite::params![timestamp(at), id.to_string()],
    )?;
    Ok(())
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        tenant_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        url: row.get(3)?,
        secret: row.get(4)?,
        events: row.get(5)?,
        enabled: row.get(6)?,
        last_triggered_at: parse_optional_timestamp(7, row.get(7)?)?,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn setup_test_db() -> Database {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db = Database::open_memory(&format!("subscription_test_{}", id)).unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_create_returns_secret_once() {
        let db = setup_test_db();
        let tenant = Uuid::new_v4();
        let (secret, sub) = create_subscription(
            &db,
            tenant,
            "Primary",
            "https://hooks.example.com/facegate",
            &["face.registered", "face.deleted"],
        )
        .unwrap();

        assert!(secret.starts_with("whsec_"));
        assert_eq!(secret.len(), SECRET_PREFIX.len() + 43);
        assert_eq!(sub.tenant_id, tenant);
        assert!(sub.enabled);
        assert_eq!(sub.events, "face.registered,face.deleted");

        let listed = list_subscriptions(&db, tenant).unwrap();
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains(&secret));
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let db = setup_test_db();
        let tenant = Uuid::new_v4();
        assert!(create_subscription(&db, tenant, "x", "ftp://example.com", &["a"]).is_err());
        assert!(create_subscription(&db, tenant, "x", "not a url", &["a"]).is_err());
        assert!(create_subscription(&db, tenant, "x", "https://example.com", &[" "]).is_err());
        assert!(create_subscription(&db, tenant, " ", "https://example.com", &["a"]).is_err());
        assert!(list_subscriptions(&db, tenant).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_events() {
        assert_eq!(
            normalize_events(&[" face.registered", "face.registered", "face.deleted "]).unwrap(),
            "face.registered,face.deleted"
        );
        assert_eq!(
            normalize_events::<&str>(&[]).unwrap_err(),
            WebhookInputError::NoEvents
        );
        assert!(matches!(
            normalize_events(&["a,b"]),
            Err(WebhookInputError::InvalidEventType(_))
        ));
    }

    #[test]
    fn test_list_enabled_for_event_filters_tenant_event_and_state() {
        let db = setup_test_db();
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();

        let (_, wanted) =
            create_subscription(&db, tenant, "a", "https://a.example.com", &["face.registered"])
                .unwrap();
        let (_, disabled) =
            create_subscription(&db, tenant, "b", "https://b.example.com", &["face.registered"])
                .unwrap();
        create_subscription(&db, tenant, "c", "https://c.example.com", &["face.deleted"]).unwrap();
        create_subscription(&db, other, "d", "https://d.example.com", &["face.registered"])
            .unwrap();
        assert!(set_enabled(&db, disabled.id, false).unwrap());

        let found = list_enabled_for_event(&db, tenant, "face.registered").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, wanted.id);
    }

    #[test]
    fn test_update_events_and_rotate_secret() {
        let db = setup_test_db();
        let (secret, sub) =
            create_subscription(&db, Uuid::new_v4(), "a", "http://localhost:9000/hook", &["x"])
                .unwrap();

        assert!(update_events(&db, sub.id, &["y", "z"]).unwrap());
        let reloaded = get_subscription(&db, sub.id).unwrap().unwrap();
        assert!(reloaded.handles_event("z"));
        assert!(!reloaded.handles_event("x"));

        let rotated = rotate_secret(&db, sub.id).unwrap().unwrap();
        assert_ne!(rotated, secret);
        assert_eq!(get_subscription(&db, sub.id).unwrap().unwrap().secret, rotated);
        assert!(rotate_secret(&db, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_delete_and_touch() {
        let db = setup_test_db();
        let (_, sub) =
            create_subscription(&db, Uuid::new_v4(), "a", "https://a.example.com", &["x"]).unwrap();
        assert!(sub.last_triggered_at.is_none());

        let at = Utc::now();
        touch_last_triggered(&db, sub.id, at).unwrap();
        let touched = get_subscription(&db, sub.id).unwrap().unwrap();
        assert_eq!(
            touched.last_triggered_at.map(timestamp),
            Some(timestamp(at))
        );

        assert!(delete_subscription(&db, sub.id).unwrap());
        assert!(!delete_subscription(&db, sub.id).unwrap());
        assert!(get_subscription(&db, sub.id).unwrap().is_none());
    }
}
