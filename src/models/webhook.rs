use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A tenant's registered webhook destination.
#[derive(Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub url: String,
    /// Signing key. Handed out once by `create_subscription`, never serialized.
    #[serde(skip)]
    pub secret: String,
    pub events: String,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret", &"[REDACTED]")
            .field("events", &self.events)
            .field("enabled", &self.enabled)
            .field("last_triggered_at", &self.last_triggered_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Subscription {
    /// Returns the list of event types this subscription receives.
    pub fn event_list(&self) -> Vec<&str> {
        self.events
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Check whether this subscription is subscribed to a given event type.
    pub fn handles_event(&self, event_type: &str) -> bool {
        self.event_list().iter().any(|e| *e == event_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Delivered,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One durable, retryable webhook delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    /// Lease end stamped by the claim that handed out this job.
    #[serde(skip)]
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Envelope posted to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<'a> {
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub data: &'a serde_json::Value,
    pub tenant_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(events: &str) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "hooks".to_string(),
            url: "https://example.com/hook".to_string(),
            secret: "whsec_x".to_string(),
            events: events.to_string(),
            enabled: true,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_handles_event_trims_and_matches_exactly() {
        let sub = subscription("face.registered, face.deleted ,");
        assert_eq!(sub.event_list(), vec!["face.registered", "face.deleted"]);
        assert!(sub.handles_event("face.deleted"));
        assert!(!sub.handles_event("face"));
        assert!(!sub.handles_event(""));
    }

    #[test]
    fn test_subscription_serialization_hides_secret() {
        let sub = subscription("face.registered");
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["events"], "face.registered");
    }

    #[test]
    fn test_subscription_debug_redacts_secret() {
        let sub = subscription("face.registered");
        let debug = format!("{:?}", sub);
        assert!(!debug.contains("whsec_x"));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("https://example.com/hook"));
    }

    #[test]
    fn test_job_status_strings() {
        for status in [JobStatus::Pending, JobStatus::Delivered, JobStatus::Failed] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("abandoned"), None);
    }

    #[test]
    fn test_envelope_shape() {
        let data = serde_json::json!({"face_id": "f1"});
        let tenant_id = Uuid::new_v4();
        let envelope = EventEnvelope {
            event_type: "face.registered",
            data: &data,
            tenant_id,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "face.registered");
        assert_eq!(json["data"]["face_id"], "f1");
        assert_eq!(json["tenant_id"], tenant_id.to_string());
        assert!(json["timestamp"].is_string());
    }
}
