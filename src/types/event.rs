use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentId, EventId};

/// Longest retention accepted for emitted events: one hundred years.
pub const MAX_KEEP_EVENTS_FOR_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub agent_id: AgentId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An event emitted during an invocation, before the log assigns its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub payload: Value,
}

impl EventDraft {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    pub fn into_event(
        self,
        id: EventId,
        agent_id: AgentId,
        created_at: DateTime<Utc>,
        keep_for_secs: u64,
    ) -> Event {
        // A retention too long to represent never expires.
        let expires_at = (keep_for_secs > 0)
            .then(|| {
                i64::try_from(keep_for_secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|keep| created_at.checked_add_signed(keep))
            })
            .flatten();
        Event {
            id,
            agent_id,
            payload: self.payload,
            created_at,
            expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_draft_without_retention_never_expires() {
        let now = Utc::now();
        let event = EventDraft::new(json!({"a": 1})).into_event(1, AgentId::new_v4(), now, 0);
        assert!(event.expires_at.is_none());
        assert!(!event.is_expired(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_draft_with_retention_expires() {
        let now = Utc::now();
        let event = EventDraft::new(json!({})).into_event(7, AgentId::new_v4(), now, 60);
        assert_eq!(event.expires_at, Some(now + chrono::Duration::seconds(60)));
        assert!(!event.is_expired(now + chrono::Duration::seconds(59)));
        assert!(event.is_expired(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_unrepresentable_retention_never_expires() {
        let now = Utc::now();
        for keep in [10_000_000_000_000_000, u64::MAX] {
            let event = EventDraft::new(json!({})).into_event(3, AgentId::new_v4(), now, keep);
            assert!(event.expires_at.is_none());
        }
    }
}
