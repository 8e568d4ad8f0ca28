//! Digest kind: queues received payloads and periodically folds them into one
//! event. Mail delivery is out of scope, so the digest is emitted as an event
//! for a downstream agent or notifier to deliver instead of being mailed.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{AgentContext, Capability};
use crate::lifecycle::health::period_in_days;
use crate::types::{Event, EventId, Schedule};

const QUEUE_KEY: &str = "queue";
const EVENTS_KEY: &str = "events";

/// Collects received payloads and emits them as one digest when checked.
pub struct DigestCapability;

impl DigestCapability {
    pub const KIND: &'static str = "digest";

    pub fn new() -> Self {
        Self
    }
}

impl Default for DigestCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for DigestCapability {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn default_options(&self) -> Value {
        json!({
            "subject": "You have some notifications!",
            "headline": "Your notifications:",
            "expected_receive_period_in_days": "2"
        })
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::Daily { hour: 5 }
    }

    fn validate_options(&self, options: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if period_in_days(options, "expected_receive_period_in_days").is_none() {
            errors.push("expected_receive_period_in_days must be a positive integer".to_string());
        }
        for key in ["subject", "headline"] {
            if let Some(value) = options.get(key) {
                if !value.is_string() {
                    errors.push(format!("{} must be a string", key));
                }
            }
        }
        errors
    }

    async fn receive(&self, ctx: &mut AgentContext, events: &[Event]) -> Result<()> {
        let mut seen: Vec<EventId> = ctx.memory().get_as(EVENTS_KEY)?.unwrap_or_default();
        for event in events {
            if seen.contains(&event.id) {
                continue;
            }
            ctx.memory_mut().push(QUEUE_KEY, event.payload.clone())?;
            ctx.memory_mut().push(EVENTS_KEY, json!(event.id))?;
            seen.push(event.id);
        }
        Ok(())
    }

    async fn check(&self, ctx: &mut AgentContext) -> Result<()> {
        let queue: Vec<Value> = ctx.memory().get_as(QUEUE_KEY)?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(());
        }
        let ids: Vec<EventId> = ctx.memory().get_as(EVENTS_KEY)?.unwrap_or_default();
        log::info!(
            "Agent {} emitting digest with events {:?}",
            ctx.agent_id(),
            ids
        );

        let groups: Vec<Value> = queue.iter().map(present).collect();
        let digest = json!({
            "subject": ctx.option_str("subject", "You have some notifications!"),
            "headline": ctx.option_str("headline", "Your notifications:"),
            "events": ids,
            "groups": groups,
        });
        ctx.create_event(digest)?;

        ctx.memory_mut().set(QUEUE_KEY, Vec::<Value>::new())?;
        ctx.memory_mut().set(EVENTS_KEY, Vec::<EventId>::new())?;
        Ok(())
    }
}

/// Highlights a payload's `message` when it has one.
fn present(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => match map.get("message").and_then(|m| m.as_str()) {
            Some(message) => {
                let entries: Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "message")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                json!({ "title": message, "entries": entries })
            }
            None => json!({ "title": "Event", "entries": map }),
        },
        other => json!({ "title": other.to_string(), "entries": {} }),
    }
}
