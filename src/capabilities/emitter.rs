use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AgentContext, Capability};
use crate::types::Schedule;

/// Emits its `payload` option on every scheduled check.
pub struct EmitterCapability;

impl EmitterCapability {
    pub const KIND: &'static str = "emitter";

    pub fn new() -> Self {
        Self
    }
}

impl Default for EmitterCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for EmitterCapability {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn default_options(&self) -> Value {
        json!({ "payload": { "message": "Hello from muninn!" } })
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::every_minutes(1)
    }

    fn validate_options(&self, options: &Value) -> Vec<String> {
        match options.get("payload") {
            Some(Value::Object(_)) => Vec::new(),
            Some(_) => vec!["payload must be an object".to_string()],
            None => vec!["payload is required".to_string()],
        }
    }

    fn can_receive_events(&self) -> bool {
        false
    }

    async fn check(&self, ctx: &mut AgentContext) -> Result<()> {
        let payload = ctx.options().get("payload").cloned().unwrap_or(Value::Null);
        ctx.create_event(payload)
    }
}
