use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::MAX_KEEP_EVENTS_FOR_SECS;
use super::{AgentId, OwnerId, Schedule};
use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub owner_id: OwnerId,
    pub kind: String,
    pub name: String,
    pub schedule: Schedule,
    pub options: Value,
    pub memory: AgentMemory,
    pub sources: Vec<AgentId>,
    pub disabled: bool,
    pub consecutive_failures: u32,
    /// 0 keeps emitted events forever.
    pub keep_events_for_secs: u64,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_receive_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(
        owner_id: OwnerId,
        kind: impl Into<String>,
        name: impl Into<String>,
        schedule: Schedule,
        options: Value,
    ) -> Self {
        Self {
            id: AgentId::new_v4(),
            owner_id,
            kind: kind.into(),
            name: name.into(),
            schedule,
            options,
            memory: AgentMemory::new(),
            sources: Vec::new(),
            disabled: false,
            consecutive_failures: 0,
            keep_events_for_secs: 0,
            created_at: Utc::now(),
            last_checked_at: None,
            last_receive_at: None,
            last_event_at: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<AgentId>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_keep_events_for(mut self, secs: u64) -> Self {
        self.keep_events_for_secs = secs;
        self
    }

    /// Rejects settings no store can hold.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.keep_events_for_secs > MAX_KEEP_EVENTS_FOR_SECS {
            return Err(AgentError::RetentionTooLong(self.keep_events_for_secs));
        }
        Ok(())
    }

    pub fn failure_state(&self) -> FailureState {
        FailureState {
            consecutive_failures: self.consecutive_failures,
            disabled: self.disabled,
        }
    }
}

/// Private scratch document of one agent. Created empty together with the
/// agent and only reachable through the memory store afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentMemory(Map<String, Value>);

impl AgentMemory {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.0.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> anyhow::Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Appends to the array stored under `key`, creating it when absent.
    pub fn push(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let slot = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(anyhow::anyhow!(
                "memory key '{}' holds {} instead of an array",
                key,
                json_type(other)
            )),
        }
    }

    pub fn len_of(&self, key: &str) -> usize {
        self.0
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(anyhow::anyhow!(
                "agent memory must be an object, got {}",
                json_type(&other)
            )),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub disabled: bool,
}

/// Timestamps recorded after an invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Activity {
    pub checked_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub event_at: Option<DateTime<Utc>>,
}
