pub mod digest;
pub mod emitter;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::lifecycle::health::{self, HealthPolicy};
use crate::types::{Agent, AgentId, AgentMemory, Event, EventDraft, Schedule};

/// Behaviour of one agent kind. Implementations hold no per-agent state;
/// everything an agent keeps between runs lives in its memory.
#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> &str;

    fn default_options(&self) -> Value {
        Value::Object(Default::default())
    }

    fn default_schedule(&self) -> Schedule {
        Schedule::Never
    }

    /// Empty when the options are usable.
    fn validate_options(&self, _options: &Value) -> Vec<String> {
        Vec::new()
    }

    fn can_be_scheduled(&self) -> bool {
        true
    }

    fn can_receive_events(&self) -> bool {
        true
    }

    fn can_create_events(&self) -> bool {
        true
    }

    async fn check(&self, _ctx: &mut AgentContext) -> Result<()> {
        Ok(())
    }

    async fn receive(&self, _ctx: &mut AgentContext, _events: &[Event]) -> Result<()> {
        Ok(())
    }

    fn working(&self, agent: &Agent, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        let errors = self.validate_options(&agent.options);
        health::default_working(agent, &errors, policy, now)
    }
}

/// What a capability sees during one invocation: a snapshot of its agent,
/// a working copy of its memory and the events it emits. Nothing here is
/// persisted unless the invocation succeeds.
pub struct AgentContext {
    agent: Agent,
    memory: AgentMemory,
    emitted: Vec<EventDraft>,
    can_create_events: bool,
    now: DateTime<Utc>,
}

impl AgentContext {
    pub fn new(agent: Agent, memory: AgentMemory, can_create_events: bool, now: DateTime<Utc>) -> Self {
        Self {
            agent,
            memory,
            emitted: Vec::new(),
            can_create_events,
            now,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent.id
    }

    pub fn options(&self) -> &Value {
        &self.agent.options
    }

    /// String option, falling back to `default` when absent or not a string.
    pub fn option_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.agent
            .options
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(default)
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut AgentMemory {
        &mut self.memory
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn create_event(&mut self, payload: Value) -> Result<()> {
        if !self.can_create_events {
            return Err(anyhow!(
                "agent '{}' of kind '{}' cannot create events",
                self.agent.name,
                self.agent.kind
            ));
        }
        self.emitted.push(EventDraft::new(payload));
        Ok(())
    }

    pub fn emitted(&self) -> &[EventDraft] {
        &self.emitted
    }

    pub fn into_parts(self) -> (AgentMemory, Vec<EventDraft>) {
        (self.memory, self.emitted)
    }
}
