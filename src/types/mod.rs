pub mod agent;
pub mod event;
pub mod schedule;

pub use agent::{Activity, Agent, AgentMemory, FailureState};
pub use event::{Event, EventDraft};
pub use schedule::{Schedule, TickWindow};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;
pub type OwnerId = Uuid;
pub type EventId = i64;

/// A producer -> consumer edge of the agent graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub producer: AgentId,
    pub consumer: AgentId,
}

impl EdgeKey {
    pub fn new(producer: AgentId, consumer: AgentId) -> Self {
        Self { producer, consumer }
    }
}

/// An edge together with the id of the last event delivered along it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub watermark: EventId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Check,
    Receive,
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Check => "check",
            Operation::Receive => "receive",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warn",
            LogLevel::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Warn" => LogLevel::Warn,
            "Error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// A per-agent log line, written by the failure tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub level: LogLevel,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl AgentLogEntry {
    pub fn new(agent_id: AgentId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            level,
            message: message.into(),
            created_at: chrono::Utc::now(),
        }
    }
}
