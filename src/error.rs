//! Typed errors for the seams where callers branch on the cause.

use std::time::Duration;

use crate::types::event::MAX_KEEP_EVENTS_FOR_SECS;
use crate::types::AgentId;

/// Why a single `check`/`receive` invocation did not complete.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("no capability registered for kind '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("agent {0} cannot be its own source")]
    SelfLoop(AgentId),

    #[error("agent {consumer} lists unknown source {source_id}")]
    UnknownSource { consumer: AgentId, source_id: AgentId },

    #[error("source {source_id} -> {consumer} would close a cycle")]
    Cycle { consumer: AgentId, source_id: AgentId },

    #[error("agent {consumer} lists source {source_id} more than once")]
    DuplicateSource { consumer: AgentId, source_id: AgentId },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("keep_events_for_secs {0} exceeds the maximum of {MAX_KEEP_EVENTS_FOR_SECS}")]
    RetentionTooLong(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown agent kind '{0}'")]
    UnknownKind(String),

    #[error("agent kind '{0}' is already registered")]
    DuplicateKind(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("unknown schedule '{0}'")]
    Unknown(String),

    #[error("schedule interval must be positive: '{0}'")]
    ZeroInterval(String),
}
