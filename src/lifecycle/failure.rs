use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::engine::memory::AgentLease;
use crate::error::InvocationError;
use crate::notify::{Notification, NotificationQueue};
use crate::storage::traits::Storage;
use crate::types::{Agent, AgentLogEntry, FailureState, LogLevel, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { consecutive_failures: u32 },
    /// This failure crossed the threshold and disabled the agent.
    Disabled { consecutive_failures: u32 },
}

/// Counts consecutive runtime failures per agent and disables agents that
/// reach the threshold. Disabled agents stay disabled until
/// [`FailureTracker::enable`] is called.
pub struct FailureTracker {
    storage: Arc<dyn Storage>,
    threshold: u32,
    notifications: Option<NotificationQueue>,
}

impl FailureTracker {
    pub fn new(
        storage: Arc<dyn Storage>,
        threshold: u32,
        notifications: Option<NotificationQueue>,
    ) -> Self {
        Self {
            storage,
            threshold: threshold.max(1),
            notifications,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn record_success(&self, lease: &AgentLease) -> Result<()> {
        let id = lease.agent_id();
        let state = self.storage.load_failure_state(id).await?;
        if state.consecutive_failures > 0 {
            self.storage
                .commit_failure_state(
                    id,
                    FailureState {
                        consecutive_failures: 0,
                        ..state
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub async fn record_failure(
        &self,
        lease: &AgentLease,
        agent: &Agent,
        operation: Operation,
        error: &InvocationError,
    ) -> Result<FailureOutcome> {
        let id = lease.agent_id();
        let mut state = self.storage.load_failure_state(id).await?;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        log::error!(
            "Agent {} ({}, kind {}) {} failed [{} consecutive]: {:#}",
            id,
            agent.name,
            agent.kind,
            operation,
            state.consecutive_failures,
            error
        );
        self.storage
            .record_log(&AgentLogEntry::new(
                id,
                LogLevel::Error,
                format!("Exception during {}: {}", operation, error),
            ))
            .await?;

        let tripped = !state.disabled && state.consecutive_failures >= self.threshold;
        if tripped {
            state.disabled = true;
        }
        self.storage.commit_failure_state(id, state).await?;

        if !tripped {
            return Ok(FailureOutcome::Counted {
                consecutive_failures: state.consecutive_failures,
            });
        }

        let reason = format!(
            "was disabled after {} consecutive failures",
            state.consecutive_failures
        );
        log::warn!("Agent {} ({}) {}", id, agent.name, reason);
        self.storage
            .record_log(&AgentLogEntry::new(id, LogLevel::Warn, format!("Agent {}", reason)))
            .await?;
        if let Some(queue) = &self.notifications {
            let notification = Notification {
                agent_id: id,
                owner_id: agent.owner_id,
                agent_name: agent.name.clone(),
                reason,
                created_at: Utc::now(),
            };
            if let Err(e) = queue.enqueue(notification) {
                log::error!("Could not queue disable notice for agent {}: {}", id, e);
            }
        }
        Ok(FailureOutcome::Disabled {
            consecutive_failures: state.consecutive_failures,
        })
    }

    /// Owner-initiated re-enable; also clears the failure counter.
    pub async fn enable(&self, lease: &AgentLease) -> Result<()> {
        let id = lease.agent_id();
        self.storage
            .commit_failure_state(id, FailureState::default())
            .await?;
        self.storage
            .record_log(&AgentLogEntry::new(id, LogLevel::Info, "Agent re-enabled"))
            .await?;
        log::info!("Agent {} re-enabled", id);
        Ok(())
    }
}
