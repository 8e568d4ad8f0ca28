use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capabilities::AgentContext;
use crate::engine::memory::{AgentLease, MemoryStore};
use crate::error::InvocationError;
use crate::lifecycle::failure::{FailureOutcome, FailureTracker};
use crate::registry::AgentRegistry;
use crate::storage::traits::Storage;
use crate::types::{Activity, Agent, AgentId, EdgeKey, Event, EventId, Operation};

/// Configuration for the bounded invocation pool
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Invocations allowed to run at the same time
    pub max_concurrency: usize,
    /// Per check/receive budget before the invocation counts as failed
    pub invocation_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            invocation_timeout: Duration::from_secs(300),
        }
    }
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub enum Job {
    Check {
        agent: Agent,
    },
    /// `advances` are the watermarks to commit once the batch is accepted.
    Receive {
        agent: Agent,
        events: Vec<Event>,
        advances: Vec<(EdgeKey, EventId)>,
    },
}

impl Job {
    pub fn agent(&self) -> &Agent {
        match self {
            Job::Check { agent } | Job::Receive { agent, .. } => agent,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Job::Check { .. } => Operation::Check,
            Job::Receive { .. } => Operation::Receive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    Succeeded { emitted: usize },
    Failed { error: String, disabled: bool },
    /// Not invoked, e.g. the agent was disabled before its turn came.
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub agent_id: AgentId,
    pub operation: Operation,
    pub status: InvocationStatus,
}

impl InvocationReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, InvocationStatus::Succeeded { .. })
    }

    pub fn failed(&self) -> bool {
        matches!(self.status, InvocationStatus::Failed { .. })
    }
}

/// Runs capability invocations in parallel, each inside a failure boundary.
pub struct Dispatcher {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    memory: MemoryStore,
    failures: FailureTracker,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        failures: FailureTracker,
        config: DispatchConfig,
    ) -> Self {
        Self {
            memory: MemoryStore::new(storage.clone()),
            storage,
            registry,
            failures,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            timeout: config.invocation_timeout,
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Re-enables a disabled agent on behalf of its owner.
    pub async fn enable_agent(&self, agent_id: AgentId) -> Result<()> {
        let lease = self.memory.lease(agent_id).await?;
        self.failures.enable(&lease).await
    }

    /// Runs every job and waits for all of them. Jobs must name distinct
    /// agents; the per-agent lease serializes them otherwise.
    pub async fn run_all(self: &Arc<Self>, jobs: Vec<Job>, now: DateTime<Utc>) -> Vec<InvocationReport> {
        let mut set = JoinSet::new();
        for job in jobs {
            let this = Arc::clone(self);
            set.spawn(async move {
                let _permit = this.permits.clone().acquire_owned().await;
                this.invoke(job, now).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => log::error!("Dispatch task aborted: {}", e),
            }
        }
        reports
    }

    pub async fn invoke(&self, job: Job, now: DateTime<Utc>) -> InvocationReport {
        let agent = job.agent().clone();
        let operation = job.operation();
        let report = |status| InvocationReport {
            agent_id: agent.id,
            operation,
            status,
        };

        let lease = match self.memory.lease(agent.id).await {
            Ok(lease) => lease,
            Err(e) => {
                log::error!("Could not lease agent {}: {:#}", agent.id, e);
                return report(InvocationStatus::Skipped {
                    reason: e.to_string(),
                });
            }
        };

        match self.storage.load_failure_state(agent.id).await {
            Ok(state) if state.disabled => {
                return report(InvocationStatus::Skipped {
                    reason: "agent is disabled".to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Could not load failure state of agent {}: {:#}", agent.id, e);
                return report(InvocationStatus::Skipped {
                    reason: e.to_string(),
                });
            }
        }

        let result = self.execute(&lease, job, now).await;

        if operation == Operation::Check {
            let stamp = Activity {
                checked_at: Some(now),
                ..Default::default()
            };
            if let Err(e) = self.storage.record_activity(agent.id, stamp).await {
                log::warn!("Could not stamp last check of agent {}: {:#}", agent.id, e);
            }
        }

        match result {
            Ok(emitted) => {
                if let Err(e) = self.failures.record_success(&lease).await {
                    log::warn!("Could not reset failures of agent {}: {:#}", agent.id, e);
                }
                report(InvocationStatus::Succeeded { emitted })
            }
            Err(error) => {
                let disabled = match self
                    .failures
                    .record_failure(&lease, &agent, operation, &error)
                    .await
                {
                    Ok(outcome) => matches!(outcome, FailureOutcome::Disabled { .. }),
                    Err(e) => {
                        log::error!("Could not record failure of agent {}: {:#}", agent.id, e);
                        false
                    }
                };
                report(InvocationStatus::Failed {
                    error: error.to_string(),
                    disabled,
                })
            }
        }
    }

    /// Runs the capability and, only if it succeeds, commits memory, emitted
    /// events and watermarks in that order.
    async fn execute(
        &self,
        lease: &AgentLease,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<usize, InvocationError> {
        let agent = job.agent().clone();
        let capability = self
            .registry
            .build(&agent.kind)
            .map_err(|_| InvocationError::UnknownKind(agent.kind.clone()))?;

        let memory = self.memory.load(lease).await?;
        let mut ctx = AgentContext::new(agent.clone(), memory, capability.can_create_events(), now);

        let invocation = async {
            match &job {
                Job::Check { .. } => capability.check(&mut ctx).await,
                Job::Receive { events, .. } => capability.receive(&mut ctx, events).await,
            }
        };
        match tokio::time::timeout(self.timeout, AssertUnwindSafe(invocation).catch_unwind()).await {
            Err(_) => return Err(InvocationError::Timeout(self.timeout)),
            Ok(Err(panic)) => return Err(InvocationError::Panicked(panic_message(panic))),
            Ok(Ok(Err(e))) => return Err(InvocationError::Failed(e)),
            Ok(Ok(Ok(()))) => {}
        }

        let (memory, drafts) = ctx.into_parts();
        self.memory.commit(lease, &memory).await?;

        let emitted = drafts.len();
        if emitted > 0 {
            self.storage
                .append_events(agent.id, drafts, now, agent.keep_events_for_secs)
                .await?;
        }

        let received = matches!(job, Job::Receive { .. });
        if let Job::Receive { advances, .. } = job {
            for (key, event_id) in advances {
                self.storage.commit_watermark(key, event_id).await?;
            }
        }

        let activity = Activity {
            checked_at: None,
            received_at: received.then_some(now),
            event_at: (emitted > 0).then_some(now),
        };
        if received || emitted > 0 {
            self.storage.record_activity(agent.id, activity).await?;
        }
        Ok(emitted)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
