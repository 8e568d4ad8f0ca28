use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Activity, Agent, AgentId, AgentLogEntry, AgentMemory, Edge, EdgeKey, Event, EventDraft,
    EventId, FailureState, TickWindow,
};

/// Persistence collaborator. Implementations must assign event ids
/// atomically and in strictly increasing order.
#[async_trait]
pub trait Storage: Send + Sync {
    // Agent operations
    /// Stores a new agent with empty memory. Its sources become edges whose
    /// watermark starts at each producer's latest event.
    async fn create_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn list_active_agents(&self) -> Result<Vec<Agent>>;

    async fn list_due_agents(
        &self,
        window: &TickWindow,
        utc_offset_secs: i64,
    ) -> Result<Vec<Agent>> {
        Ok(self
            .list_active_agents()
            .await?
            .into_iter()
            .filter(|a| a.schedule.is_due(window, utc_offset_secs))
            .collect())
    }

    async fn record_activity(&self, id: AgentId, activity: Activity) -> Result<()>;

    // Graph edges
    async fn add_source(&self, consumer: AgentId, producer: AgentId) -> Result<()>;
    async fn list_edges(&self) -> Result<Vec<Edge>>;
    async fn commit_watermark(&self, key: EdgeKey, event_id: EventId) -> Result<()>;

    // Event log
    async fn append_events(
        &self,
        agent_id: AgentId,
        drafts: Vec<EventDraft>,
        created_at: DateTime<Utc>,
        keep_for_secs: u64,
    ) -> Result<Vec<Event>>;
    /// Events of `producer` with `after < id <= ceiling`, ascending.
    async fn events_after(
        &self,
        producer: AgentId,
        after: EventId,
        ceiling: EventId,
    ) -> Result<Vec<Event>>;
    /// 0 when the log is empty.
    async fn latest_event_id(&self) -> Result<EventId>;
    async fn latest_event_id_for(&self, producer: AgentId) -> Result<EventId>;
    async fn cleanup_expired_events(&self, now: DateTime<Utc>) -> Result<u64>;

    // Agent memory
    async fn load_memory(&self, id: AgentId) -> Result<AgentMemory>;
    async fn commit_memory(&self, id: AgentId, memory: &AgentMemory) -> Result<()>;

    // Failure counters
    async fn load_failure_state(&self, id: AgentId) -> Result<FailureState>;
    async fn commit_failure_state(&self, id: AgentId, state: FailureState) -> Result<()>;

    // Agent logs
    async fn record_log(&self, entry: &AgentLogEntry) -> Result<()>;
    /// Newest first.
    async fn get_logs(&self, id: AgentId) -> Result<Vec<AgentLogEntry>>;
}
