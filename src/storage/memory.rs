use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::graph::validate_sources;
use crate::storage::traits::Storage;
use crate::types::{
    Activity, Agent, AgentId, AgentLogEntry, AgentMemory, Edge, EdgeKey, Event, EventDraft,
    EventId, FailureState,
};

#[derive(Default)]
struct EventLog {
    last_id: EventId,
    events: BTreeMap<EventId, Event>,
}

impl EventLog {
    fn latest_for(&self, producer: AgentId) -> EventId {
        self.events
            .values()
            .rev()
            .find(|e| e.agent_id == producer)
            .map(|e| e.id)
            .unwrap_or(0)
    }
}

/// Process-local store. Lock order is agents, then events, then
/// watermarks, then logs.
#[derive(Clone)]
pub struct InMemoryStore {
    agents: Arc<RwLock<HashMap<AgentId, Agent>>>,
    events: Arc<RwLock<EventLog>>,
    watermarks: Arc<RwLock<HashMap<EdgeKey, EventId>>>,
    logs: Arc<RwLock<HashMap<AgentId, Vec<AgentLogEntry>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(EventLog::default())),
            watermarks: Arc::new(RwLock::new(HashMap::new())),
            logs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// All stored events in id order.
    pub fn all_events(&self) -> Result<Vec<Event>> {
        Ok(read(&self.events)?.events.values().cloned().collect())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn sources_of(agents: &HashMap<AgentId, Agent>) -> HashMap<AgentId, Vec<AgentId>> {
    agents
        .values()
        .map(|a| (a.id, a.sources.clone()))
        .collect()
}

fn agent_mut(agents: &mut HashMap<AgentId, Agent>, id: AgentId) -> Result<&mut Agent> {
    agents
        .get_mut(&id)
        .ok_or_else(|| anyhow!("Agent {} not found", id))
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let mut agents = write(&self.agents)?;
        if agents.contains_key(&agent.id) {
            return Err(anyhow!("Agent {} already exists", agent.id));
        }
        agent.validate()?;
        validate_sources(agent.id, &agent.sources, &sources_of(&agents))?;

        let events = read(&self.events)?;
        let mut watermarks = write(&self.watermarks)?;
        for &producer in &agent.sources {
            watermarks.insert(EdgeKey::new(producer, agent.id), events.latest_for(producer));
        }
        agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(read(&self.agents)?.get(&id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = read(&self.agents)?.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn list_active_agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = read(&self.agents)?
            .values()
            .filter(|a| !a.disabled)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn record_activity(&self, id: AgentId, activity: Activity) -> Result<()> {
        let mut agents = write(&self.agents)?;
        let agent = agent_mut(&mut agents, id)?;
        if let Some(at) = activity.checked_at {
            agent.last_checked_at = Some(at);
        }
        if let Some(at) = activity.received_at {
            agent.last_receive_at = Some(at);
        }
        if let Some(at) = activity.event_at {
            agent.last_event_at = Some(at);
        }
        Ok(())
    }

    async fn add_source(&self, consumer: AgentId, producer: AgentId) -> Result<()> {
        let mut agents = write(&self.agents)?;
        if !agents.contains_key(&consumer) {
            return Err(anyhow!("Agent {} not found", consumer));
        }
        if agents[&consumer].sources.contains(&producer) {
            return Ok(());
        }
        validate_sources(consumer, &[producer], &sources_of(&agents))?;

        let events = read(&self.events)?;
        write(&self.watermarks)?.insert(EdgeKey::new(producer, consumer), events.latest_for(producer));
        agent_mut(&mut agents, consumer)?.sources.push(producer);
        Ok(())
    }

    async fn list_edges(&self) -> Result<Vec<Edge>> {
        let agents = read(&self.agents)?;
        let watermarks = read(&self.watermarks)?;
        Ok(agents
            .values()
            .flat_map(|consumer| {
                consumer.sources.iter().map(|&producer| {
                    let key = EdgeKey::new(producer, consumer.id);
                    Edge {
                        key,
                        watermark: watermarks.get(&key).copied().unwrap_or(0),
                    }
                })
            })
            .collect())
    }

    async fn commit_watermark(&self, key: EdgeKey, event_id: EventId) -> Result<()> {
        write(&self.watermarks)?.insert(key, event_id);
        Ok(())
    }

    async fn append_events(
        &self,
        agent_id: AgentId,
        drafts: Vec<EventDraft>,
        created_at: DateTime<Utc>,
        keep_for_secs: u64,
    ) -> Result<Vec<Event>> {
        let mut log = write(&self.events)?;
        let mut appended = Vec::with_capacity(drafts.len());
        for draft in drafts {
            log.last_id += 1;
            let event = draft.into_event(log.last_id, agent_id, created_at, keep_for_secs);
            log.events.insert(event.id, event.clone());
            appended.push(event);
        }
        Ok(appended)
    }

    async fn events_after(
        &self,
        producer: AgentId,
        after: EventId,
        ceiling: EventId,
    ) -> Result<Vec<Event>> {
        if ceiling <= after {
            return Ok(Vec::new());
        }
        Ok(read(&self.events)?
            .events
            .range(after + 1..=ceiling)
            .map(|(_, e)| e)
            .filter(|e| e.agent_id == producer)
            .cloned()
            .collect())
    }

    async fn latest_event_id(&self) -> Result<EventId> {
        Ok(read(&self.events)?.last_id)
    }

    async fn latest_event_id_for(&self, producer: AgentId) -> Result<EventId> {
        Ok(read(&self.events)?.latest_for(producer))
    }

    async fn cleanup_expired_events(&self, now: DateTime<Utc>) -> Result<u64> {
        let agents = read(&self.agents)?;
        let mut log = write(&self.events)?;
        let watermarks = read(&self.watermarks)?;

        let mut unread_floor: HashMap<AgentId, EventId> = HashMap::new();
        for consumer in agents.values() {
            for &producer in &consumer.sources {
                let mark = watermarks
                    .get(&EdgeKey::new(producer, consumer.id))
                    .copied()
                    .unwrap_or(0);
                unread_floor
                    .entry(producer)
                    .and_modify(|m| *m = (*m).min(mark))
                    .or_insert(mark);
            }
        }

        let doomed: Vec<EventId> = log
            .events
            .values()
            .filter(|e| e.is_expired(now))
            .filter(|e| unread_floor.get(&e.agent_id).map_or(true, |&floor| e.id <= floor))
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            log.events.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn load_memory(&self, id: AgentId) -> Result<AgentMemory> {
        read(&self.agents)?
            .get(&id)
            .map(|a| a.memory.clone())
            .ok_or_else(|| anyhow!("Agent {} not found", id))
    }

    async fn commit_memory(&self, id: AgentId, memory: &AgentMemory) -> Result<()> {
        let mut agents = write(&self.agents)?;
        agent_mut(&mut agents, id)?.memory = memory.clone();
        Ok(())
    }

    async fn load_failure_state(&self, id: AgentId) -> Result<FailureState> {
        read(&self.agents)?
            .get(&id)
            .map(|a| a.failure_state())
            .ok_or_else(|| anyhow!("Agent {} not found", id))
    }

    async fn commit_failure_state(&self, id: AgentId, state: FailureState) -> Result<()> {
        let mut agents = write(&self.agents)?;
        let agent = agent_mut(&mut agents, id)?;
        agent.consecutive_failures = state.consecutive_failures;
        agent.disabled = state.disabled;
        Ok(())
    }

    async fn record_log(&self, entry: &AgentLogEntry) -> Result<()> {
        write(&self.logs)?
            .entry(entry.agent_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_logs(&self, id: AgentId) -> Result<Vec<AgentLogEntry>> {
        let mut entries = read(&self.logs)?.get(&id).cloned().unwrap_or_default();
        entries.reverse();
        Ok(entries)
    }
}
