use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::engine::dispatch::{Dispatcher, InvocationReport, Job};
use crate::engine::invocable;
use crate::registry::{AgentRegistry, KindFilter};
use crate::storage::traits::Storage;
use crate::types::{Agent, AgentId, Edge, EventId};

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Highest event id considered by the pass.
    pub ceiling: EventId,
    pub deliveries: Vec<InvocationReport>,
}

impl PassReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|r| r.succeeded()).count()
    }
}

/// Moves events from producers to consumers along the agent graph.
///
/// A pass fixes its ceiling to the newest event id before delivering
/// anything, so events emitted while receiving wait for the next pass.
/// Each consumer receives the union of its pending events across all of
/// its sources as one batch in id order; watermarks only move when that
/// receive succeeds.
pub struct Propagator {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    filter: KindFilter,
}

impl Propagator {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<Dispatcher>,
        filter: KindFilter,
    ) -> Self {
        Self {
            storage,
            registry,
            dispatcher,
            filter,
        }
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let ceiling = self.storage.latest_event_id().await?;
        let jobs = self.plan(ceiling).await?;
        if jobs.is_empty() {
            return Ok(PassReport {
                ceiling,
                deliveries: Vec::new(),
            });
        }

        log::debug!("Propagating up to event {} to {} consumers", ceiling, jobs.len());
        let deliveries = self.dispatcher.run_all(jobs, now).await;
        Ok(PassReport {
            ceiling,
            deliveries,
        })
    }

    async fn plan(&self, ceiling: EventId) -> Result<Vec<Job>> {
        let agents: HashMap<AgentId, Agent> = self
            .storage
            .list_agents()
            .await?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        let mut by_consumer: BTreeMap<AgentId, Vec<Edge>> = BTreeMap::new();
        for edge in self.storage.list_edges().await? {
            if edge.watermark < ceiling {
                by_consumer.entry(edge.key.consumer).or_default().push(edge);
            }
        }

        let mut jobs = Vec::new();
        for (consumer_id, edges) in by_consumer {
            let Some(consumer) = agents.get(&consumer_id) else {
                continue;
            };
            match invocable(&self.registry, &self.filter, consumer) {
                Some(capability) if capability.can_receive_events() => {}
                _ => continue,
            }

            let mut events = Vec::new();
            let mut advances = Vec::new();
            for edge in edges {
                let pending = self
                    .storage
                    .events_after(edge.key.producer, edge.watermark, ceiling)
                    .await?;
                if let Some(last) = pending.last() {
                    advances.push((edge.key, last.id));
                    events.extend(pending);
                }
            }
            if events.is_empty() {
                continue;
            }
            events.sort_by_key(|e| e.id);

            jobs.push(Job::Receive {
                agent: consumer.clone(),
                events,
                advances,
            });
        }
        Ok(jobs)
    }
}
