//! Per-agent memory access. Loading or committing memory requires an
//! [`AgentLease`], and at most one lease per agent exists at a time, so
//! invocations of the same agent never overlap while different agents
//! proceed independently.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::storage::traits::Storage;
use crate::types::{AgentId, AgentMemory};

pub struct AgentLease {
    agent_id: AgentId,
    _guard: OwnedMutexGuard<()>,
}

impl AgentLease {
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }
}

pub struct MemoryStore {
    storage: Arc<dyn Storage>,
    leases: Mutex<HashMap<AgentId, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until no other invocation holds `agent_id`.
    pub async fn lease(&self, agent_id: AgentId) -> Result<AgentLease> {
        let lock = {
            let mut leases = self
                .leases
                .lock()
                .map_err(|_| anyhow!("lease table lock poisoned"))?;
            leases
                .entry(agent_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        Ok(AgentLease {
            agent_id,
            _guard: lock.lock_owned().await,
        })
    }

    pub async fn load(&self, lease: &AgentLease) -> Result<AgentMemory> {
        self.storage.load_memory(lease.agent_id).await
    }

    pub async fn commit(&self, lease: &AgentLease, memory: &AgentMemory) -> Result<()> {
        self.storage.commit_memory(lease.agent_id, memory).await
    }
}
