pub mod dispatch;
pub mod memory;
pub mod propagation;
pub mod scheduler;

pub use dispatch::{DispatchConfig, Dispatcher, InvocationReport, InvocationStatus, Job};
pub use memory::{AgentLease, MemoryStore};
pub use propagation::{PassReport, Propagator};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};

use std::sync::Arc;

use crate::capabilities::Capability;
use crate::registry::{AgentRegistry, KindFilter};
use crate::types::Agent;

/// The capability for `agent` if this process may invoke it at all.
/// Invalid options are a configuration problem: the agent is skipped and
/// the problem is logged, but it never counts as a runtime failure.
pub(crate) fn invocable(
    registry: &AgentRegistry,
    filter: &KindFilter,
    agent: &Agent,
) -> Option<Arc<dyn Capability>> {
    if agent.disabled || !filter.allows(&agent.kind) {
        return None;
    }
    let capability = match registry.build(&agent.kind) {
        Ok(capability) => capability,
        Err(e) => {
            log::warn!("Skipping agent {} ({}): {}", agent.id, agent.name, e);
            return None;
        }
    };
    let errors = capability.validate_options(&agent.options);
    if !errors.is_empty() {
        log::warn!(
            "Skipping agent {} ({}) with invalid options: {}",
            agent.id,
            agent.name,
            errors.join("; ")
        );
        return None;
    }
    Some(capability)
}
