//! Checks applied whenever source edges are declared.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::types::AgentId;

/// Validates that `consumer` may consume from each of `new_sources`, given
/// every known agent's current sources.
pub fn validate_sources(
    consumer: AgentId,
    new_sources: &[AgentId],
    sources_of: &HashMap<AgentId, Vec<AgentId>>,
) -> Result<(), GraphError> {
    let mut declared = HashSet::new();
    for &source_id in new_sources {
        if !declared.insert(source_id) {
            return Err(GraphError::DuplicateSource {
                consumer,
                source_id,
            });
        }
        if source_id == consumer {
            return Err(GraphError::SelfLoop(consumer));
        }
        if !sources_of.contains_key(&source_id) {
            return Err(GraphError::UnknownSource {
                consumer,
                source_id,
            });
        }
        if reaches_upstream(source_id, consumer, sources_of) {
            return Err(GraphError::Cycle {
                consumer,
                source_id,
            });
        }
    }
    Ok(())
}

/// Whether `target` feeds into `start`, directly or transitively.
fn reaches_upstream(
    start: AgentId,
    target: AgentId,
    sources_of: &HashMap<AgentId, Vec<AgentId>>,
) -> bool {
    let mut visited = HashSet::new();
    let mut to_visit = vec![start];

    while let Some(current) = to_visit.pop() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(sources) = sources_of.get(&current) {
            to_visit.extend(sources.iter().copied());
        }
    }
    false
}
