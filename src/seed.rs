//! Agent graphs declared in YAML, used to populate a fresh store.
//!
//! ```yaml
//! - name: heartbeat
//!   kind: emitter
//!   schedule: every_5m
//!   options:
//!     payload: { message: "tick" }
//! - name: morning digest
//!   kind: digest
//!   sources: [heartbeat]
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::AgentError;
use crate::registry::AgentRegistry;
use crate::storage::traits::Storage;
use crate::types::event::MAX_KEEP_EVENTS_FOR_SECS;
use crate::types::{Agent, AgentId, OwnerId, Schedule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub options: Option<Value>,
    /// Names of earlier entries in the same file.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub keep_events_for_secs: u64,
    #[serde(default)]
    pub disabled: bool,
}

/// Configuration problems found for one seeded agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedProblem {
    pub name: String,
    pub errors: Vec<String>,
}

pub fn parse_seeds(yaml: &str) -> Result<Vec<AgentSeed>> {
    serde_yaml::from_str(yaml).map_err(|e| anyhow!("Failed to parse agent seed YAML: {}", e))
}

pub fn load_seeds(path: &Path) -> Result<Vec<AgentSeed>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agents file {}", path.display()))?;
    parse_seeds(&raw).with_context(|| format!("Invalid agents file {}", path.display()))
}

/// Default options of the kind with the seed's explicit keys laid over them.
fn merged_options(defaults: Value, explicit: Option<&Value>) -> Value {
    match (defaults, explicit) {
        (Value::Object(mut base), Some(Value::Object(overrides))) => {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (_, Some(explicit)) => explicit.clone(),
        (defaults, None) => defaults,
    }
}

/// Reports every seed with an unknown kind, a bad or repeated source
/// reference, an oversized retention or options its kind rejects. An empty result means the file is usable.
pub fn validate_seeds(seeds: &[AgentSeed], registry: &AgentRegistry) -> Vec<SeedProblem> {
    let mut seen: Vec<&str> = Vec::new();
    let mut problems = Vec::new();

    for seed in seeds {
        let mut errors = Vec::new();
        if seen.contains(&seed.name.as_str()) {
            errors.push(format!("duplicate agent name '{}'", seed.name));
        }
        let mut listed = HashSet::new();
        for source in &seed.sources {
            if !seen.contains(&source.as_str()) {
                errors.push(format!("source '{}' is not declared before this agent", source));
            }
            if !listed.insert(source.as_str()) {
                errors.push(format!("source '{}' is listed more than once", source));
            }
        }
        if seed.keep_events_for_secs > MAX_KEEP_EVENTS_FOR_SECS {
            errors.push(AgentError::RetentionTooLong(seed.keep_events_for_secs).to_string());
        }
        match registry.build(&seed.kind) {
            Ok(capability) => {
                let options = merged_options(capability.default_options(), seed.options.as_ref());
                errors.extend(capability.validate_options(&options));
            }
            Err(e) => errors.push(e.to_string()),
        }

        if !errors.is_empty() {
            problems.push(SeedProblem {
                name: seed.name.clone(),
                errors,
            });
        }
        seen.push(&seed.name);
    }
    problems
}

/// Turns seeds into agents owned by `owner`, filling in kind defaults and
/// resolving source names. Option validation is left to the scheduler,
/// which skips invalid agents at run time.
pub fn build_agents(
    seeds: &[AgentSeed],
    registry: &AgentRegistry,
    owner: OwnerId,
) -> Result<Vec<Agent>> {
    let mut ids: HashMap<&str, AgentId> = HashMap::new();
    let mut agents = Vec::with_capacity(seeds.len());

    for seed in seeds {
        if ids.contains_key(seed.name.as_str()) {
            return Err(anyhow!("Duplicate agent name '{}'", seed.name));
        }
        let capability = registry.build(&seed.kind)?;
        let sources = seed
            .sources
            .iter()
            .map(|name| {
                ids.get(name.as_str()).copied().ok_or_else(|| {
                    anyhow!("Agent '{}' lists unknown source '{}'", seed.name, name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut listed = HashSet::new();
        if let Some(name) = seed.sources.iter().find(|name| !listed.insert(name.as_str())) {
            return Err(anyhow!("Agent '{}' lists source '{}' more than once", seed.name, name));
        }

        let schedule = seed
            .schedule
            .unwrap_or_else(|| capability.default_schedule());
        let options = merged_options(capability.default_options(), seed.options.as_ref());

        let mut agent = Agent::new(owner, seed.kind.clone(), seed.name.clone(), schedule, options)
            .with_sources(sources)
            .with_keep_events_for(seed.keep_events_for_secs);
        agent.disabled = seed.disabled;
        agent
            .validate()
            .with_context(|| format!("Agent '{}' is misconfigured", seed.name))?;

        ids.insert(&seed.name, agent.id);
        agents.push(agent);
    }
    Ok(agents)
}

/// Loads `path` into `storage` under a freshly generated owner.
pub async fn seed_storage(
    storage: &dyn Storage,
    registry: &AgentRegistry,
    path: &Path,
) -> Result<Vec<Agent>> {
    let seeds = load_seeds(path)?;
    let agents = build_agents(&seeds, registry, OwnerId::new_v4())?;
    for agent in &agents {
        storage.create_agent(agent).await?;
    }
    log::info!("Seeded {} agents from {}", agents.len(), path.display());
    Ok(agents)
}
