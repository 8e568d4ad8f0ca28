use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::capabilities::digest::DigestCapability;
use crate::capabilities::emitter::EmitterCapability;
use crate::capabilities::Capability;
use crate::error::RegistryError;

pub type CapabilityFactory = Arc<dyn Fn() -> Arc<dyn Capability> + Send + Sync>;

/// Maps an agent kind to the factory producing its capability. Filled once
/// at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: HashMap<String, CapabilityFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let emitter: CapabilityFactory =
            Arc::new(|| -> Arc<dyn Capability> { Arc::new(EmitterCapability::new()) });
        let digest: CapabilityFactory =
            Arc::new(|| -> Arc<dyn Capability> { Arc::new(DigestCapability::new()) });
        Self {
            factories: HashMap::from([
                (EmitterCapability::KIND.to_string(), emitter),
                (DigestCapability::KIND.to_string(), digest),
            ]),
        }
    }

    pub fn register<F>(&mut self, kind: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Arc<dyn Capability> + Send + Sync + 'static,
    {
        if self.factories.contains_key(kind) {
            return Err(RegistryError::DuplicateKind(kind.to_string()));
        }
        self.factories.insert(kind.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn build(&self, kind: &str) -> Result<Arc<dyn Capability>, RegistryError> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Restricts a scheduler process to a family of agent kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    All,
    Only(BTreeSet<String>),
    Except(BTreeSet<String>),
}

impl KindFilter {
    pub fn only<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KindFilter::Only(kinds.into_iter().map(Into::into).collect())
    }

    pub fn except<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KindFilter::Except(kinds.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, kind: &str) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Only(kinds) => kinds.contains(kind),
            KindFilter::Except(kinds) => !kinds.contains(kind),
        }
    }

    /// Kinds this filter names that the registry does not know.
    pub fn unknown_kinds(&self, registry: &AgentRegistry) -> Vec<String> {
        match self {
            KindFilter::All => Vec::new(),
            KindFilter::Only(kinds) | KindFilter::Except(kinds) => kinds
                .iter()
                .filter(|k| !registry.contains(k))
                .cloned()
                .collect(),
        }
    }
}
