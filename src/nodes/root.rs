//! Root node: the single entry point of the network.

use std::sync::Arc;

use super::{Activation, Emission, MemoryCounts};
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;

/// Stores every asserted fact and fans it out to the type nodes.
#[derive(Debug)]
pub struct RootNode {
    id: String,
    memory: RwLock<WorkingMemory>,
}

impl RootNode {
    /// Create the root.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            memory: RwLock::new(WorkingMemory::new()),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn activate(&self, activation: Activation) -> Vec<Emission> {
        match activation {
            Activation::Assert(fact) | Activation::Right(fact) => {
                self.memory.write().add_fact(Arc::clone(&fact));
                vec![Emission::Fact(fact)]
            }
            Activation::RetractFact(id) => {
                if self.memory.write().remove_fact(&id).is_some() {
                    vec![Emission::RetractFact(id)]
                } else {
                    Vec::new()
                }
            }
            // The root never holds tokens.
            Activation::Left(_) | Activation::RetractDerived(_) => Vec::new(),
        }
    }

    /// Look up a stored fact.
    pub fn fact(&self, id: &str) -> Option<Arc<crate::types::Fact>> {
        self.memory.read().get_fact(id).cloned()
    }

    /// Every stored fact, in assertion order.
    pub fn facts(&self) -> Vec<Arc<crate::types::Fact>> {
        self.memory.read().list_facts()
    }

    pub(crate) fn counts(&self) -> MemoryCounts {
        let memory = self.memory.read();
        MemoryCounts {
            facts: memory.fact_count(),
            tokens: 0,
        }
    }

    pub(crate) fn snapshot(&self) -> MemorySnapshot {
        self.memory.read().snapshot()
    }

    pub(crate) fn restore(&self, snapshot: MemorySnapshot) {
        *self.memory.write() = WorkingMemory::from_snapshot(snapshot);
    }

    pub(crate) fn clear(&self) {
        self.memory.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fact;

    #[test]
    fn test_root_stores_and_forwards() {
        let root = RootNode::new("root");
        let fact = Arc::new(Fact::new("F1", "Person"));
        let out = root.activate(Activation::Assert(fact));
        assert!(matches!(out.as_slice(), [Emission::Fact(f)] if f.id == "F1"));
        assert!(root.fact("F1").is_some());

        let out = root.activate(Activation::RetractFact("F1".into()));
        assert_eq!(out.len(), 1);
        assert!(root.facts().is_empty());

        // Retracting an unknown fact is silent.
        assert!(root.activate(Activation::RetractFact("F1".into())).is_empty());
    }
}
