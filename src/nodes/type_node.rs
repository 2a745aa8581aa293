//! Type node: one per declared type.

use std::sync::Arc;

use super::{Activation, Emission, MemoryCounts};
use crate::ast::TypeDefinition;
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::registry::conform_to;
use crate::sync::RwLock;
use crate::types::Fact;

/// Accepts facts of one type whose fields match the declaration.
#[derive(Debug)]
pub struct TypeNode {
    id: String,
    definition: TypeDefinition,
    memory: RwLock<WorkingMemory>,
}

impl TypeNode {
    /// Conventional identifier of the type node for a type.
    pub fn id_for(type_name: &str) -> String {
        format!("type_{}", type_name)
    }

    /// Create a type node.
    pub fn new(definition: TypeDefinition) -> Self {
        Self {
            id: Self::id_for(&definition.name),
            definition,
            memory: RwLock::new(WorkingMemory::new()),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Accepted type name.
    pub fn type_name(&self) -> &str {
        &self.definition.name
    }

    /// The declaration the node validates against.
    pub fn definition(&self) -> &TypeDefinition {
        &self.definition
    }

    pub(crate) fn activate(&self, activation: Activation) -> Vec<Emission> {
        match activation {
            Activation::Assert(fact) | Activation::Right(fact) => {
                if fact.type_name != self.definition.name {
                    return Vec::new();
                }
                let fact = match conform_to(&self.definition, &fact) {
                    Ok(conformed) => Arc::new(conformed),
                    Err(e) => {
                        tracing::warn!("Type node {} rejected fact {}: {}", self.id, fact.id, e);
                        return Vec::new();
                    }
                };
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
            Activation::Left(_) | Activation::RetractDerived(_) => Vec::new(),
        }
    }

    /// Facts currently accepted, in arrival order.
    pub fn facts(&self) -> Vec<Arc<Fact>> {
        self.memory.read().list_facts()
    }

    pub(crate) fn counts(&self) -> MemoryCounts {
        MemoryCounts {
            facts: self.memory.read().fact_count(),
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
