//! Alpha node: single-fact predicate bound to one variable.

use std::sync::Arc;

use super::{Activation, Emission, MemoryCounts, NodeContext};
use crate::ast::Expr;
use crate::condition::{EvalContext, evaluate_bool};
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;
use crate::types::{Fact, Token};

/// Tests each arriving fact and emits a one-fact token on a match.
///
/// With no conditions the node is a pass-through, used to feed the right
/// input of gate nodes.
#[derive(Debug)]
pub struct AlphaNode {
    id: String,
    variable: String,
    conditions: Vec<Expr>,
    memory: RwLock<WorkingMemory>,
}

impl AlphaNode {
    /// Create an alpha node.
    pub fn new(id: impl Into<String>, variable: impl Into<String>, conditions: Vec<Expr>) -> Self {
        Self {
            id: id.into(),
            variable: variable.into(),
            conditions,
            memory: RwLock::new(WorkingMemory::new()),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Variable the matching fact is bound to.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Conjunction the node tests.
    pub fn conditions(&self) -> &[Expr] {
        &self.conditions
    }

    /// Whether a fact satisfies every condition.
    ///
    /// Evaluation errors count as a failed match.
    pub fn matches(&self, fact: &Fact) -> bool {
        let ctx = EvalContext::Fact(fact);
        self.conditions.iter().all(|condition| match evaluate_bool(condition, &ctx) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::trace!("Alpha {} skipped fact {}: {}", self.id, fact.id, e);
                false
            }
        })
    }

    pub(crate) fn activate(&self, activation: Activation, ctx: NodeContext<'_>) -> Vec<Emission> {
        match activation {
            Activation::Assert(fact) | Activation::Right(fact) => {
                if !self.matches(&fact) {
                    return Vec::new();
                }
                let token =
                    Token::alpha(ctx.tokens.next_id(), &self.variable, Arc::clone(&fact), &self.id);
                let mut memory = self.memory.write();
                // A re-asserted fact replaces its old token.
                memory.remove_tokens_with_fact(&fact.id);
                memory.add_fact(Arc::clone(&fact));
                memory.add_token(token.clone());
                vec![Emission::Match { fact, token }]
            }
            Activation::RetractFact(id) => {
                let mut memory = self.memory.write();
                let removed = memory.remove_fact(&id).is_some();
                memory.remove_tokens_with_fact(&id);
                if removed {
                    vec![Emission::RetractFact(id)]
                } else {
                    Vec::new()
                }
            }
            Activation::Left(_) | Activation::RetractDerived(_) => Vec::new(),
        }
    }

    /// Facts that passed the conditions.
    pub fn facts(&self) -> Vec<Arc<Fact>> {
        self.memory.read().list_facts()
    }

    /// The matches held, as they were emitted.
    pub(crate) fn replay(&self) -> Vec<Emission> {
        let memory = self.memory.read();
        memory
            .tokens()
            .filter_map(|token| {
                let fact = token.facts.first()?;
                Some(Emission::Match {
                    fact: Arc::clone(fact),
                    token: token.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn counts(&self) -> MemoryCounts {
        let memory = self.memory.read();
        MemoryCounts {
            facts: memory.fact_count(),
            tokens: memory.token_count(),
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
    use crate::ast::Operator;
    use crate::types::TokenIdGenerator;

    fn create_test_adult_filter() -> AlphaNode {
        AlphaNode::new(
            "adults_alpha_p",
            "p",
            vec![Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(18))],
        )
    }

    #[test]
    fn test_alpha_filters_and_binds() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let node = create_test_adult_filter();

        let adult = Arc::new(Fact::new("U1", "Person").field("age", 25));
        let out = node.activate(Activation::Assert(adult), ctx);
        match out.as_slice() {
            [Emission::Match { fact, token }] => {
                assert_eq!(fact.id, "U1");
                assert_eq!(token.variables(), vec!["p"]);
                assert_eq!(token.parent, None);
                assert!(!token.is_join_result);
            }
            other => panic!("unexpected emissions: {:?}", other),
        }

        let minor = Arc::new(Fact::new("U2", "Person").field("age", 12));
        assert!(node.activate(Activation::Assert(minor), ctx).is_empty());
        assert_eq!(node.counts(), MemoryCounts { facts: 1, tokens: 1 });
    }

    #[test]
    fn test_missing_field_is_no_match() {
        let node = create_test_adult_filter();
        assert!(!node.matches(&Fact::new("U3", "Person")));
    }

    #[test]
    fn test_retract_forwards_only_known_facts() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let node = AlphaNode::new("pass", "x", Vec::new());

        node.activate(Activation::Assert(Arc::new(Fact::new("F1", "T"))), ctx);
        let out = node.activate(Activation::RetractFact("F1".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractFact(id)] if id == "F1"));
        assert!(node.activate(Activation::RetractFact("F1".into()), ctx).is_empty());
        assert_eq!(node.counts(), MemoryCounts::default());
    }
}
