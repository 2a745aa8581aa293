//! Negation and existence gates.
//!
//! Both gates count, per left token, the right facts satisfying the gate
//! condition. A negation gate lets a token through while its count is zero,
//! an existence gate while it is positive. Passed tokens carry the left
//! bindings only; matching right facts are witnesses, never bindings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Activation, Emission, MemoryCounts, NodeContext};
use crate::ast::Expr;
use crate::condition::{EvalContext, evaluate_bool};
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;
use crate::types::{Fact, Token, TokenId};

/// Quantified variable and the condition a right fact must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Variable right facts are bound to while testing
    pub variable: String,
    /// Condition over the left bindings and the candidate; `None` matches any
    pub condition: Option<Expr>,
}

impl GateSpec {
    /// Build a gate specification.
    pub fn new(variable: impl Into<String>, condition: Option<Expr>) -> Self {
        Self {
            variable: variable.into(),
            condition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Absent,
    Present,
}

impl Polarity {
    fn open(self, count: usize) -> bool {
        match self {
            Polarity::Absent => count == 0,
            Polarity::Present => count > 0,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    memory: WorkingMemory,
    counts: HashMap<TokenId, usize>,
    propagated: HashSet<TokenId>,
}

#[derive(Debug)]
struct Gate {
    id: String,
    left_scope: Vec<String>,
    spec: GateSpec,
    polarity: Polarity,
    state: RwLock<GateState>,
}

impl Gate {
    fn new(id: String, left_scope: Vec<String>, spec: GateSpec, polarity: Polarity) -> Self {
        Self {
            id,
            left_scope,
            spec,
            polarity,
            state: RwLock::new(GateState::default()),
        }
    }

    fn satisfies(&self, token: &Token, fact: &Fact) -> bool {
        let Some(condition) = &self.spec.condition else {
            return true;
        };
        let ctx = EvalContext::with_candidate(&token.bindings, &self.spec.variable, fact);
        match evaluate_bool(condition, &ctx) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::trace!(
                    "Gate {} condition failed for {} / {}: {}",
                    self.id,
                    token.id,
                    fact.id,
                    e
                );
                false
            }
        }
    }

    fn pass(&self, token: &Token, ctx: NodeContext<'_>) -> Emission {
        Emission::Token(Token::passed_through(ctx.tokens.next_id(), token, &self.id))
    }

    fn activate(&self, activation: Activation, ctx: NodeContext<'_>) -> Vec<Emission> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        match activation {
            Activation::Left(token) => {
                let count = state.memory.facts().filter(|f| self.satisfies(&token, f)).count();
                state.counts.insert(token.id.clone(), count);
                let out = if self.polarity.open(count) {
                    state.propagated.insert(token.id.clone());
                    vec![self.pass(&token, ctx)]
                } else {
                    Vec::new()
                };
                state.memory.add_token(token);
                out
            }
            Activation::Right(fact) | Activation::Assert(fact) => {
                let mut out = Vec::new();
                let replaced = state.memory.add_fact(Arc::clone(&fact));
                for token in state.memory.tokens() {
                    let before = replaced.as_ref().is_some_and(|old| self.satisfies(token, old));
                    let after = self.satisfies(token, &fact);
                    if before == after {
                        continue;
                    }
                    let count = state.counts.entry(token.id.clone()).or_insert(0);
                    if after {
                        *count += 1;
                    } else {
                        *count = count.saturating_sub(1);
                    }
                    let open = self.polarity.open(*count);
                    let was_open = state.propagated.contains(&token.id);
                    if open && !was_open {
                        state.propagated.insert(token.id.clone());
                        out.push(self.pass(token, ctx));
                    } else if !open && was_open {
                        state.propagated.remove(&token.id);
                        out.push(Emission::RetractDerived(token.id.clone()));
                    }
                }
                out
            }
            Activation::RetractFact(id) => {
                let mut out = Vec::new();
                let removed_left = state.memory.remove_tokens_with_fact(&id);
                let mut forward = false;
                for token in &removed_left {
                    state.counts.remove(&token.id);
                    forward |= state.propagated.remove(&token.id);
                }
                if forward {
                    out.push(Emission::RetractFact(id.clone()));
                }

                if let Some(fact) = state.memory.remove_fact(&id) {
                    for token in state.memory.tokens() {
                        if !self.satisfies(token, &fact) {
                            continue;
                        }
                        let count = state.counts.entry(token.id.clone()).or_insert(0);
                        *count = count.saturating_sub(1);
                        let open = self.polarity.open(*count);
                        let was_open = state.propagated.contains(&token.id);
                        if open && !was_open {
                            state.propagated.insert(token.id.clone());
                            out.push(self.pass(token, ctx));
                        } else if !open && was_open {
                            state.propagated.remove(&token.id);
                            out.push(Emission::RetractDerived(token.id.clone()));
                        }
                    }
                }
                out
            }
            Activation::RetractDerived(parent) => {
                let removed = state.memory.remove_tokens_with_parent(&parent);
                let mut out = Vec::new();
                for token in removed {
                    state.counts.remove(&token.id);
                    if state.propagated.remove(&token.id) {
                        out.push(Emission::RetractDerived(token.id));
                    }
                }
                out
            }
        }
    }

    fn counts(&self) -> MemoryCounts {
        let state = self.state.read();
        MemoryCounts {
            facts: state.memory.fact_count(),
            tokens: state.memory.token_count(),
        }
    }

    fn snapshot(&self) -> MemorySnapshot {
        self.state.read().memory.snapshot()
    }

    /// Rebuild counts and the open set from restored memory.
    fn restore(&self, snapshot: MemorySnapshot) {
        let memory = WorkingMemory::from_snapshot(snapshot);
        let mut counts = HashMap::new();
        let mut propagated = HashSet::new();
        for token in memory.tokens() {
            let count = memory.facts().filter(|f| self.satisfies(token, f)).count();
            if self.polarity.open(count) {
                propagated.insert(token.id.clone());
            }
            counts.insert(token.id.clone(), count);
        }
        *self.state.write() = GateState {
            memory,
            counts,
            propagated,
        };
    }

    fn clear(&self) {
        *self.state.write() = GateState::default();
    }

    fn is_open(&self, token_id: &str) -> bool {
        self.state.read().propagated.contains(token_id)
    }
}

macro_rules! gate_node {
    ($name:ident, $polarity:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $name(Gate);

        impl $name {
            /// Create the gate.
            pub fn new(id: impl Into<String>, left_scope: Vec<String>, spec: GateSpec) -> Self {
                Self(Gate::new(id.into(), left_scope, spec, $polarity))
            }

            /// Node identifier.
            pub fn id(&self) -> &str {
                &self.0.id
            }

            /// Variables bound by left tokens, and by passed tokens.
            pub fn left_scope(&self) -> &[String] {
                &self.0.left_scope
            }

            /// Quantified variable and condition.
            pub fn spec(&self) -> &GateSpec {
                &self.0.spec
            }

            /// Whether the left token is currently let through.
            pub fn is_open(&self, token_id: &str) -> bool {
                self.0.is_open(token_id)
            }

            pub(crate) fn activate(
                &self,
                activation: Activation,
                ctx: NodeContext<'_>,
            ) -> Vec<Emission> {
                self.0.activate(activation, ctx)
            }

            pub(crate) fn counts(&self) -> MemoryCounts {
                self.0.counts()
            }

            pub(crate) fn snapshot(&self) -> MemorySnapshot {
                self.0.snapshot()
            }

            pub(crate) fn restore(&self, snapshot: MemorySnapshot) {
                self.0.restore(snapshot)
            }

            pub(crate) fn clear(&self) {
                self.0.clear()
            }
        }
    };
}

gate_node!(
    NotNode,
    Polarity::Absent,
    "Lets a left token through while no right fact satisfies the condition."
);
gate_node!(
    ExistsNode,
    Polarity::Present,
    "Lets a left token through while at least one right fact satisfies the condition."
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Operator;
    use crate::types::TokenIdGenerator;

    fn ban_spec() -> GateSpec {
        GateSpec::new(
            "b",
            Some(Expr::binary(
                Expr::field("b", "user_id"),
                Operator::Eq,
                Expr::field("u", "id"),
            )),
        )
    }

    fn create_test_user(tokens: &TokenIdGenerator) -> Token {
        let user = Arc::new(Fact::new("U1", "User"));
        Token::alpha(tokens.next_id(), "u", user, "alpha_u")
    }

    fn ban(id: &str, user: &str) -> Arc<Fact> {
        Arc::new(Fact::new(id, "Ban").field("user_id", user))
    }

    #[test]
    fn test_not_gate_lifecycle() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let gate = NotNode::new("allow_not_0", vec!["u".into()], ban_spec());
        let user = create_test_user(&tokens);

        let out = gate.activate(Activation::Left(user.clone()), ctx);
        match out.as_slice() {
            [Emission::Token(t)] => {
                assert_eq!(t.parent.as_deref(), Some(user.id.as_str()));
                assert_eq!(t.variables(), vec!["u"]);
            }
            other => panic!("unexpected emissions: {:?}", other),
        }

        let out = gate.activate(Activation::Right(ban("B1", "U1")), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractDerived(id)] if *id == user.id));
        assert!(!gate.is_open(&user.id));

        // A second ban keeps the gate closed without new emissions.
        assert!(gate.activate(Activation::Right(ban("B2", "U1")), ctx).is_empty());
        assert!(gate.activate(Activation::RetractFact("B1".into()), ctx).is_empty());

        let out = gate.activate(Activation::RetractFact("B2".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::Token(_)]));
        assert!(gate.is_open(&user.id));
    }

    #[test]
    fn test_unrelated_fact_does_not_block() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let gate = NotNode::new("n", vec!["u".into()], ban_spec());
        let user = create_test_user(&tokens);
        gate.activate(Activation::Left(user.clone()), ctx);
        assert!(gate.activate(Activation::Right(ban("B9", "U9")), ctx).is_empty());
        assert!(gate.is_open(&user.id));
    }

    #[test]
    fn test_exists_gate_is_dual() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let gate = ExistsNode::new("banned_exists_0", vec!["u".into()], ban_spec());
        let user = create_test_user(&tokens);

        assert!(gate.activate(Activation::Left(user.clone()), ctx).is_empty());
        let out = gate.activate(Activation::Right(ban("B1", "U1")), ctx);
        match out.as_slice() {
            [Emission::Token(t)] => assert_eq!(t.variables(), vec!["u"]),
            other => panic!("unexpected emissions: {:?}", other),
        }
        // Witnesses are not bindings, a second one changes nothing.
        assert!(gate.activate(Activation::Right(ban("B2", "U1")), ctx).is_empty());

        gate.activate(Activation::RetractFact("B1".into()), ctx);
        let out = gate.activate(Activation::RetractFact("B2".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractDerived(id)] if *id == user.id));
    }

    #[test]
    fn test_left_retraction_forwards_when_open() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let gate = NotNode::new("n", vec!["u".into()], ban_spec());
        gate.activate(Activation::Left(create_test_user(&tokens)), ctx);

        let out = gate.activate(Activation::RetractFact("U1".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractFact(id)] if id == "U1"));
        assert_eq!(gate.counts(), MemoryCounts::default());
    }

    #[test]
    fn test_restore_rebuilds_open_set() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let gate = NotNode::new("n", vec!["u".into()], ban_spec());
        let user = create_test_user(&tokens);
        gate.activate(Activation::Left(user.clone()), ctx);
        gate.activate(Activation::Right(ban("B1", "U1")), ctx);

        let snapshot = gate.snapshot();
        gate.clear();
        gate.restore(snapshot);
        assert!(!gate.is_open(&user.id));

        let out = gate.activate(Activation::RetractFact("B1".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::Token(_)]));
    }
}
