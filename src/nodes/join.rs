//! Join node: two-input relational join.
//!
//! Left memory holds tokens, right memory holds facts. Every arrival on one
//! side is tested against the whole opposite memory, in insertion order, and
//! each pair passing all join conditions and residual filters yields one
//! joined token whose parent is the left token.

use std::sync::Arc;

use super::{Activation, Emission, MemoryCounts, NodeContext};
use crate::ast::Expr;
use crate::condition::{EvalContext, JoinCondition, evaluate_bool};
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;
use crate::types::{Fact, Token};

/// Two-input join over variable bindings.
#[derive(Debug)]
pub struct JoinNode {
    id: String,
    left_scope: Vec<String>,
    right_var: String,
    conditions: Vec<JoinCondition>,
    filters: Vec<Expr>,
    memory: RwLock<WorkingMemory>,
}

impl JoinNode {
    /// Create a join node.
    ///
    /// `left_scope` lists the variables bound by incoming tokens; `right_var`
    /// is filled by right facts. `filters` are conditions over both sides that
    /// are not simple field comparisons.
    pub fn new(
        id: impl Into<String>,
        left_scope: Vec<String>,
        right_var: impl Into<String>,
        conditions: Vec<JoinCondition>,
        filters: Vec<Expr>,
    ) -> Self {
        Self {
            id: id.into(),
            left_scope,
            right_var: right_var.into(),
            conditions,
            filters,
            memory: RwLock::new(WorkingMemory::new()),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Variables bound by left tokens.
    pub fn left_scope(&self) -> &[String] {
        &self.left_scope
    }

    /// Variable bound by right facts.
    pub fn right_var(&self) -> &str {
        &self.right_var
    }

    /// Field comparisons between the two sides.
    pub fn conditions(&self) -> &[JoinCondition] {
        &self.conditions
    }

    /// Residual conditions.
    pub fn filters(&self) -> &[Expr] {
        &self.filters
    }

    /// Variables bound by output tokens.
    pub fn output_scope(&self) -> Vec<String> {
        let mut scope = self.left_scope.clone();
        scope.push(self.right_var.clone());
        scope
    }

    /// Whether a left token and a right fact join.
    ///
    /// Every condition is evaluated; a missing field or an unbound variable
    /// fails the pair.
    pub fn joins(&self, left: &Token, right: &Fact) -> bool {
        if !self.conditions.iter().all(|c| c.test(&left.bindings, right)) {
            return false;
        }
        let ctx = EvalContext::with_candidate(&left.bindings, &self.right_var, right);
        self.filters.iter().all(|filter| match evaluate_bool(filter, &ctx) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::trace!(
                    "Join {} filter failed for {} / {}: {}",
                    self.id,
                    left.id,
                    right.id,
                    e
                );
                false
            }
        })
    }

    pub(crate) fn activate(&self, activation: Activation, ctx: NodeContext<'_>) -> Vec<Emission> {
        match activation {
            Activation::Left(token) => {
                let mut memory = self.memory.write();
                let out: Vec<Emission> = memory
                    .facts()
                    .filter(|fact| self.joins(&token, fact))
                    .map(|fact| {
                        Emission::Token(Token::joined(
                            ctx.tokens.next_id(),
                            &token,
                            &self.right_var,
                            Arc::clone(fact),
                            &self.id,
                        ))
                    })
                    .collect();
                memory.add_token(token);
                out
            }
            Activation::Right(fact) | Activation::Assert(fact) => {
                let mut memory = self.memory.write();
                memory.add_fact(Arc::clone(&fact));
                memory
                    .tokens()
                    .filter(|token| self.joins(token, &fact))
                    .map(|token| {
                        Emission::Token(Token::joined(
                            ctx.tokens.next_id(),
                            token,
                            &self.right_var,
                            Arc::clone(&fact),
                            &self.id,
                        ))
                    })
                    .collect()
            }
            Activation::RetractFact(id) => {
                let mut memory = self.memory.write();
                let right = memory.remove_fact(&id).is_some();
                let left = !memory.remove_tokens_with_fact(&id).is_empty();
                if right || left {
                    vec![Emission::RetractFact(id)]
                } else {
                    Vec::new()
                }
            }
            Activation::RetractDerived(parent) => self
                .memory
                .write()
                .remove_tokens_with_parent(&parent)
                .into_iter()
                .map(|token| Emission::RetractDerived(token.id))
                .collect(),
        }
    }

    /// Every joined token the current memories produce, left tokens first.
    ///
    /// Tokens get fresh identifiers but keep their left parents, so upstream
    /// retractions still reach them.
    pub(crate) fn replay(&self, ctx: NodeContext<'_>) -> Vec<Emission> {
        let memory = self.memory.read();
        let mut out = Vec::new();
        for token in memory.tokens() {
            for fact in memory.facts().filter(|fact| self.joins(token, fact)) {
                out.push(Emission::Token(Token::joined(
                    ctx.tokens.next_id(),
                    token,
                    &self.right_var,
                    Arc::clone(fact),
                    &self.id,
                )));
            }
        }
        out
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

    fn create_test_join() -> JoinNode {
        JoinNode::new(
            "orders_join_0",
            vec!["u".into()],
            "o",
            vec![JoinCondition::new("u", "id", Operator::Eq, "o", "user_id")],
            Vec::new(),
        )
    }

    fn user_token(tokens: &TokenIdGenerator, id: &str) -> Token {
        let user = Arc::new(Fact::new(id, "User").field("age", 30));
        Token::alpha(tokens.next_id(), "u", user, "orders_alpha_u")
    }

    fn order(id: &str, user: &str) -> Arc<Fact> {
        Arc::new(Fact::new(id, "Order").field("user_id", user))
    }

    fn emitted_tokens(out: &[Emission]) -> Vec<&Token> {
        out.iter()
            .filter_map(|e| match e {
                Emission::Token(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_left_then_right() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let join = create_test_join();

        let left = user_token(&tokens, "U1");
        assert!(join.activate(Activation::Left(left.clone()), ctx).is_empty());

        let out = join.activate(Activation::Right(order("O1", "U1")), ctx);
        let joined = emitted_tokens(&out);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].fact_ids(), vec!["U1", "O1"]);
        assert_eq!(joined[0].parent.as_deref(), Some(left.id.as_str()));
        assert!(joined[0].is_join_result);

        assert!(join.activate(Activation::Right(order("O2", "U999")), ctx).is_empty());
    }

    #[test]
    fn test_output_follows_memory_order() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let join = create_test_join();

        join.activate(Activation::Right(order("O1", "U1")), ctx);
        join.activate(Activation::Right(order("O2", "U1")), ctx);
        join.activate(Activation::Right(order("O3", "U1")), ctx);

        let out = join.activate(Activation::Left(user_token(&tokens, "U1")), ctx);
        let order_ids: Vec<&str> = emitted_tokens(&out)
            .iter()
            .map(|t| t.facts[1].id.as_str())
            .collect();
        assert_eq!(order_ids, vec!["O1", "O2", "O3"]);
    }

    #[test]
    fn test_missing_field_never_joins() {
        let tokens = TokenIdGenerator::new();
        let join = create_test_join();
        let left = user_token(&tokens, "U1");
        let bare = Fact::new("O9", "Order");
        assert!(!join.joins(&left, &bare));
    }

    #[test]
    fn test_residual_filter() {
        let tokens = TokenIdGenerator::new();
        let join = JoinNode::new(
            "j",
            vec!["u".into()],
            "o",
            Vec::new(),
            vec![Expr::binary(
                Expr::binary(Expr::field("o", "qty"), Operator::Mul, Expr::literal(2)),
                Operator::Gt,
                Expr::field("u", "age"),
            )],
        );
        let left = user_token(&tokens, "U1");
        assert!(join.joins(&left, &Fact::new("O1", "Order").field("qty", 20)));
        assert!(!join.joins(&left, &Fact::new("O2", "Order").field("qty", 10)));
    }

    #[test]
    fn test_retractions() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let join = create_test_join();
        let left = user_token(&tokens, "U1");
        join.activate(Activation::Left(left.clone()), ctx);
        join.activate(Activation::Right(order("O1", "U1")), ctx);

        let out = join.activate(Activation::RetractFact("O1".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractFact(id)] if id == "O1"));
        assert_eq!(join.counts(), MemoryCounts { facts: 0, tokens: 1 });

        assert!(join.activate(Activation::RetractFact("nope".into()), ctx).is_empty());

        let derived = Token::passed_through(tokens.next_id(), &left, "gate");
        join.activate(Activation::Left(derived.clone()), ctx);
        let out = join.activate(Activation::RetractDerived(left.id.clone()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractDerived(id)] if *id == derived.id));
    }
}
