//! Accumulate node: per-token aggregation over right facts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Activation, Emission, MemoryCounts, NodeContext};
use crate::aggregate::{aggregate_fact, compute_aggregate};
use crate::ast::{AggregateFunction, Expr, Operator};
use crate::condition::{EvalContext, apply_operator, evaluate, evaluate_bool};
use crate::error::DataError;
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;
use crate::types::{Fact, Token, TokenId, Value};

/// What an accumulate node computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulateSpec {
    /// Aggregate function
    pub function: AggregateFunction,
    /// Variable right facts are bound to while filtering
    pub variable: String,
    /// Aggregated field; ignored by `count`
    pub field: Option<String>,
    /// Which right facts belong to a left token
    pub condition: Option<Expr>,
    /// Comparison against the threshold
    pub operator: Option<Operator>,
    /// Threshold, evaluated over the left bindings
    pub threshold: Option<Expr>,
    /// Variable the result is bound to in emitted tokens
    pub alias: String,
}

#[derive(Debug, Clone, Default)]
struct Aggregation {
    value: Option<Value>,
    emitted: bool,
}

#[derive(Debug, Default)]
struct AccumulateState {
    memory: WorkingMemory,
    results: HashMap<TokenId, Aggregation>,
}

/// Aggregates the right facts related to each left token.
///
/// With a threshold the node emits when the comparison becomes true and
/// retracts when it becomes false; a change that keeps it true is absorbed.
/// Without a threshold every change of the value retracts the previous token
/// and emits a new one.
#[derive(Debug)]
pub struct AccumulateNode {
    id: String,
    left_scope: Vec<String>,
    spec: AccumulateSpec,
    state: RwLock<AccumulateState>,
}

impl AccumulateNode {
    /// Create an accumulate node.
    pub fn new(id: impl Into<String>, left_scope: Vec<String>, spec: AccumulateSpec) -> Self {
        Self {
            id: id.into(),
            left_scope,
            spec,
            state: RwLock::new(AccumulateState::default()),
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

    /// Variables bound by emitted tokens.
    pub fn output_scope(&self) -> Vec<String> {
        let mut scope = self.left_scope.clone();
        scope.push(self.spec.alias.clone());
        scope
    }

    /// The aggregation computed.
    pub fn spec(&self) -> &AccumulateSpec {
        &self.spec
    }

    /// Current aggregate for a left token.
    pub fn value(&self, token_id: &str) -> Option<Value> {
        self.state.read().results.get(token_id).and_then(|a| a.value.clone())
    }

    fn related(&self, token: &Token, fact: &Fact) -> bool {
        let Some(condition) = &self.spec.condition else {
            return true;
        };
        let ctx = EvalContext::with_candidate(&token.bindings, &self.spec.variable, fact);
        evaluate_bool(condition, &ctx).unwrap_or(false)
    }

    fn compute(&self, token: &Token, memory: &WorkingMemory) -> Result<Value, DataError> {
        let facts: Vec<&Fact> = memory
            .facts()
            .filter(|f| self.related(token, f))
            .map(|f| f.as_ref())
            .collect();
        compute_aggregate(&self.spec.function, self.spec.field.as_deref(), &facts)
    }

    fn satisfied(&self, token: &Token, value: &Value) -> Result<bool, DataError> {
        let (Some(operator), Some(threshold)) = (&self.spec.operator, &self.spec.threshold) else {
            return Ok(true);
        };
        let threshold = evaluate(threshold, &EvalContext::bindings(&token.bindings))?;
        match apply_operator(operator, value, &threshold)? {
            Value::Boolean(b) => Ok(b),
            other => Err(DataError::TypeMismatch(format!(
                "aggregate comparison produced {}",
                other
            ))),
        }
    }

    fn has_threshold(&self) -> bool {
        self.spec.operator.is_some() && self.spec.threshold.is_some()
    }

    fn emit(&self, token: &Token, value: Value, ctx: NodeContext<'_>) -> Emission {
        let mut out = Token::passed_through(ctx.tokens.next_id(), token, &self.id);
        let result = aggregate_fact(&self.id, &token.id, &self.spec.function, value);
        out.bindings.insert(self.spec.alias.clone(), Arc::new(result));
        Emission::Token(out)
    }

    /// Recompute one token and return the transitions to emit.
    fn refresh(
        &self,
        token: &Token,
        memory: &WorkingMemory,
        results: &mut HashMap<TokenId, Aggregation>,
        ctx: NodeContext<'_>,
    ) -> Vec<Emission> {
        let previous = results.get(&token.id).cloned().unwrap_or_default();
        let computed = self.compute(token, memory).and_then(|value| {
            let ok = self.satisfied(token, &value)?;
            Ok((value, ok))
        });
        let (value, satisfied) = match computed {
            Ok((value, ok)) => (Some(value), ok),
            Err(DataError::AggregateEmpty) => (None, false),
            Err(e) => {
                tracing::warn!("Accumulate {} failed for token {}: {}", self.id, token.id, e);
                (None, false)
            }
        };

        let mut out = Vec::new();
        let mut emitted = previous.emitted;
        if emitted && !satisfied {
            out.push(Emission::RetractDerived(token.id.clone()));
            emitted = false;
        } else if emitted && !self.has_threshold() && value != previous.value {
            out.push(Emission::RetractDerived(token.id.clone()));
            emitted = false;
        }
        if !emitted && satisfied {
            if let Some(v) = &value {
                out.push(self.emit(token, v.clone(), ctx));
                emitted = true;
            }
        }
        results.insert(token.id.clone(), Aggregation { value, emitted });
        out
    }

    pub(crate) fn activate(&self, activation: Activation, ctx: NodeContext<'_>) -> Vec<Emission> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        match activation {
            Activation::Left(token) => {
                state.memory.add_token(token.clone());
                self.refresh(&token, &state.memory, &mut state.results, ctx)
            }
            Activation::Right(fact) | Activation::Assert(fact) => {
                let replaced = state.memory.add_fact(Arc::clone(&fact));
                let affected: Vec<Token> = state
                    .memory
                    .tokens()
                    .filter(|t| {
                        self.related(t, &fact)
                            || replaced.as_ref().is_some_and(|old| self.related(t, old))
                    })
                    .cloned()
                    .collect();
                affected
                    .iter()
                    .flat_map(|t| self.refresh(t, &state.memory, &mut state.results, ctx))
                    .collect()
            }
            Activation::RetractFact(id) => {
                let mut out = Vec::new();
                let mut forward = false;
                for token in state.memory.remove_tokens_with_fact(&id) {
                    if let Some(result) = state.results.remove(&token.id) {
                        forward |= result.emitted;
                    }
                }
                if forward {
                    out.push(Emission::RetractFact(id.clone()));
                }

                // Decide which tokens the fact fed before it disappears.
                let affected: Vec<Token> = match state.memory.get_fact(&id) {
                    Some(fact) => state
                        .memory
                        .tokens()
                        .filter(|t| self.related(t, fact))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                if state.memory.remove_fact(&id).is_some() {
                    for token in &affected {
                        out.extend(self.refresh(token, &state.memory, &mut state.results, ctx));
                    }
                }
                out
            }
            Activation::RetractDerived(parent) => {
                let mut out = Vec::new();
                for token in state.memory.remove_tokens_with_parent(&parent) {
                    if state.results.remove(&token.id).is_some_and(|r| r.emitted) {
                        out.push(Emission::RetractDerived(token.id));
                    }
                }
                out
            }
        }
    }

    pub(crate) fn counts(&self) -> MemoryCounts {
        let state = self.state.read();
        MemoryCounts {
            facts: state.memory.fact_count(),
            tokens: state.memory.token_count(),
        }
    }

    pub(crate) fn snapshot(&self) -> MemorySnapshot {
        self.state.read().memory.snapshot()
    }

    /// Recompute every aggregate from restored memory, without emitting.
    pub(crate) fn restore(&self, snapshot: MemorySnapshot) {
        let memory = WorkingMemory::from_snapshot(snapshot);
        let mut results = HashMap::new();
        for token in memory.tokens() {
            let value = self.compute(token, &memory).ok();
            let emitted = value
                .as_ref()
                .is_some_and(|v| self.satisfied(token, v).unwrap_or(false));
            results.insert(token.id.clone(), Aggregation { value, emitted });
        }
        *self.state.write() = AccumulateState { memory, results };
    }

    pub(crate) fn clear(&self) {
        *self.state.write() = AccumulateState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenIdGenerator;

    fn create_test_spec(threshold: Option<i64>) -> AccumulateSpec {
        AccumulateSpec {
            function: AggregateFunction::Sum,
            variable: "o".into(),
            field: Some("amount".into()),
            condition: Some(Expr::binary(
                Expr::field("o", "customer_id"),
                Operator::Eq,
                Expr::field("c", "id"),
            )),
            operator: threshold.map(|_| Operator::Gt),
            threshold: threshold.map(Expr::literal),
            alias: "total".into(),
        }
    }

    fn customer(tokens: &TokenIdGenerator) -> Token {
        Token::alpha(tokens.next_id(), "c", Arc::new(Fact::new("C1", "Customer")), "alpha_c")
    }

    fn order(id: &str, amount: i64) -> Arc<Fact> {
        Arc::new(Fact::new(id, "Order").field("customer_id", "C1").field("amount", amount))
    }

    fn emitted(out: &[Emission]) -> Vec<&Token> {
        out.iter()
            .filter_map(|e| match e {
                Emission::Token(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_threshold_crossing_fires_once() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let spec = create_test_spec(Some(250));
        let node = AccumulateNode::new("flag_accumulate_0", vec!["c".into()], spec);
        let c = customer(&tokens);

        assert!(node.activate(Activation::Left(c.clone()), ctx).is_empty());
        assert!(node.activate(Activation::Right(order("O1", 100)), ctx).is_empty());

        let out = node.activate(Activation::Right(order("O2", 200)), ctx);
        let tokens_out = emitted(&out);
        assert_eq!(tokens_out.len(), 1);
        let total = &tokens_out[0].bindings["total"];
        assert_eq!(total.get("value"), Some(Value::Integer(300)));

        // Still above the threshold: absorbed.
        assert!(node.activate(Activation::Right(order("O3", 50)), ctx).is_empty());
        assert_eq!(node.value(&c.id), Some(Value::Integer(350)));

        // Dropping below retracts.
        node.activate(Activation::RetractFact("O2".into()), ctx);
        assert_eq!(node.value(&c.id), Some(Value::Integer(150)));
        let out = node.activate(Activation::RetractFact("O3".into()), ctx);
        assert!(out.is_empty());
    }

    #[test]
    fn test_retract_below_threshold() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let node = AccumulateNode::new("a", vec!["c".into()], create_test_spec(Some(250)));
        let c = customer(&tokens);
        node.activate(Activation::Left(c.clone()), ctx);
        node.activate(Activation::Right(order("O1", 300)), ctx);

        let out = node.activate(Activation::RetractFact("O1".into()), ctx);
        assert!(matches!(out.as_slice(), [Emission::RetractDerived(id)] if *id == c.id));
    }

    #[test]
    fn test_without_threshold_every_change_reemits() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let node = AccumulateNode::new("a", vec!["c".into()], create_test_spec(None));
        let c = customer(&tokens);

        let out = node.activate(Activation::Left(c.clone()), ctx);
        assert_eq!(emitted(&out)[0].bindings["total"].get("value"), Some(Value::Integer(0)));

        let out = node.activate(Activation::Right(order("O1", 10)), ctx);
        assert!(matches!(&out[0], Emission::RetractDerived(id) if *id == c.id));
        assert_eq!(emitted(&out)[0].bindings["total"].get("value"), Some(Value::Integer(10)));

        // Unrelated order: no change.
        let other = Fact::new("O9", "Order").field("customer_id", "C9").field("amount", 1);
        let other = Arc::new(other);
        assert!(node.activate(Activation::Right(other), ctx).is_empty());
    }

    #[test]
    fn test_empty_min_does_not_propagate() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let mut spec = create_test_spec(None);
        spec.function = AggregateFunction::Min;
        let node = AccumulateNode::new("a", vec!["c".into()], spec);

        assert!(node.activate(Activation::Left(customer(&tokens)), ctx).is_empty());
        let out = node.activate(Activation::Right(order("O1", 5)), ctx);
        assert_eq!(emitted(&out).len(), 1);
    }

    #[test]
    fn test_restore_recomputes() {
        let tokens = TokenIdGenerator::new();
        let ctx = NodeContext { tokens: &tokens };
        let node = AccumulateNode::new("a", vec!["c".into()], create_test_spec(Some(250)));
        let c = customer(&tokens);
        node.activate(Activation::Left(c.clone()), ctx);
        node.activate(Activation::Right(order("O1", 300)), ctx);

        let snapshot = node.snapshot();
        node.clear();
        assert_eq!(node.value(&c.id), None);
        node.restore(snapshot);
        assert_eq!(node.value(&c.id), Some(Value::Integer(300)));
        // Already emitted before the restore: a further rise is absorbed.
        assert!(node.activate(Activation::Right(order("O2", 1)), ctx).is_empty());
    }
}
