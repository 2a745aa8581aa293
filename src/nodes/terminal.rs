//! Terminal node: turns complete matches into action records.
//!
//! The node never executes an action. It resolves the arguments of every job
//! against the token bindings and hands the resulting [`ActionRecord`] to an
//! [`ActivationSink`], normally the xuple manager.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Activation, Emission, MemoryCounts};
use crate::ast::{ActionDefinition, Expr};
use crate::condition::{EvalContext, evaluate};
use crate::error::{DataError, ReteError, ReteResult, XupleResult};
use crate::memory::{MemorySnapshot, WorkingMemory};
use crate::sync::RwLock;
use crate::types::{Fact, Token, TokenId, Value};
use crate::validator::parameter_default;

/// One job of a rule action: name, argument expressions and, when declared,
/// the action signature used for parameter names and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    /// Action name
    pub name: String,
    /// Argument expressions over the rule variables
    pub args: Vec<Expr>,
    /// Declared signature, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<ActionDefinition>,
}

impl ActionTemplate {
    /// Template without a declared signature.
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
            definition: None,
        }
    }

    /// Attach a declared signature.
    pub fn with_definition(mut self, definition: Option<ActionDefinition>) -> Self {
        self.definition = definition;
        self
    }

    /// Resolve the arguments against bindings.
    ///
    /// Trailing arguments the call omits are taken from parameter defaults.
    pub fn resolve(&self, token: &Token) -> Result<(Vec<String>, Vec<Value>), DataError> {
        let ctx = EvalContext::bindings(&token.bindings);
        let mut values = self
            .args
            .iter()
            .map(|arg| evaluate(arg, &ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let declared = self.definition.as_ref().map_or(0, |d| d.parameters.len());
        for index in values.len()..declared {
            match parameter_default(self.definition.as_ref(), index) {
                Some(default) => values.push(default),
                None => break,
            }
        }

        let names = (0..values.len())
            .map(|i| {
                self.definition
                    .as_ref()
                    .and_then(|d| d.parameters.get(i))
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| format!("arg{}", i))
            })
            .collect();
        Ok((names, values))
    }
}

/// A rule firing, as handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// `{terminal}/{token}/{job}`; stable for a given token
    pub activation_id: String,
    /// Rule that fired
    pub rule_id: String,
    /// Action name
    pub action: String,
    /// Resolved arguments, one per argument
    pub arguments: Vec<Value>,
    /// Parameter names, or `arg0`, `arg1`... when undeclared
    pub argument_names: Vec<String>,
    /// Triggering facts in match order
    pub facts: Vec<Arc<Fact>>,
    /// Target xuple-space
    pub xuple_space: String,
    /// Token that fired
    pub token_id: TokenId,
}

/// Receives activations from terminal nodes.
pub trait ActivationSink: Send + Sync {
    /// A rule instance became satisfied.
    fn fire(&self, record: &ActionRecord) -> XupleResult<()>;

    /// A previously fired instance is no longer satisfied.
    fn revoke(&self, space: &str, activation_id: &str) -> XupleResult<()>;
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ActivationSink for NullSink {
    fn fire(&self, _record: &ActionRecord) -> XupleResult<()> {
        Ok(())
    }

    fn revoke(&self, _space: &str, _activation_id: &str) -> XupleResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TerminalState {
    memory: WorkingMemory,
    fired: Vec<ActionRecord>,
}

/// End of a rule.
#[derive(Debug)]
pub struct TerminalNode {
    id: String,
    rule_id: String,
    scope: Vec<String>,
    templates: Vec<ActionTemplate>,
    xuple_space: String,
    state: RwLock<TerminalState>,
}

impl TerminalNode {
    /// Create a terminal.
    ///
    /// `scope` lists every variable a complete match binds.
    pub fn new(
        id: impl Into<String>,
        rule_id: impl Into<String>,
        scope: Vec<String>,
        templates: Vec<ActionTemplate>,
        xuple_space: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rule_id: rule_id.into(),
            scope,
            templates,
            xuple_space: xuple_space.into(),
            state: RwLock::new(TerminalState::default()),
        }
    }

    /// Node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rule this terminal ends.
    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    /// Variables a complete match binds.
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Jobs fired per match.
    pub fn templates(&self) -> &[ActionTemplate] {
        &self.templates
    }

    /// Target xuple-space.
    pub fn xuple_space(&self) -> &str {
        &self.xuple_space
    }

    /// Live activations, in firing order.
    pub fn activations(&self) -> Vec<ActionRecord> {
        self.state.read().fired.clone()
    }

    /// Matches currently held.
    pub fn tokens(&self) -> Vec<Token> {
        self.state.read().memory.list_tokens()
    }

    fn records(&self, token: &Token) -> Vec<ActionRecord> {
        self.templates
            .iter()
            .enumerate()
            .filter_map(|(index, template)| match template.resolve(token) {
                Ok((argument_names, arguments)) => Some(ActionRecord {
                    activation_id: format!("{}/{}/{}", self.id, token.id, index),
                    rule_id: self.rule_id.clone(),
                    action: template.name.clone(),
                    arguments,
                    argument_names,
                    facts: token.facts.clone(),
                    xuple_space: self.xuple_space.clone(),
                    token_id: token.id.clone(),
                }),
                Err(e) => {
                    tracing::warn!(
                        "Rule {} skipped job {} for token {}: {}",
                        self.rule_id,
                        template.name,
                        token.id,
                        e
                    );
                    None
                }
            })
            .collect()
    }

    fn revoke_tokens(&self, state: &mut TerminalState, removed: Vec<Token>) -> Vec<Emission> {
        let mut out = Vec::new();
        for token in removed {
            state.fired.retain(|record| {
                if record.token_id == token.id {
                    out.push(Emission::Revoke {
                        space: record.xuple_space.clone(),
                        activation_id: record.activation_id.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        out
    }

    pub(crate) fn activate(&self, activation: Activation) -> ReteResult<Vec<Emission>> {
        match activation {
            Activation::Left(token) => {
                let unbound = self.scope.iter().find(|v| !token.bindings.contains_key(*v));
                if let Some(missing) = unbound {
                    return Err(ReteError::Invariant(format!(
                        "token {} reached terminal {} without binding '{}'",
                        token.id, self.id, missing
                    )));
                }
                let mut state = self.state.write();
                if state.memory.contains_token(&token.id) {
                    return Ok(Vec::new());
                }
                let records = self.records(&token);
                tracing::trace!("Rule {} matched token {}", self.rule_id, token.id);
                state.memory.add_token(token);
                state.fired.extend(records.iter().cloned());
                Ok(records.into_iter().map(Emission::Fire).collect())
            }
            Activation::RetractFact(id) => {
                let mut state = self.state.write();
                let removed = state.memory.remove_tokens_with_fact(&id);
                Ok(self.revoke_tokens(&mut state, removed))
            }
            Activation::RetractDerived(parent) => {
                let mut state = self.state.write();
                let removed = state.memory.remove_tokens_with_parent(&parent);
                Ok(self.revoke_tokens(&mut state, removed))
            }
            Activation::Assert(_) | Activation::Right(_) => Ok(Vec::new()),
        }
    }

    /// Revoke every live activation and forget the matches.
    pub(crate) fn drain(&self) -> Vec<Emission> {
        let mut state = self.state.write();
        let removed = state.memory.list_tokens();
        state.memory.clear();
        self.revoke_tokens(&mut state, removed)
    }

    pub(crate) fn counts(&self) -> MemoryCounts {
        MemoryCounts {
            facts: 0,
            tokens: self.state.read().memory.token_count(),
        }
    }

    pub(crate) fn snapshot(&self) -> MemorySnapshot {
        self.state.read().memory.snapshot()
    }

    /// Restore matches and rebuild their records without firing again.
    pub(crate) fn restore(&self, snapshot: MemorySnapshot) {
        let memory = WorkingMemory::from_snapshot(snapshot);
        let fired = memory.tokens().flat_map(|t| self.records(t)).collect();
        *self.state.write() = TerminalState { memory, fired };
    }

    pub(crate) fn clear(&self) {
        *self.state.write() = TerminalState::default();
    }
}
