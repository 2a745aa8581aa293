//! The running network.
//!
//! [`ReteNetwork`] is a cheap-to-clone handle over the node graph, the type
//! registry and the activation sink. Facts enter at the root; every node
//! updates its own memory and hands back emissions, which are delivered
//! depth-first to its children in insertion order. Rule firings leave the
//! graph through the sink, by default the network's own [`XupleManager`].
//!
//! Propagation of one fact holds the graph read lock, so facts may be
//! asserted from many threads at once. Structural changes (new programs,
//! rule removal, reset) take the write lock and wait for in-flight
//! propagations to finish.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ast::{ActionDefinition, Program};
use crate::builder::NetworkStats;
use crate::compiler::NetworkCompiler;
use crate::config::EngineConfig;
use crate::error::{ReteError, ReteResult, XupleError};
use crate::graph::{NodeGraph, ROOT_ID};
use crate::memory::MemorySnapshot;
use crate::nodes::{
    ActionRecord, Activation, ActivationSink, Emission, NodeContext, NodeId, NodeType, Side,
};
use crate::persistence::NodeStorage;
use crate::registry::TypeRegistry;
use crate::sync::{RwLock, RwLockWriteGuard};
use crate::types::{Fact, FactId, TokenIdGenerator};
use crate::validator::Validator;
use crate::xuples::{XupleManager, XupleSpaceConfig};

/// What [`ReteNetwork::add_program`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramReport {
    /// Types declared by the program
    pub types_added: Vec<String>,
    /// Rules compiled
    pub rules_added: Vec<String>,
    /// Rules removed
    pub rules_removed: Vec<String>,
    /// Xuple-spaces created
    pub spaces_created: Vec<String>,
    /// Inline facts asserted
    pub facts_asserted: usize,
}

/// Number of lock stripes serializing operations on one fact identifier.
const FACT_LOCK_STRIPES: usize = 64;

/// Striped locks keyed by fact identifier.
///
/// The existence check and the propagation of an assert, update or retract
/// run under the stripe of that identifier, so two writers of the same fact
/// never interleave. Always taken before the graph lock.
#[derive(Debug)]
struct FactLocks {
    stripes: Vec<RwLock<()>>,
}

impl FactLocks {
    fn new() -> Self {
        Self {
            stripes: (0..FACT_LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
        }
    }

    fn lock(&self, id: &str) -> RwLockWriteGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].write()
    }
}

/// Handle to a compiled network.
///
/// Clones share the same graph, memories and sink.
#[derive(Clone)]
pub struct ReteNetwork {
    config: Arc<EngineConfig>,
    graph: Arc<RwLock<NodeGraph>>,
    registry: Arc<RwLock<TypeRegistry>>,
    actions: Arc<RwLock<BTreeMap<String, ActionDefinition>>>,
    tokens: Arc<TokenIdGenerator>,
    fact_locks: Arc<FactLocks>,
    sink: Arc<dyn ActivationSink>,
    xuples: Option<Arc<XupleManager>>,
    storage: Option<Arc<dyn NodeStorage>>,
}

impl fmt::Debug for ReteNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("ReteNetwork")
            .field("nodes", &graph.len())
            .field("rules", &graph.rule_ids())
            .field("xuples", &self.xuples.is_some())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl Default for ReteNetwork {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ReteNetwork {
    /// Empty network whose firings land in its own xuple manager.
    pub fn new(config: EngineConfig) -> Self {
        let manager = Arc::new(XupleManager::with_defaults(config.xuples.clone()));
        let sink: Arc<dyn ActivationSink> = manager.clone();
        let mut network = Self::with_sink(config, sink);
        network.xuples = Some(manager);
        network
    }

    /// Empty network handing firings to a custom sink.
    ///
    /// Xuple-space declarations in programs are ignored by such a network.
    pub fn with_sink(config: EngineConfig, sink: Arc<dyn ActivationSink>) -> Self {
        Self {
            config: Arc::new(config),
            graph: Arc::new(RwLock::new(NodeGraph::new())),
            registry: Arc::new(RwLock::new(TypeRegistry::new())),
            actions: Arc::new(RwLock::new(BTreeMap::new())),
            tokens: Arc::new(TokenIdGenerator::new()),
            fact_locks: Arc::new(FactLocks::new()),
            sink,
            xuples: None,
            storage: None,
        }
    }

    /// Attach a node storage.
    ///
    /// With `persistence.persist_memories` set, every node saves its memory
    /// after each activation.
    pub fn with_storage(mut self, storage: Arc<dyn NodeStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The xuple manager receiving firings, unless a custom sink is used.
    pub fn xuples(&self) -> Option<&Arc<XupleManager>> {
        self.xuples.as_ref()
    }

    /// Snapshot of the type registry.
    pub fn registry(&self) -> TypeRegistry {
        self.registry.read().clone()
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Validate and compile a program into the running network.
    ///
    /// Removals are applied first, then types, rules and spaces are added.
    /// New rules are primed with the facts their type nodes already hold, so
    /// they fire for existing matches. Inline facts are asserted last.
    ///
    /// Nothing changes when validation or compilation fails.
    pub fn add_program(&self, program: &Program) -> ReteResult<ProgramReport> {
        let mut guard = self.graph.write();
        let current_actions = self.actions.read().clone();
        let registry = Validator::new(self.config.validation.clone())
            .with_registry(&self.registry.read())
            .with_rules(guard.rule_ids())
            .with_actions(current_actions.values())
            .validate(program)?;

        for removal in &program.rule_removals {
            if !guard.has_rule(removal.rule_id()) {
                return Err(ReteError::RuleNotFound(removal.rule_id().to_string()));
            }
        }
        if let Some(manager) = &self.xuples {
            for declaration in &program.xuple_spaces {
                if manager.get_space(&declaration.name).is_ok() {
                    return Err(XupleError::SpaceExists(declaration.name.clone()).into());
                }
            }
        }

        let mut actions = current_actions;
        for action in &program.actions {
            actions.insert(action.name.clone(), action.clone());
        }

        let mut graph = NodeGraph::clone(&guard);
        let mut report = ProgramReport::default();
        let mut removed = Vec::new();
        for removal in &program.rule_removals {
            removed.extend(graph.remove_rule(removal.rule_id())?);
            report.rules_removed.push(removal.rule_id().to_string());
        }

        let compiler = NetworkCompiler::new((*self.config).clone());
        let before: HashSet<NodeId> = graph.node_ids().into_iter().collect();
        let new_types = compiler.add_types(&mut graph, &registry)?;
        report.rules_added = compiler.add_rules(&mut graph, program, &actions)?;
        graph.validate()?;
        report.types_added = program.types.iter().map(|t| t.name.clone()).collect();

        let mut first_err = None;
        for node in &removed {
            if let Some(terminal) = node.as_terminal() {
                self.dispatch(&graph, node.id(), terminal.drain(), &mut first_err);
            }
        }

        if let Some(manager) = &self.xuples {
            for declaration in &program.xuple_spaces {
                let config = XupleSpaceConfig::from_kinds(
                    declaration.selection,
                    declaration.consumption,
                    declaration.retention,
                    declaration.max_size,
                );
                manager.create_space(&declaration.name, config)?;
                report.spaces_created.push(declaration.name.clone());
            }
        } else if !program.xuple_spaces.is_empty() {
            warn!(
                "Ignoring {} xuple-space declaration(s): firings go to a custom sink",
                program.xuple_spaces.len()
            );
        }

        self.prime(&graph, &registry, &before, &new_types, &mut first_err);

        *guard = graph;
        *self.registry.write() = registry;
        *self.actions.write() = actions;
        drop(guard);

        info!(
            types = report.types_added.len(),
            rules = report.rules_added.len(),
            removed = report.rules_removed.len(),
            "Program compiled"
        );

        for declaration in &program.facts {
            let fact = Fact::with_fields(
                declaration.id.clone().unwrap_or_default(),
                declaration.type_name.clone(),
                declaration.fields.to_map(),
            );
            match self.assert_fact(fact) {
                Ok(_) => report.facts_asserted += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Feed the facts already in the network to freshly compiled nodes.
    ///
    /// Every existing node with a new child replays what it has emitted so
    /// far to that child only; its other children have seen it already.
    /// Right inputs are filled before left inputs so gates see their
    /// blockers before the tokens they block.
    fn prime(
        &self,
        graph: &NodeGraph,
        registry: &TypeRegistry,
        before: &HashSet<NodeId>,
        new_types: &[NodeId],
        first_err: &mut Option<ReteError>,
    ) {
        let fresh = |id: &str| !before.contains(id);
        let ctx = NodeContext { tokens: &self.tokens };
        let feeders: Vec<_> = graph
            .nodes()
            .filter(|n| n.node_type() != NodeType::Root && !fresh(n.id()))
            .filter(|n| graph.children(n.id()).iter().any(|c| fresh(&c.node_id)))
            .map(|n| (Arc::clone(n), n.replay(ctx)))
            .collect();

        for side in [Side::Right, Side::Left] {
            if side == Side::Left {
                self.prime_new_types(graph, registry, new_types, first_err);
            }
            for (node, emissions) in &feeders {
                for child in graph.children(node.id()) {
                    if child.side != side || !fresh(&child.node_id) {
                        continue;
                    }
                    for emission in emissions {
                        if let Some(activation) = emission.to_activation(side) {
                            self.deliver(graph, &child.node_id, activation, first_err);
                        }
                    }
                }
            }
        }
    }

    /// Hand the root's facts of each new type to its type node.
    fn prime_new_types(
        &self,
        graph: &NodeGraph,
        registry: &TypeRegistry,
        new_types: &[NodeId],
        first_err: &mut Option<ReteError>,
    ) {
        let Some(root) = graph.get(ROOT_ID) else { return };
        let Some(root) = root.as_root() else { return };
        let facts = root.facts();
        for type_id in new_types {
            let Some(node) = graph.get(type_id) else { continue };
            let Some(type_node) = node.as_type() else { continue };
            for fact in facts.iter().filter(|f| f.type_name == type_node.type_name()) {
                match registry.conform(fact) {
                    Ok(Some(conformed)) => {
                        let activation = Activation::Assert(Arc::new(conformed));
                        self.deliver(graph, type_id, activation, first_err);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(
                        "Fact {} does not conform to {}: {}",
                        fact.id,
                        type_node.type_name(),
                        e
                    ),
                }
            }
        }
    }

    /// Remove a rule, revoking its live activations.
    pub fn remove_rule(&self, rule_id: &str) -> ReteResult<()> {
        let mut graph = self.graph.write();
        let removed = graph.remove_rule(rule_id)?;
        let mut first_err = None;
        for node in &removed {
            if let Some(terminal) = node.as_terminal() {
                self.dispatch(&graph, node.id(), terminal.drain(), &mut first_err);
            }
        }
        info!(rule_id = %rule_id, nodes = removed.len(), "Rule removed");
        first_err.map_or(Ok(()), Err)
    }

    /// Empty every node memory, keeping the structure.
    ///
    /// Live activations are revoked.
    pub fn clear_memory(&self) -> ReteResult<()> {
        let graph = self.graph.write();
        let first_err = self.revoke_all(&graph);
        for node in graph.nodes() {
            node.clear();
        }
        debug!("Cleared {} node memories", graph.len());
        first_err.map_or(Ok(()), Err)
    }

    /// Drop every type, rule and memory.
    ///
    /// Live activations are revoked; xuple-spaces are kept.
    pub fn reset(&self) -> ReteResult<()> {
        let mut graph = self.graph.write();
        let first_err = self.revoke_all(&graph);
        *graph = NodeGraph::new();
        self.registry.write().clear();
        self.actions.write().clear();
        info!("Network reset");
        first_err.map_or(Ok(()), Err)
    }

    fn revoke_all(&self, graph: &NodeGraph) -> Option<ReteError> {
        let mut first_err = None;
        for node in graph.terminals() {
            if let Some(terminal) = node.as_terminal() {
                self.dispatch(graph, node.id(), terminal.drain(), &mut first_err);
            }
        }
        first_err
    }

    // =========================================================================
    // Facts
    // =========================================================================

    /// Derive a missing identifier and conform the fact to its type.
    fn prepare(&self, mut fact: Fact) -> ReteResult<Fact> {
        let registry = self.registry.read();
        if fact.id.is_empty() {
            registry.assign_id(&mut fact)?;
        }
        Ok(registry.conform(&fact)?.unwrap_or(fact))
    }

    fn stored(&self, graph: &NodeGraph, id: &str) -> ReteResult<Option<Arc<Fact>>> {
        let root = graph.root()?;
        Ok(root.as_root().and_then(|r| r.fact(id)))
    }

    /// Assert a fact.
    ///
    /// Re-asserting an identical fact is a no-op; asserting a changed fact
    /// under a known identifier replaces it. Returns the fact identifier,
    /// derived from the type when the fact had none.
    pub fn assert_fact(&self, fact: Fact) -> ReteResult<FactId> {
        let fact = self.prepare(fact)?;
        let _fact_guard = self.fact_locks.lock(&fact.id);
        let graph = self.graph.read();
        self.assert_locked(&graph, fact)
    }

    /// Assert under the caller's fact stripe and graph read lock.
    fn assert_locked(&self, graph: &NodeGraph, fact: Fact) -> ReteResult<FactId> {
        let mut first_err = None;
        if let Some(existing) = self.stored(graph, &fact.id)? {
            if existing.same_content(&fact) {
                return Ok(fact.id);
            }
            self.deliver(graph, ROOT_ID, Activation::RetractFact(fact.id.clone()), &mut first_err);
        }
        let id = fact.id.clone();
        debug!("Asserting fact {} ({})", id, fact.type_name);
        self.deliver(graph, ROOT_ID, Activation::Assert(Arc::new(fact)), &mut first_err);
        first_err.map_or(Ok(id), Err)
    }

    /// Assert a fact that must not exist yet.
    pub fn insert_fact(&self, fact: Fact) -> ReteResult<FactId> {
        let fact = self.prepare(fact)?;
        let _fact_guard = self.fact_locks.lock(&fact.id);
        let graph = self.graph.read();
        if self.stored(&graph, &fact.id)?.is_some() {
            return Err(ReteError::FactExists(fact.id));
        }
        self.assert_locked(&graph, fact)
    }

    /// Replace a stored fact. Returns whether anything changed.
    pub fn update_fact(&self, fact: Fact) -> ReteResult<bool> {
        let fact = self.prepare(fact)?;
        let _fact_guard = self.fact_locks.lock(&fact.id);
        let graph = self.graph.read();
        let existing = self
            .stored(&graph, &fact.id)?
            .ok_or_else(|| ReteError::FactNotFound(fact.id.clone()))?;
        if existing.same_content(&fact) {
            return Ok(false);
        }
        let mut first_err = None;
        self.deliver(&graph, ROOT_ID, Activation::RetractFact(fact.id.clone()), &mut first_err);
        self.deliver(&graph, ROOT_ID, Activation::Assert(Arc::new(fact)), &mut first_err);
        first_err.map_or(Ok(true), Err)
    }

    /// Retract a fact and everything derived from it.
    pub fn retract_fact(&self, id: &str) -> ReteResult<()> {
        let _fact_guard = self.fact_locks.lock(id);
        let graph = self.graph.read();
        if self.stored(&graph, id)?.is_none() {
            return Err(ReteError::FactNotFound(id.to_string()));
        }
        debug!("Retracting fact {}", id);
        let mut first_err = None;
        self.deliver(&graph, ROOT_ID, Activation::RetractFact(id.to_string()), &mut first_err);
        first_err.map_or(Ok(()), Err)
    }

    /// Assert a batch. Every fact is attempted; the first error is returned.
    pub fn assert_facts(&self, facts: impl IntoIterator<Item = Fact>) -> ReteResult<usize> {
        let mut asserted = 0;
        let mut first_err = None;
        for fact in facts {
            match self.assert_fact(fact) {
                Ok(_) => asserted += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(asserted), Err)
    }

    // =========================================================================
    // Propagation
    // =========================================================================

    /// Activate one node and propagate what it emits.
    fn deliver(
        &self,
        graph: &NodeGraph,
        node_id: &str,
        activation: Activation,
        first_err: &mut Option<ReteError>,
    ) {
        let Some(node) = graph.get(node_id) else {
            first_err.get_or_insert(ReteError::Invariant(format!(
                "node '{}' does not exist",
                node_id
            )));
            return;
        };
        let ctx = NodeContext { tokens: &self.tokens };
        match node.activate(activation, ctx) {
            Ok(emissions) => {
                self.persist(node_id, &node);
                self.dispatch(graph, node_id, emissions, first_err);
            }
            Err(e) => {
                first_err.get_or_insert(e.in_node(node_id, node.node_type()));
            }
        }
    }

    /// Send emissions of `from` to its children, or to the sink.
    fn dispatch(
        &self,
        graph: &NodeGraph,
        from: &str,
        emissions: Vec<Emission>,
        first_err: &mut Option<ReteError>,
    ) {
        for emission in emissions {
            match &emission {
                Emission::Fire(record) => self.fire(from, record, first_err),
                Emission::Revoke { space, activation_id } => {
                    if let Err(e) = self.sink.revoke(space, activation_id) {
                        let e = ReteError::from(e).in_node(from, NodeType::Terminal);
                        first_err.get_or_insert(e);
                    }
                }
                _ => {
                    for child in graph.children(from) {
                        if let Some(activation) = emission.to_activation(child.side) {
                            self.deliver(graph, &child.node_id, activation, first_err);
                        }
                    }
                }
            }
        }
    }

    fn fire(&self, from: &str, record: &ActionRecord, first_err: &mut Option<ReteError>) {
        tracing::trace!("Rule {} fired {}", record.rule_id, record.activation_id);
        if let Err(e) = self.sink.fire(record) {
            warn!(rule_id = %record.rule_id, error = %e, "Activation not delivered");
            first_err.get_or_insert(ReteError::from(e).in_node(from, NodeType::Terminal));
        }
    }

    fn persist(&self, node_id: &str, node: &crate::nodes::ReteNode) {
        if !self.config.persistence.persist_memories {
            return;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_memory(node_id, &node.snapshot()) {
                warn!("Failed to persist memory of {}: {}", node_id, e);
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Structural check of the graph.
    pub fn validate(&self) -> ReteResult<()> {
        self.graph.read().validate()
    }

    /// Node and memory statistics.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats::collect(&self.graph.read())
    }

    /// Every fact held by the root, in assertion order.
    pub fn facts(&self) -> Vec<Arc<Fact>> {
        let graph = self.graph.read();
        graph
            .get(ROOT_ID)
            .and_then(|n| n.as_root().map(|r| r.facts()))
            .unwrap_or_default()
    }

    /// Look up a fact by identifier.
    pub fn fact(&self, id: &str) -> Option<Arc<Fact>> {
        let graph = self.graph.read();
        self.stored(&graph, id).ok().flatten()
    }

    /// Live activations of every rule.
    pub fn activations(&self) -> Vec<ActionRecord> {
        let graph = self.graph.read();
        graph
            .terminals()
            .iter()
            .filter_map(|n| n.as_terminal().map(|t| t.activations()))
            .flatten()
            .collect()
    }

    /// Compiled rule identifiers, sorted.
    pub fn rules(&self) -> Vec<String> {
        self.graph.read().rule_ids()
    }

    /// Node identifiers in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.read().node_ids()
    }

    /// Nodes a rule uses, shared ones included.
    pub fn rule_nodes(&self, rule_id: &str) -> Vec<NodeId> {
        self.graph
            .read()
            .rule_nodes(rule_id)
            .map(<[NodeId]>::to_vec)
            .unwrap_or_default()
    }

    /// Copy of one node's memory.
    pub fn node_snapshot(&self, node_id: &str) -> Option<MemorySnapshot> {
        self.graph.read().get(node_id).map(|n| n.snapshot())
    }

    /// Variables bound by the tokens a node holds or emits.
    pub fn node_scope(&self, node_id: &str) -> Option<Vec<String>> {
        self.graph.read().get(node_id).map(|n| n.scope())
    }

    // =========================================================================
    // Memory persistence
    // =========================================================================

    /// Save every node memory. Returns the number of nodes saved.
    pub fn save_memories(&self, storage: &dyn NodeStorage) -> ReteResult<usize> {
        let graph = self.graph.read();
        let mut saved = 0;
        for node in graph.nodes() {
            storage.save_memory(node.id(), &node.snapshot())?;
            saved += 1;
        }
        debug!("Saved {} node memories", saved);
        Ok(saved)
    }

    /// Restore node memories saved for this graph shape.
    ///
    /// Nodes without a saved memory keep theirs. Terminals restore their
    /// activations without firing again. Returns the number of nodes
    /// restored.
    pub fn restore_memories(&self, storage: &dyn NodeStorage) -> ReteResult<usize> {
        let graph = self.graph.write();
        let mut restored = 0;
        for node in graph.nodes() {
            if let Some(snapshot) = storage.load_memory(node.id())? {
                for token in &snapshot.tokens {
                    self.tokens.advance_past(&token.id);
                }
                node.restore(snapshot);
                restored += 1;
            }
        }
        info!(nodes = restored, "Restored node memories");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        Action, Expr, Expression, Operator, TypeDefinition, TypedVariable, VariableSet,
    };
    use crate::nodes::NullSink;
    use crate::persistence::InMemoryStorage;
    use crate::types::Value;

    fn create_test_rule(
        rule_id: &str,
        vars: &[(&str, &str)],
        constraints: Option<Expr>,
        action: &str,
    ) -> Expression {
        Expression {
            rule_id: rule_id.into(),
            set: VariableSet {
                variables: vars.iter().map(|(n, t)| TypedVariable::new(*n, *t)).collect(),
            },
            patterns: Vec::new(),
            constraints,
            action: Some(Action::call(action, vec![Expr::field(vars[0].0, "id")])),
            xuple_space: None,
            position: None,
        }
    }

    fn create_test_program() -> Program {
        Program {
            types: vec![TypeDefinition::new("Person", &[("id", "string"), ("age", "integer")])],
            expressions: vec![create_test_rule(
                "adults",
                &[("p", "Person")],
                Some(Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(18))),
                "notify",
            )],
            ..Default::default()
        }
    }

    fn person(id: &str, age: i64) -> Fact {
        Fact::new(id, "Person").field("id", id).field("age", age)
    }

    #[test]
    fn test_alpha_filter_fires_once() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        network.assert_fact(person("U2", 12)).unwrap();

        let activations = network.activations();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].arguments, vec![Value::from("U1")]);

        let space = network.xuples().unwrap().get_space("default").unwrap();
        assert_eq!(space.count(), 1);
    }

    #[test]
    fn test_reassert_identical_is_noop() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        assert_eq!(network.activations().len(), 1);
        assert_eq!(network.xuples().unwrap().get_space("default").unwrap().count(), 1);
    }

    #[test]
    fn test_update_moves_fact_out_of_match() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        assert!(network.update_fact(person("U1", 10)).unwrap());
        assert!(!network.update_fact(person("U1", 10)).unwrap());
        assert!(network.activations().is_empty());
        assert!(matches!(
            network.update_fact(person("U9", 10)),
            Err(ReteError::FactNotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_of_one_fact() {
        use std::sync::Barrier;
        use std::thread;

        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let network = network.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    network.assert_fact(person("U1", 20 + i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(network.facts().len(), 1);
        assert_eq!(network.activations().len(), 1);
        assert_eq!(network.xuples().unwrap().get_space("default").unwrap().count(), 1);
        let stats = network.stats();
        assert!(stats.memories.iter().all(|m| m.facts <= 1 && m.tokens <= 1));

        network.retract_fact("U1").unwrap();
        assert_eq!(network.stats().total_tokens, 0);
    }

    #[test]
    fn test_insert_and_retract_errors() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.insert_fact(person("U1", 25)).unwrap();
        assert!(matches!(network.insert_fact(person("U1", 25)), Err(ReteError::FactExists(_))));
        network.retract_fact("U1").unwrap();
        assert!(matches!(network.retract_fact("U1"), Err(ReteError::FactNotFound(_))));
        assert_eq!(network.stats().total_facts, 0);
        assert_eq!(network.stats().total_tokens, 0);
    }

    #[test]
    fn test_malformed_fact_rejected() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        let bad = Fact::new("U1", "Person").field("age", "old");
        assert!(matches!(network.assert_fact(bad), Err(ReteError::Data(_))));
        assert!(network.facts().is_empty());
    }

    #[test]
    fn test_new_rule_primed_with_existing_facts() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 70)).unwrap();

        let program = Program {
            expressions: vec![create_test_rule(
                "seniors",
                &[("p", "Person")],
                Some(Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(65))),
                "pension",
            )],
            ..Default::default()
        };
        let report = network.add_program(&program).unwrap();
        assert_eq!(report.rules_added, vec!["seniors".to_string()]);
        assert_eq!(network.activations().len(), 2);
    }

    #[test]
    fn test_remove_rule_revokes() {
        let network = ReteNetwork::default();
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        network.remove_rule("adults").unwrap();
        assert!(network.rules().is_empty());
        assert!(network.activations().is_empty());
        let space = network.xuples().unwrap().get_space("default").unwrap();
        assert_eq!(space.count(), 0);
        assert!(matches!(network.remove_rule("adults"), Err(ReteError::RuleNotFound(_))));
        network.validate().unwrap();
    }

    #[test]
    fn test_clear_and_reset() {
        let network = ReteNetwork::with_sink(EngineConfig::default(), Arc::new(NullSink));
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        network.clear_memory().unwrap();
        assert!(network.facts().is_empty());
        assert_eq!(network.rules().len(), 1);

        network.reset().unwrap();
        assert!(network.rules().is_empty());
        assert_eq!(network.node_ids(), vec![ROOT_ID.to_string()]);
        assert!(network.registry().is_empty());
    }

    #[test]
    fn test_memories_round_trip() {
        let network = ReteNetwork::with_sink(EngineConfig::default(), Arc::new(NullSink));
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();

        let storage = InMemoryStorage::new();
        let saved = network.save_memories(&storage).unwrap();
        assert_eq!(saved, network.node_ids().len());

        network.clear_memory().unwrap();
        network.restore_memories(&storage).unwrap();
        assert_eq!(network.facts().len(), 1);
        assert_eq!(network.activations().len(), 1);
        assert_eq!(
            network.node_snapshot("adults_terminal").unwrap().tokens.len(),
            1
        );
    }

    #[test]
    fn test_persist_memories_on_activation() {
        let mut config = EngineConfig::default();
        config.persistence.persist_memories = true;
        let storage = Arc::new(InMemoryStorage::new());
        let network =
            ReteNetwork::with_sink(config, Arc::new(NullSink)).with_storage(storage.clone());
        network.add_program(&create_test_program()).unwrap();
        network.assert_fact(person("U1", 25)).unwrap();
        let alpha = network.rule_nodes("adults").remove(0);
        let saved = storage.load_memory(&alpha).unwrap().unwrap();
        assert_eq!(saved.fact_ids(), vec!["U1".to_string()]);
    }

    fn create_join_rule(rule_id: &str, action: &str) -> Expression {
        create_test_rule(
            rule_id,
            &[("p", "Person"), ("q", "Person")],
            Some(Expr::and(vec![
                Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(18)),
                Expr::binary(Expr::field("p", "age"), Operator::Lt, Expr::field("q", "age")),
            ])),
            action,
        )
    }

    #[test]
    fn test_shared_alpha_outlives_one_rule() {
        let network = ReteNetwork::default();
        let mut program = create_test_program();
        let mut voters = program.expressions[0].clone();
        voters.rule_id = "voters".into();
        program.expressions.push(voters);
        network.add_program(&program).unwrap();

        let alpha = network.rule_nodes("adults").remove(0);
        assert_eq!(network.rule_nodes("voters")[0], alpha);
        assert_eq!(network.stats().alpha_nodes, 1);

        network.assert_fact(person("U1", 25)).unwrap();
        assert_eq!(network.activations().len(), 2);
        assert_eq!(network.node_snapshot(&alpha).unwrap().facts.len(), 1);

        network.remove_rule("adults").unwrap();
        assert!(network.node_ids().contains(&alpha));
        assert_eq!(network.activations().len(), 1);
        network.assert_fact(person("U2", 40)).unwrap();
        assert_eq!(network.activations().len(), 2);

        network.remove_rule("voters").unwrap();
        assert!(!network.node_ids().contains(&alpha));
        assert_eq!(network.node_ids().len(), 2, "root and type node remain");
        network.validate().unwrap();
    }

    #[test]
    fn test_rule_joining_shared_prefix_primed_once() {
        let network = ReteNetwork::default();
        let mut program = create_test_program();
        program.expressions = vec![create_join_rule("older", "compare")];
        network.add_program(&program).unwrap();
        network.assert_fact(person("U1", 20)).unwrap();
        network.assert_fact(person("U2", 30)).unwrap();
        network.assert_fact(person("U3", 40)).unwrap();
        // (20,30) (20,40) (30,40)
        assert_eq!(network.activations().len(), 3);

        let later = Program {
            expressions: vec![create_join_rule("older_again", "record")],
            ..Default::default()
        };
        network.add_program(&later).unwrap();

        let joins = |rule: &str| -> Vec<NodeId> {
            network
                .rule_nodes(rule)
                .into_iter()
                .filter(|id| id.starts_with("join_"))
                .collect()
        };
        assert_eq!(joins("older"), joins("older_again"));
        assert_eq!(network.stats().join_nodes, 1);

        let activations = network.activations();
        let count = |rule: &str| activations.iter().filter(|a| a.rule_id == rule).count();
        assert_eq!(count("older"), 3, "existing rule fed twice");
        assert_eq!(count("older_again"), 3);

        network.retract_fact("U2").unwrap();
        let activations = network.activations();
        assert_eq!(activations.iter().filter(|a| a.rule_id == "older_again").count(), 1);
        assert_eq!(activations.iter().filter(|a| a.rule_id == "older").count(), 1);
    }
}
