//! The node arena and its edges.
//!
//! Nodes live in a map keyed by identifier and refer to each other only by
//! identifier, so the graph holds no reference cycles. Cloning a graph is
//! cheap: nodes are shared, only the maps are copied. The network compiles
//! into a clone and swaps it in once it validates.
//!
//! Alpha nodes and join prefixes are shared between rules. Their
//! identifiers are digests of what they compute (see [`shared_node_id`]), so
//! two rules asking for the same node get the same identifier. Each rule
//! holds one reference on every node it uses; a node is dropped when the
//! last rule referencing it is removed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ReteError, ReteResult};
use crate::nodes::{Child, MemoryCounts, NodeId, NodeType, ReteNode, RootNode, Side, TypeNode};

/// Identifier of the root node.
pub const ROOT_ID: &str = "root";

/// Bytes of the digest kept in shared node identifiers.
const SHARED_ID_BYTES: usize = 8;

/// Identifier of a shareable node: `<prefix>_<digest of key>`.
///
/// Source positions are dropped from the key, so the same condition written
/// at two places in a program yields the same identifier.
pub fn shared_node_id(prefix: &str, key: &impl Serialize) -> ReteResult<NodeId> {
    let mut value = serde_json::to_value(key)?;
    strip_positions(&mut value);
    let bytes = serde_json::to_vec(&value)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{}_{}", prefix, hex::encode(&digest[..SHARED_ID_BYTES])))
}

fn strip_positions(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.remove("position");
            map.values_mut().for_each(strip_positions);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(strip_positions),
        _ => {}
    }
}

/// Nodes, edges and rule ownership.
#[derive(Debug, Clone)]
pub struct NodeGraph {
    nodes: HashMap<NodeId, Arc<ReteNode>>,
    order: Vec<NodeId>,
    children: HashMap<NodeId, Vec<Child>>,
    rules: BTreeMap<String, Vec<NodeId>>,
    refs: HashMap<NodeId, usize>,
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraph {
    /// A graph holding only the root.
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            children: HashMap::new(),
            rules: BTreeMap::new(),
            refs: HashMap::new(),
        };
        graph.insert(ReteNode::Root(RootNode::new(ROOT_ID)));
        graph
    }

    fn insert(&mut self, node: ReteNode) -> Arc<ReteNode> {
        let id = node.id().to_string();
        let node = Arc::new(node);
        self.nodes.insert(id.clone(), Arc::clone(&node));
        self.children.entry(id.clone()).or_default();
        self.order.push(id);
        node
    }

    /// The root node.
    pub fn root(&self) -> ReteResult<Arc<ReteNode>> {
        self.get(ROOT_ID)
            .ok_or_else(|| ReteError::Invariant("network has no root".into()))
    }

    /// Add a node; `owner` is the rule it belongs to, `None` for nodes that
    /// outlive every rule (root and type nodes).
    pub fn add_node(&mut self, node: ReteNode, owner: Option<&str>) -> ReteResult<Arc<ReteNode>> {
        if self.nodes.contains_key(node.id()) {
            return Err(ReteError::Invariant(format!("node '{}' already exists", node.id())));
        }
        let id = node.id().to_string();
        let node = self.insert(node);
        if let Some(rule) = owner {
            self.claim(rule, &id);
        }
        Ok(node)
    }

    /// Reuse the node with the same identifier, or add `node`.
    ///
    /// Either way `owner` holds a reference on it afterwards. Returns the
    /// node in the graph and whether it was created.
    pub fn add_shared(&mut self, node: ReteNode, owner: &str) -> ReteResult<(Arc<ReteNode>, bool)> {
        let Some(existing) = self.get(node.id()) else {
            return self.add_node(node, Some(owner)).map(|n| (n, true));
        };
        if existing.node_type() != node.node_type() {
            return Err(ReteError::Invariant(format!(
                "shared node '{}' is a {}, not a {}",
                node.id(),
                existing.node_type(),
                node.node_type()
            )));
        }
        self.claim(owner, node.id());
        Ok((existing, false))
    }

    fn claim(&mut self, rule: &str, id: &str) {
        let owned = self.rules.entry(rule.to_string()).or_default();
        if !owned.iter().any(|n| n == id) {
            owned.push(id.to_string());
            *self.refs.entry(id.to_string()).or_default() += 1;
        }
    }

    /// Number of rules using a node.
    pub fn ref_count(&self, id: &str) -> usize {
        self.refs.get(id).copied().unwrap_or(0)
    }

    /// Add an edge. Adding an existing edge again is a no-op.
    pub fn connect(&mut self, parent: &str, child: Child) -> ReteResult<()> {
        if !self.nodes.contains_key(&child.node_id) {
            return Err(ReteError::Invariant(format!("child '{}' does not exist", child.node_id)));
        }
        let edges = self
            .children
            .get_mut(parent)
            .ok_or_else(|| ReteError::Invariant(format!("parent '{}' does not exist", parent)))?;
        if !edges.contains(&child) {
            edges.push(child);
        }
        Ok(())
    }

    /// Look up a node.
    pub fn get(&self, id: &str) -> Option<Arc<ReteNode>> {
        self.nodes.get(id).cloned()
    }

    /// Whether the node exists.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Outgoing edges of a node, in insertion order.
    pub fn children(&self, id: &str) -> &[Child] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with an edge to `id`.
    pub fn parents(&self, id: &str) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|p| self.children(p).iter().any(|c| c.node_id == id))
            .cloned()
            .collect()
    }

    /// Node identifiers in creation order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ReteNode>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Only the root is left.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// The type node for a type, if declared.
    pub fn type_node(&self, type_name: &str) -> Option<Arc<ReteNode>> {
        self.get(&TypeNode::id_for(type_name))
            .filter(|n| n.node_type() == NodeType::Type)
    }

    /// Rule identifiers, sorted.
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    /// Whether a rule is compiled.
    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.rules.contains_key(rule_id)
    }

    /// Nodes a rule uses, shared ones included, in the order it claimed them.
    pub fn rule_nodes(&self, rule_id: &str) -> Option<&[NodeId]> {
        self.rules.get(rule_id).map(Vec::as_slice)
    }

    /// Every terminal node.
    pub fn terminals(&self) -> Vec<Arc<ReteNode>> {
        self.nodes()
            .filter(|n| n.node_type() == NodeType::Terminal)
            .cloned()
            .collect()
    }

    /// Release every node a rule uses and drop those no other rule uses.
    /// Returns the dropped nodes.
    pub fn remove_rule(&mut self, rule_id: &str) -> ReteResult<Vec<Arc<ReteNode>>> {
        let owned = self
            .rules
            .remove(rule_id)
            .ok_or_else(|| ReteError::RuleNotFound(rule_id.to_string()))?;
        let mut doomed = HashSet::new();
        for id in &owned {
            let Some(count) = self.refs.get_mut(id) else { continue };
            *count -= 1;
            if *count == 0 {
                self.refs.remove(id);
                doomed.insert(id.as_str());
            }
        }
        for edges in self.children.values_mut() {
            edges.retain(|c| !doomed.contains(c.node_id.as_str()));
        }
        self.order.retain(|id| !doomed.contains(id.as_str()));
        let mut removed = Vec::with_capacity(doomed.len());
        for id in owned.iter().filter(|id| doomed.contains(id.as_str())) {
            self.children.remove(id);
            if let Some(node) = self.nodes.remove(id) {
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Memory counters of every node, in creation order.
    pub fn memory_counts(&self) -> Vec<(NodeId, NodeType, MemoryCounts)> {
        self.nodes()
            .map(|n| (n.id().to_string(), n.node_type(), n.counts()))
            .collect()
    }

    /// Nodes reachable from the root.
    pub fn reachable(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([ROOT_ID.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for child in self.children(&id) {
                queue.push_back(child.node_id.clone());
            }
        }
        seen
    }

    /// Structural check.
    ///
    /// Exactly one root, every edge points at an existing node, root children
    /// are type nodes, the graph is acyclic and every terminal is reachable
    /// from the root.
    pub fn validate(&self) -> ReteResult<()> {
        let roots = self.nodes().filter(|n| n.node_type() == NodeType::Root).count();
        if roots != 1 || !self.contains(ROOT_ID) {
            return Err(ReteError::Invariant(format!("expected exactly one root, found {}", roots)));
        }

        for (parent, edges) in &self.children {
            for child in edges {
                if !self.contains(&child.node_id) {
                    return Err(ReteError::Invariant(format!(
                        "edge {} -> {} points at a missing node",
                        parent, child.node_id
                    )));
                }
            }
        }

        for child in self.children(ROOT_ID) {
            let is_type = self
                .get(&child.node_id)
                .is_some_and(|n| n.node_type() == NodeType::Type);
            if !is_type || child.side != Side::Left {
                return Err(ReteError::Invariant(format!(
                    "root child {} is not a type node",
                    child.node_id
                )));
            }
        }

        self.check_acyclic()?;

        let reachable = self.reachable();
        for terminal in self.terminals() {
            if !reachable.contains(terminal.id()) {
                return Err(ReteError::Invariant(format!(
                    "terminal {} is not reachable from the root",
                    terminal.id()
                )));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over every node.
    fn check_acyclic(&self) -> ReteResult<()> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        for edges in self.children.values() {
            for child in edges {
                if let Some(d) = indegree.get_mut(child.node_id.as_str()) {
                    *d += 1;
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for child in self.children(id) {
                if let Some(d) = indegree.get_mut(child.node_id.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(child.node_id.as_str());
                    }
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(ReteError::Invariant("network contains a cycle".into()));
        }
        Ok(())
    }
}
