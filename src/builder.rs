//! Beta network construction and network statistics.
//!
//! The builder turns a [`MultiJoinPattern`] into a chain of join nodes: the
//! first join's output feeds the left input of the second, and so on. Gates
//! and accumulators are appended to the chain the same way.
//!
//! A shared pattern names its joins by content, so a rule whose leading joins
//! match another rule's reuses them instead of building its own.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::Expr;
use crate::condition::JoinCondition;
use crate::error::ReteResult;
use crate::graph::{NodeGraph, shared_node_id};
use crate::nodes::{
    AccumulateNode, AccumulateSpec, Child, ExistsNode, GateSpec, JoinNode, NodeId, NodeType,
    NotNode, ReteNode,
};

/// One join of a multi-join pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Type of the facts already in the chain (the last one joined)
    pub left_type: String,
    /// Type of the facts joined in
    pub right_type: String,
    /// Variable the right facts fill
    pub right_var: String,
    /// Field comparisons between the sides
    pub conditions: Vec<JoinCondition>,
    /// Other conditions over both sides
    #[serde(default)]
    pub filters: Vec<Expr>,
    /// Explicit node identifier; generated when absent
    #[serde(default)]
    pub node_id: Option<String>,
    /// Node feeding the right input
    pub right_input: NodeId,
}

/// Chain of joins ending in an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiJoinPattern {
    /// Pattern identifier, used for generated node identifiers and ownership
    pub pattern_id: String,
    /// Node whose tokens enter the chain
    pub left_input: NodeId,
    /// Variables bound by those tokens
    pub left_scope: Vec<String>,
    /// Joins, in chain order
    pub joins: Vec<JoinSpec>,
    /// Action the chain ends in
    pub action: String,
    /// Reuse identical joins already in the graph. Unnamed joins get
    /// content-derived identifiers instead of `<pattern>_join_<index>`.
    #[serde(default)]
    pub shared: bool,
}

/// What makes two joins interchangeable.
#[derive(Serialize)]
struct JoinKey<'a> {
    left_input: &'a str,
    right_input: &'a str,
    left_scope: &'a [String],
    right_var: &'a str,
    conditions: &'a [JoinCondition],
    filters: &'a [Expr],
}

/// End of a chain under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEnd {
    /// Node whose tokens leave the chain
    pub node_id: NodeId,
    /// Variables those tokens bind
    pub scope: Vec<String>,
}

/// Builds beta chains into a graph.
#[derive(Debug)]
pub struct BetaNetworkBuilder<'g> {
    graph: &'g mut NodeGraph,
    created: Vec<NodeId>,
}

impl<'g> BetaNetworkBuilder<'g> {
    /// Builder writing into `graph`.
    pub fn new(graph: &'g mut NodeGraph) -> Self {
        Self {
            graph,
            created: Vec::new(),
        }
    }

    /// The graph being built.
    pub fn graph(&self) -> &NodeGraph {
        self.graph
    }

    /// Nodes created so far, in creation order. Reused nodes are not listed.
    pub fn created(&self) -> &[NodeId] {
        &self.created
    }

    /// Build the join chain of a pattern. Returns the end of the chain.
    pub fn build_multi_join(&mut self, pattern: &MultiJoinPattern) -> ReteResult<ChainEnd> {
        let mut end = ChainEnd {
            node_id: pattern.left_input.clone(),
            scope: pattern.left_scope.clone(),
        };
        for (index, spec) in pattern.joins.iter().enumerate() {
            let shared = pattern.shared && spec.node_id.is_none();
            let id = match &spec.node_id {
                Some(id) => id.clone(),
                None if shared => shared_node_id(
                    "join",
                    &JoinKey {
                        left_input: &end.node_id,
                        right_input: &spec.right_input,
                        left_scope: &end.scope,
                        right_var: &spec.right_var,
                        conditions: &spec.conditions,
                        filters: &spec.filters,
                    },
                )?,
                None => format!("{}_join_{}", pattern.pattern_id, index),
            };
            let node = JoinNode::new(
                id.clone(),
                end.scope.clone(),
                spec.right_var.clone(),
                spec.conditions.clone(),
                spec.filters.clone(),
            );
            let scope = node.output_scope();
            let join = ReteNode::Join(node);
            if shared {
                self.add_shared(&pattern.pattern_id, join, &end.node_id, &spec.right_input)?;
            } else {
                self.add(&pattern.pattern_id, join, &end.node_id, &spec.right_input)?;
            }
            tracing::trace!(
                "Join {}: {} x {} on {} condition(s)",
                id,
                spec.left_type,
                spec.right_type,
                spec.conditions.len()
            );
            end = ChainEnd { node_id: id, scope };
        }
        tracing::debug!(
            "Built pattern {} with {} join(s) for action {}",
            pattern.pattern_id,
            pattern.joins.len(),
            pattern.action
        );
        Ok(end)
    }

    /// Append a negation gate.
    pub fn add_not(
        &mut self,
        owner: &str,
        id: String,
        end: &ChainEnd,
        spec: GateSpec,
        right_input: &str,
    ) -> ReteResult<ChainEnd> {
        let node = NotNode::new(id.clone(), end.scope.clone(), spec);
        self.add(owner, ReteNode::Not(node), &end.node_id, right_input)?;
        Ok(ChainEnd {
            node_id: id,
            scope: end.scope.clone(),
        })
    }

    /// Append an existence gate.
    pub fn add_exists(
        &mut self,
        owner: &str,
        id: String,
        end: &ChainEnd,
        spec: GateSpec,
        right_input: &str,
    ) -> ReteResult<ChainEnd> {
        let node = ExistsNode::new(id.clone(), end.scope.clone(), spec);
        self.add(owner, ReteNode::Exists(node), &end.node_id, right_input)?;
        Ok(ChainEnd {
            node_id: id,
            scope: end.scope.clone(),
        })
    }

    /// Append an accumulator.
    pub fn add_accumulate(
        &mut self,
        owner: &str,
        id: String,
        end: &ChainEnd,
        spec: AccumulateSpec,
        right_input: &str,
    ) -> ReteResult<ChainEnd> {
        let node = AccumulateNode::new(id.clone(), end.scope.clone(), spec);
        let scope = node.output_scope();
        self.add(owner, ReteNode::Accumulate(node), &end.node_id, right_input)?;
        Ok(ChainEnd { node_id: id, scope })
    }

    /// Register a node owned by `owner` and wire both inputs.
    fn add(&mut self, owner: &str, node: ReteNode, left: &str, right: &str) -> ReteResult<()> {
        let id = node.id().to_string();
        self.graph.add_node(node, Some(owner))?;
        self.graph.connect(left, Child::left(&id))?;
        self.graph.connect(right, Child::right(&id))?;
        self.created.push(id);
        Ok(())
    }

    /// Like [`Self::add`], reusing an identical node already in the graph.
    fn add_shared(
        &mut self,
        owner: &str,
        node: ReteNode,
        left: &str,
        right: &str,
    ) -> ReteResult<()> {
        let id = node.id().to_string();
        let (_, created) = self.graph.add_shared(node, owner)?;
        self.graph.connect(left, Child::left(&id))?;
        self.graph.connect(right, Child::right(&id))?;
        if created {
            self.created.push(id);
        }
        Ok(())
    }
}

/// Counters of one node memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMemoryStats {
    /// Node identifier
    pub node_id: NodeId,
    /// Node kind
    pub node_type: NodeType,
    /// Facts held
    pub facts: usize,
    /// Tokens held
    pub tokens: usize,
}

/// Size of the network and of its memories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Every node, root included
    pub node_count: usize,
    /// Type nodes
    pub type_nodes: usize,
    /// Alpha nodes
    pub alpha_nodes: usize,
    /// Join nodes
    pub join_nodes: usize,
    /// Not, exists and accumulate nodes
    pub simple_beta_nodes: usize,
    /// Terminal nodes
    pub terminal_nodes: usize,
    /// Compiled rules
    pub rules: usize,
    /// Facts across every memory
    pub total_facts: usize,
    /// Tokens across every memory
    pub total_tokens: usize,
    /// Per-node counters, in creation order
    pub memories: Vec<NodeMemoryStats>,
}

impl NetworkStats {
    /// Collect statistics from a graph.
    pub fn collect(graph: &NodeGraph) -> Self {
        let mut stats = NetworkStats {
            rules: graph.rule_ids().len(),
            ..Default::default()
        };
        for (node_id, node_type, counts) in graph.memory_counts() {
            stats.node_count += 1;
            match node_type {
                NodeType::Root => {}
                NodeType::Type => stats.type_nodes += 1,
                NodeType::Alpha => stats.alpha_nodes += 1,
                NodeType::Join => stats.join_nodes += 1,
                NodeType::Not | NodeType::Exists | NodeType::Accumulate => {
                    stats.simple_beta_nodes += 1
                }
                NodeType::Terminal => stats.terminal_nodes += 1,
            }
            stats.total_facts += counts.facts;
            stats.total_tokens += counts.tokens;
            stats.memories.push(NodeMemoryStats {
                node_id,
                node_type,
                facts: counts.facts,
                tokens: counts.tokens,
            });
        }
        stats
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network: {} nodes, {} rules", self.node_count, self.rules)?;
        writeln!(
            f,
            "  type: {}  alpha: {}  join: {}  not/exists/accumulate: {}  terminal: {}",
            self.type_nodes,
            self.alpha_nodes,
            self.join_nodes,
            self.simple_beta_nodes,
            self.terminal_nodes
        )?;
        write!(f, "  memories: {} facts, {} tokens", self.total_facts, self.total_tokens)
    }
}
