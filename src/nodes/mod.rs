//! RETE node kinds.
//!
//! Every node is one variant of [`ReteNode`]. A node receives an
//! [`Activation`], updates its own memory under its own lock, and returns the
//! [`Emission`]s its children must see. The network forwards emissions after
//! the lock is released, so no node lock is held across propagation.
//!
//! ```text
//! Root ─► Type ─► Alpha ─┬─► Join ─► Not/Exists/Accumulate ─► Terminal
//!                        └─────────────────────(right input)──┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ReteResult;
use crate::memory::MemorySnapshot;
use crate::types::{Fact, FactId, Token, TokenId, TokenIdGenerator};

mod accumulate;
mod alpha;
mod gate;
mod join;
mod root;
mod terminal;
mod type_node;

pub use accumulate::{AccumulateNode, AccumulateSpec};
pub use alpha::AlphaNode;
pub use gate::{ExistsNode, GateSpec, NotNode};
pub use join::JoinNode;
pub use root::RootNode;
pub use terminal::{ActionRecord, ActionTemplate, ActivationSink, NullSink, TerminalNode};
pub use type_node::TypeNode;

/// Node identifier.
pub type NodeId = String;

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Single entry point
    Root,
    /// Filters by fact type
    Type,
    /// Single-fact predicate
    Alpha,
    /// Two-input join
    Join,
    /// Negation gate
    Not,
    /// Existence gate
    Exists,
    /// Aggregation gate
    Accumulate,
    /// Rule activation
    Terminal,
}

impl NodeType {
    /// Two-input node.
    pub fn is_beta(&self) -> bool {
        matches!(
            self,
            NodeType::Join | NodeType::Not | NodeType::Exists | NodeType::Accumulate
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Root => "root",
            NodeType::Type => "type",
            NodeType::Alpha => "alpha",
            NodeType::Join => "join",
            NodeType::Not => "not",
            NodeType::Exists => "exists",
            NodeType::Accumulate => "accumulate",
            NodeType::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Input side of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Tokens
    Left,
    /// Facts
    Right,
}

/// Edge to a child node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Child {
    /// Target node
    pub node_id: NodeId,
    /// Which input of the target the edge feeds
    pub side: Side,
}

impl Child {
    /// Left-input edge.
    pub fn left(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            side: Side::Left,
        }
    }

    /// Right-input edge.
    pub fn right(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            side: Side::Right,
        }
    }
}

/// What a node is asked to process.
#[derive(Debug, Clone)]
pub enum Activation {
    /// Fact arriving at a root, type or alpha node
    Assert(Arc<Fact>),
    /// Token arriving on the left input
    Left(Token),
    /// Fact arriving on the right input
    Right(Arc<Fact>),
    /// Fact retracted: drop it and every token containing it
    RetractFact(FactId),
    /// Tokens derived from this parent are gone upstream
    RetractDerived(TokenId),
}

/// What a node hands to its children or to the activation sink.
#[derive(Debug, Clone)]
pub enum Emission {
    /// Fact for root, type and alpha children
    Fact(Arc<Fact>),
    /// Alpha match: left children get the token, right children the fact
    Match {
        /// Accepted fact
        fact: Arc<Fact>,
        /// One-fact token binding it
        token: Token,
    },
    /// Token for left children
    Token(Token),
    /// Forwarded fact retraction
    RetractFact(FactId),
    /// Tokens whose parent is this identifier are gone
    RetractDerived(TokenId),
    /// Rule activation for the sink
    Fire(ActionRecord),
    /// Activation withdrawn
    Revoke {
        /// Target xuple-space
        space: String,
        /// Activation identifier
        activation_id: String,
    },
}

impl Emission {
    /// Translate into the activation a child on `side` receives.
    ///
    /// `None` for sink-bound emissions.
    pub fn to_activation(&self, side: Side) -> Option<Activation> {
        match (self, side) {
            (Emission::Fact(fact), Side::Left) => Some(Activation::Assert(Arc::clone(fact))),
            (Emission::Fact(fact), Side::Right) => Some(Activation::Right(Arc::clone(fact))),
            (Emission::Match { token, .. }, Side::Left) => Some(Activation::Left(token.clone())),
            (Emission::Match { fact, .. }, Side::Right) => {
                Some(Activation::Right(Arc::clone(fact)))
            }
            (Emission::Token(token), _) => Some(Activation::Left(token.clone())),
            (Emission::RetractFact(id), _) => Some(Activation::RetractFact(id.clone())),
            (Emission::RetractDerived(id), _) => Some(Activation::RetractDerived(id.clone())),
            (Emission::Fire(_), _) | (Emission::Revoke { .. }, _) => None,
        }
    }
}

/// Shared services available to nodes during activation.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    /// Token identifier source
    pub tokens: &'a TokenIdGenerator,
}

/// Memory counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCounts {
    /// Facts held
    pub facts: usize,
    /// Tokens held
    pub tokens: usize,
}

/// A node of the network.
#[derive(Debug)]
pub enum ReteNode {
    /// Root
    Root(RootNode),
    /// Type filter
    Type(TypeNode),
    /// Alpha predicate
    Alpha(AlphaNode),
    /// Join
    Join(JoinNode),
    /// Negation
    Not(NotNode),
    /// Existence
    Exists(ExistsNode),
    /// Aggregation
    Accumulate(AccumulateNode),
    /// Terminal
    Terminal(TerminalNode),
}

impl ReteNode {
    /// Node identifier.
    pub fn id(&self) -> &str {
        match self {
            ReteNode::Root(n) => n.id(),
            ReteNode::Type(n) => n.id(),
            ReteNode::Alpha(n) => n.id(),
            ReteNode::Join(n) => n.id(),
            ReteNode::Not(n) => n.id(),
            ReteNode::Exists(n) => n.id(),
            ReteNode::Accumulate(n) => n.id(),
            ReteNode::Terminal(n) => n.id(),
        }
    }

    /// Node kind.
    pub fn node_type(&self) -> NodeType {
        match self {
            ReteNode::Root(_) => NodeType::Root,
            ReteNode::Type(_) => NodeType::Type,
            ReteNode::Alpha(_) => NodeType::Alpha,
            ReteNode::Join(_) => NodeType::Join,
            ReteNode::Not(_) => NodeType::Not,
            ReteNode::Exists(_) => NodeType::Exists,
            ReteNode::Accumulate(_) => NodeType::Accumulate,
            ReteNode::Terminal(_) => NodeType::Terminal,
        }
    }

    /// Process one activation and return what the children must see.
    pub fn activate(
        &self,
        activation: Activation,
        ctx: NodeContext<'_>,
    ) -> ReteResult<Vec<Emission>> {
        match self {
            ReteNode::Root(n) => Ok(n.activate(activation)),
            ReteNode::Type(n) => Ok(n.activate(activation)),
            ReteNode::Alpha(n) => Ok(n.activate(activation, ctx)),
            ReteNode::Join(n) => Ok(n.activate(activation, ctx)),
            ReteNode::Not(n) => Ok(n.activate(activation, ctx)),
            ReteNode::Exists(n) => Ok(n.activate(activation, ctx)),
            ReteNode::Accumulate(n) => Ok(n.activate(activation, ctx)),
            ReteNode::Terminal(n) => n.activate(activation),
        }
    }

    /// What this node has emitted so far, rebuilt from its memory, for
    /// children added after the facts arrived. Only nodes that can be
    /// shared produce anything.
    pub(crate) fn replay(&self, ctx: NodeContext<'_>) -> Vec<Emission> {
        match self {
            ReteNode::Type(n) => n.facts().into_iter().map(Emission::Fact).collect(),
            ReteNode::Alpha(n) => n.replay(),
            ReteNode::Join(n) => n.replay(ctx),
            _ => Vec::new(),
        }
    }

    /// Variables bound by the tokens this node stores.
    pub fn scope(&self) -> Vec<String> {
        match self {
            ReteNode::Root(_) | ReteNode::Type(_) => Vec::new(),
            ReteNode::Alpha(n) => vec![n.variable().to_string()],
            ReteNode::Join(n) => n.left_scope().to_vec(),
            ReteNode::Not(n) => n.left_scope().to_vec(),
            ReteNode::Exists(n) => n.left_scope().to_vec(),
            ReteNode::Accumulate(n) => n.left_scope().to_vec(),
            ReteNode::Terminal(n) => n.scope().to_vec(),
        }
    }

    /// Copy of the node memory.
    pub fn snapshot(&self) -> MemorySnapshot {
        match self {
            ReteNode::Root(n) => n.snapshot(),
            ReteNode::Type(n) => n.snapshot(),
            ReteNode::Alpha(n) => n.snapshot(),
            ReteNode::Join(n) => n.snapshot(),
            ReteNode::Not(n) => n.snapshot(),
            ReteNode::Exists(n) => n.snapshot(),
            ReteNode::Accumulate(n) => n.snapshot(),
            ReteNode::Terminal(n) => n.snapshot(),
        }
    }

    /// Replace the node memory, rebuilding derived state.
    pub fn restore(&self, snapshot: MemorySnapshot) {
        match self {
            ReteNode::Root(n) => n.restore(snapshot),
            ReteNode::Type(n) => n.restore(snapshot),
            ReteNode::Alpha(n) => n.restore(snapshot),
            ReteNode::Join(n) => n.restore(snapshot),
            ReteNode::Not(n) => n.restore(snapshot),
            ReteNode::Exists(n) => n.restore(snapshot),
            ReteNode::Accumulate(n) => n.restore(snapshot),
            ReteNode::Terminal(n) => n.restore(snapshot),
        }
    }

    /// Empty the node memory.
    pub fn clear(&self) {
        match self {
            ReteNode::Root(n) => n.clear(),
            ReteNode::Type(n) => n.clear(),
            ReteNode::Alpha(n) => n.clear(),
            ReteNode::Join(n) => n.clear(),
            ReteNode::Not(n) => n.clear(),
            ReteNode::Exists(n) => n.clear(),
            ReteNode::Accumulate(n) => n.clear(),
            ReteNode::Terminal(n) => n.clear(),
        }
    }

    /// Fact and token counters.
    pub fn counts(&self) -> MemoryCounts {
        match self {
            ReteNode::Root(n) => n.counts(),
            ReteNode::Type(n) => n.counts(),
            ReteNode::Alpha(n) => n.counts(),
            ReteNode::Join(n) => n.counts(),
            ReteNode::Not(n) => n.counts(),
            ReteNode::Exists(n) => n.counts(),
            ReteNode::Accumulate(n) => n.counts(),
            ReteNode::Terminal(n) => n.counts(),
        }
    }

    /// The terminal, if this is one.
    pub fn as_terminal(&self) -> Option<&TerminalNode> {
        match self {
            ReteNode::Terminal(n) => Some(n),
            _ => None,
        }
    }

    /// The type node, if this is one.
    pub fn as_type(&self) -> Option<&TypeNode> {
        match self {
            ReteNode::Type(n) => Some(n),
            _ => None,
        }
    }

    /// The root, if this is one.
    pub fn as_root(&self) -> Option<&RootNode> {
        match self {
            ReteNode::Root(n) => Some(n),
            _ => None,
        }
    }
}
