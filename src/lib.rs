//! # rete-xuples: incremental rules into shared work buffers
//!
//! A forward-chaining rules engine built on the RETE algorithm. Facts are
//! asserted and retracted one at a time; the network keeps every partial
//! match in node memories, so each change only costs the work it actually
//! touches. Complete matches are not executed here. They are wrapped into
//! *xuples* and placed into named *xuple-spaces*, where agents retrieve and
//! consume them under selection, consumption and retention policies.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rete_xuples::prelude::*;
//!
//! let program = Program::from_json_str(r#"{
//!     "types": [{ "name": "Person", "fields": [
//!         { "name": "id", "type": "string" },
//!         { "name": "age", "type": "integer" }
//!     ]}],
//!     "expressions": [{
//!         "ruleId": "adults",
//!         "set": { "variables": [{ "name": "p", "dataType": "Person" }] },
//!         "constraints": { "type": "binaryOperation", "operator": ">=",
//!             "left": { "type": "fieldAccess", "object": "p", "field": "age" },
//!             "right": { "type": "literal", "value": 18 } },
//!         "action": { "job": { "name": "notify", "args": [
//!             { "type": "fieldAccess", "object": "p", "field": "id" }
//!         ]}}
//!     }]
//! }"#)?;
//!
//! let network = NetworkCompiler::new(EngineConfig::default()).compile(&program)?;
//! network.assert_fact(Fact::new("U1", "Person").field("id", "U1").field("age", 25))?;
//!
//! let space = network.xuples().unwrap().get_space("default")?;
//! let xuple = space.retrieve("agent-1")?;
//! assert_eq!(xuple.fact.type_name, "notify");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Program ─► Validator ─► NetworkCompiler ─► ReteNetwork
//!                                               │
//!   assert/retract ─► Root ─► Type ─► Alpha ─► Join ─► Not/Exists/Accumulate ─► Terminal
//!                                                                                  │
//!                                          XupleManager ◄──── fire / revoke ───────┘
//!                                               │
//!                                          XupleSpace ─► retrieve / mark_consumed (agents)
//! ```
//!
//! - [`ast`], [`validator`], [`checker`]: the program document and its checks
//! - [`compiler`], [`builder`], [`graph`]: turning rules into nodes
//! - [`nodes`], [`memory`], [`condition`], [`aggregate`]: incremental matching
//! - [`network`]: the runtime handle
//! - [`xuples`]: spaces, policies and events
//! - [`persistence`], [`coordination`]: storage and the external tuple store
//!
//! ## Thread Safety
//!
//! [`ReteNetwork`] is a cheap clone over shared state. Facts may be asserted
//! from several threads; each node updates its memory atomically. Within a
//! space, retrieve-and-consume is a single critical section, so two agents
//! never receive the same `once` xuple.

pub mod aggregate;
pub mod ast;
pub mod builder;
pub mod checker;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod coordination;
pub mod error;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod network;
pub mod nodes;
pub mod persistence;
pub mod registry;
pub mod types;
pub mod validator;
pub mod xuples;

mod sync;

// Public API exports
pub use ast::{ActionDefinition, Expr, Expression, Operator, Program, TypeDefinition};
pub use builder::{NetworkStats, NodeMemoryStats};
pub use compiler::NetworkCompiler;
pub use config::{
    EngineConfig, LogFormat, LoggingConfig, PersistenceConfig, ValidationConfig, XupleDefaults,
};
pub use error::{
    CoordinationError, DataError, ReteError, ReteResult, ValidationError, ValidationErrorKind,
    ValidationReport, XupleError, XupleResult,
};
pub use graph::NodeGraph;
pub use logging::init_tracing;
pub use memory::{MemorySnapshot, WorkingMemory};
pub use network::{ProgramReport, ReteNetwork};
pub use nodes::{ActionRecord, ActivationSink, NodeType, NullSink};
pub use persistence::{FileStorage, InMemoryStorage, NetworkSnapshot, NodeStorage};
pub use registry::TypeRegistry;
pub use types::{BaseType, Fact, FactId, Token, TokenId, Value};
pub use xuples::{
    ConsumptionKind, RetentionKind, SelectionKind, Xuple, XupleEvent, XupleEventKind, XupleManager,
    XupleSpace, XupleSpaceConfig, XupleState, XupleSubscription,
};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use rete_xuples::prelude::*;
/// ```
pub mod prelude {
    pub use crate::ast::{Expr, Operator, Program, TypeDefinition, TypedVariable};
    pub use crate::compiler::NetworkCompiler;
    pub use crate::config::EngineConfig;
    pub use crate::error::{ReteError, ReteResult, XupleError, XupleResult};
    pub use crate::network::ReteNetwork;
    pub use crate::types::{Fact, Value};
    pub use crate::xuples::{
        ConsumptionKind, RetentionKind, SelectionKind, Xuple, XupleManager, XupleSpace,
        XupleSpaceConfig, XupleState,
    };
}
