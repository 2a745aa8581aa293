//! Xuple-spaces: named, policy-governed buffers of rule results.
//!
//! ```text
//! TerminalNode ─fire─► XupleManager ─create_xuple─► XupleSpace ─retrieve─► agent
//!                           │                           │
//!                           └────── XupleEventBus ◄─────┘ (inserted, consumed...)
//! ```
//!
//! A space owns its xuples. Agents receive clones and change a xuple's
//! state only through [`XupleSpace::retrieve`], [`XupleSpace::retrieve_multiple`]
//! and [`XupleSpace::mark_consumed`].

mod events;
mod manager;
mod policy;
mod space;
mod xuple;

pub use events::{
    SubscriptionId, SubscriptionInfo, XupleEvent, XupleEventBus, XupleEventKind, XupleSubscription,
};
pub use manager::{XupleManager, activation_fact};
pub use policy::{
    ConsumptionKind, ConsumptionPolicy, DurationRetention, FifoSelection, LifoSelection,
    LimitedConsumption, OnceConsumption, PerAgentConsumption, RandomSelection, RetentionKind,
    RetentionPolicy, SelectionKind, SelectionPolicy, UnlimitedRetention,
};
pub use space::{SpaceInfo, XupleSpace, XupleSpaceConfig};
pub use xuple::{Xuple, XupleMetadata, XupleState};
