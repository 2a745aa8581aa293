//! The xuple: a rule result with consumption metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Fact;

/// Lifecycle state. Only `Available -> Consumed` and `Available -> Expired`
/// ever happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XupleState {
    /// Can be handed to agents
    Available,
    /// Used up by its consumption policy
    Consumed,
    /// Past its expiration, or revoked
    Expired,
}

impl fmt::Display for XupleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XupleState::Available => f.write_str("available"),
            XupleState::Consumed => f.write_str("consumed"),
            XupleState::Expired => f.write_str("expired"),
        }
    }
}

/// Consumption bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XupleMetadata {
    /// Current state
    pub state: XupleState,
    /// Number of consumptions; always the size of `consumers`
    pub consumption_count: usize,
    /// Agent to consumption time
    pub consumers: BTreeMap<String, DateTime<Utc>>,
    /// When the xuple expires, `None` for never
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for XupleMetadata {
    fn default() -> Self {
        Self {
            state: XupleState::Available,
            consumption_count: 0,
            consumers: BTreeMap::new(),
            expires_at: None,
        }
    }
}

/// Result tuple placed in a xuple-space.
///
/// Callers get clones; the metadata only changes through the space API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Xuple {
    /// Globally unique identifier
    pub id: String,
    /// Space holding the xuple
    pub space: String,
    /// Primary fact
    pub fact: Arc<Fact>,
    /// Facts that triggered the activation, in match order
    pub triggering_facts: Vec<Arc<Fact>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Consumption bookkeeping
    pub metadata: XupleMetadata,
}

impl Xuple {
    /// Fresh, available xuple.
    pub fn new(
        id: impl Into<String>,
        space: impl Into<String>,
        fact: Arc<Fact>,
        triggering_facts: Vec<Arc<Fact>>,
    ) -> Self {
        Self {
            id: id.into(),
            space: space.into(),
            fact,
            triggering_facts,
            created_at: Utc::now(),
            metadata: XupleMetadata::default(),
        }
    }

    /// State is available.
    pub fn is_available(&self) -> bool {
        self.metadata.state == XupleState::Available
    }

    /// Marked expired, or past its expiration at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.state == XupleState::Expired
            || self.metadata.expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the agent already consumed this xuple.
    pub fn consumed_by(&self, agent_id: &str) -> bool {
        self.metadata.consumers.contains_key(agent_id)
    }

    /// Number of consumptions so far.
    pub fn consumption_count(&self) -> usize {
        self.metadata.consumption_count
    }

    /// Action name, i.e. the primary fact's type.
    pub fn action(&self) -> &str {
        &self.fact.type_name
    }

    pub(crate) fn record_consumption(&mut self, agent_id: &str, at: DateTime<Utc>) {
        if self.metadata.consumers.insert(agent_id.to_string(), at).is_none() {
            self.metadata.consumption_count += 1;
        }
    }

    /// Available to consumed. Returns whether the state changed.
    pub(crate) fn mark_consumed(&mut self) -> bool {
        self.transition(XupleState::Consumed)
    }

    /// Available to expired. Returns whether the state changed.
    pub(crate) fn mark_expired(&mut self) -> bool {
        self.transition(XupleState::Expired)
    }

    fn transition(&mut self, to: XupleState) -> bool {
        if self.metadata.state != XupleState::Available {
            return false;
        }
        self.metadata.state = to;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_xuple() -> Xuple {
        Xuple::new("x1", "jobs", Arc::new(Fact::new("a1", "notify")), Vec::new())
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut xuple = create_test_xuple();
        assert!(xuple.is_available());
        assert!(xuple.mark_consumed());
        assert!(!xuple.mark_expired());
        assert_eq!(xuple.metadata.state, XupleState::Consumed);

        let mut other = create_test_xuple();
        assert!(other.mark_expired());
        assert!(!other.mark_consumed());
        assert!(other.is_expired(Utc::now()));
    }

    #[test]
    fn test_consumption_count_tracks_consumers() {
        let mut xuple = create_test_xuple();
        let now = Utc::now();
        xuple.record_consumption("a", now);
        xuple.record_consumption("a", now);
        xuple.record_consumption("b", now);
        assert_eq!(xuple.consumption_count(), 2);
        assert_eq!(xuple.metadata.consumers.len(), 2);
        assert!(xuple.consumed_by("b"));
    }

    #[test]
    fn test_expiration_by_time() {
        let mut xuple = create_test_xuple();
        let now = Utc::now();
        assert!(!xuple.is_expired(now));
        xuple.metadata.expires_at = Some(now + Duration::seconds(5));
        assert!(!xuple.is_expired(now));
        assert!(xuple.is_expired(now + Duration::seconds(5)));
        // Time expiry does not change the stored state by itself.
        assert!(xuple.is_available());
    }
}
