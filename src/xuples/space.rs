//! Xuple-space: a bounded, policy-governed buffer.
//!
//! Every mutating call takes the space's exclusive lock for its whole
//! duration; `count`, `list_all` and `info` take the shared lock. Selection
//! and the consumption mark happen inside one critical section, so a `once`
//! xuple can never be handed to two agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::events::{XupleEvent, XupleEventBus, XupleEventKind};
use super::policy::{
    ConsumptionKind, ConsumptionPolicy, RetentionKind, RetentionPolicy, SelectionKind,
    SelectionPolicy,
};
use super::xuple::Xuple;
use crate::error::{XupleError, XupleResult};
use crate::sync::RwLock;

/// Policies and capacity of a space.
///
/// A missing policy is reported as `invalid-policy` when the space is
/// created.
#[derive(Clone, Default)]
pub struct XupleSpaceConfig {
    /// Selection strategy
    pub selection: Option<Arc<dyn SelectionPolicy>>,
    /// Consumption strategy
    pub consumption: Option<Arc<dyn ConsumptionPolicy>>,
    /// Retention strategy
    pub retention: Option<Arc<dyn RetentionPolicy>>,
    /// Capacity, 0 for unbounded
    pub max_size: usize,
}

impl fmt::Debug for XupleSpaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XupleSpaceConfig")
            .field("selection", &self.selection.as_ref().map(|p| p.name()))
            .field("consumption", &self.consumption.as_ref().map(|p| p.name()))
            .field("retention", &self.retention.as_ref().map(|p| p.name()))
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl XupleSpaceConfig {
    /// Configuration without policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from built-in policy kinds.
    pub fn from_kinds(
        selection: SelectionKind,
        consumption: ConsumptionKind,
        retention: RetentionKind,
        max_size: usize,
    ) -> Self {
        Self {
            selection: Some(selection.build()),
            consumption: Some(consumption.build()),
            retention: Some(retention.build()),
            max_size,
        }
    }

    /// Set the selection strategy.
    pub fn with_selection(mut self, policy: impl SelectionPolicy + 'static) -> Self {
        self.selection = Some(Arc::new(policy));
        self
    }

    /// Set the consumption strategy.
    pub fn with_consumption(mut self, policy: impl ConsumptionPolicy + 'static) -> Self {
        self.consumption = Some(Arc::new(policy));
        self
    }

    /// Set the retention strategy.
    pub fn with_retention(mut self, policy: impl RetentionPolicy + 'static) -> Self {
        self.retention = Some(Arc::new(policy));
        self
    }

    /// Set the capacity.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// Summary of a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceInfo {
    /// Space name
    pub name: String,
    /// Selection policy name
    pub selection: String,
    /// Consumption policy name
    pub consumption: String,
    /// Retention policy name
    pub retention: String,
    /// Capacity, 0 for unbounded
    pub max_size: usize,
    /// Stored xuples, whatever their state
    pub stored: usize,
    /// Available, unexpired xuples
    pub available: usize,
}

/// Named buffer of xuples.
pub struct XupleSpace {
    name: String,
    selection: Arc<dyn SelectionPolicy>,
    consumption: Arc<dyn ConsumptionPolicy>,
    retention: Arc<dyn RetentionPolicy>,
    max_size: usize,
    xuples: RwLock<Vec<Xuple>>,
    events: Option<Arc<XupleEventBus>>,
}

impl fmt::Debug for XupleSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XupleSpace")
            .field("name", &self.name)
            .field("selection", &self.selection.name())
            .field("consumption", &self.consumption.name())
            .field("retention", &self.retention.name())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl XupleSpace {
    /// Create a space. Every policy must be present.
    pub fn new(name: impl Into<String>, config: XupleSpaceConfig) -> XupleResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(XupleError::InvalidConfiguration("space name is empty".into()));
        }
        let missing = |what: &str| {
            XupleError::InvalidPolicy(format!("space '{}' has no {} policy", name, what))
        };
        let selection = config.selection.ok_or_else(|| missing("selection"))?;
        let consumption = config.consumption.ok_or_else(|| missing("consumption"))?;
        let retention = config.retention.ok_or_else(|| missing("retention"))?;
        Ok(Self {
            name,
            selection,
            consumption,
            retention,
            max_size: config.max_size,
            xuples: RwLock::new(Vec::new()),
            events: None,
        })
    }

    /// Publish events on a bus.
    pub fn with_events(mut self, events: Arc<XupleEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Space name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity, 0 for unbounded.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn publish(&self, events: Vec<XupleEvent>) {
        if let Some(bus) = &self.events {
            for event in events {
                bus.notify(event);
            }
        }
    }

    /// Store a xuple, stamping its expiration.
    pub fn insert(&self, mut xuple: Xuple) -> XupleResult<()> {
        if xuple.id.trim().is_empty() {
            return Err(XupleError::InvalidConfiguration("xuple identifier is empty".into()));
        }
        {
            let mut xuples = self.xuples.write();
            if self.max_size > 0 && xuples.len() >= self.max_size {
                return Err(XupleError::SpaceFull {
                    space: self.name.clone(),
                    capacity: self.max_size,
                });
            }
            if xuples.iter().any(|x| x.id == xuple.id) {
                return Err(XupleError::InvalidConfiguration(format!(
                    "xuple '{}' is already stored in '{}'",
                    xuple.id, self.name
                )));
            }
            xuple.space = self.name.clone();
            xuple.metadata.expires_at = self.retention.expiration(xuple.created_at);
            xuples.push(xuple.clone());
        }
        tracing::trace!("Inserted xuple {} into {}", xuple.id, self.name);
        self.publish(vec![XupleEvent::new(XupleEventKind::Inserted, &self.name, &xuple.id)]);
        Ok(())
    }

    /// Mark every time-expired xuple. Returns the events to publish.
    fn sweep(&self, xuples: &mut [Xuple], now: DateTime<Utc>) -> Vec<XupleEvent> {
        xuples
            .iter_mut()
            .filter(|x| x.is_available() && x.is_expired(now))
            .filter_map(|x| {
                x.mark_expired()
                    .then(|| XupleEvent::new(XupleEventKind::Expired, &self.name, &x.id))
            })
            .collect()
    }

    /// Select and consume one xuple, under the caller's lock.
    ///
    /// `Ok(None)` when nothing is eligible; an index outside the candidate
    /// list is a policy error.
    fn take(
        &self,
        xuples: &mut [Xuple],
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> XupleResult<Option<(Xuple, XupleEvent)>> {
        let (positions, candidates): (Vec<usize>, Vec<&Xuple>) = xuples
            .iter()
            .enumerate()
            .filter(|(_, x)| {
                x.is_available() && !x.is_expired(now) && self.consumption.can_consume(x, agent_id)
            })
            .unzip();
        let Some(selected) = self.selection.select(&candidates) else {
            return Ok(None);
        };
        let Some(&chosen) = positions.get(selected) else {
            return Err(XupleError::InvalidPolicy(format!(
                "selection policy '{}' picked candidate {} of {} in '{}'",
                self.selection.name(),
                selected,
                candidates.len(),
                self.name
            )));
        };

        let xuple = &mut xuples[chosen];
        xuple.record_consumption(agent_id, now);
        if self.consumption.is_fully_consumed(xuple) {
            xuple.mark_consumed();
        }
        let event = XupleEvent::new(XupleEventKind::Consumed, &self.name, &xuple.id).by(agent_id);
        Ok(Some((xuple.clone(), event)))
    }

    /// Hand one xuple to an agent and record the consumption atomically.
    pub fn retrieve(&self, agent_id: &str) -> XupleResult<Xuple> {
        if agent_id.is_empty() {
            return Err(XupleError::EmptyAgentId);
        }
        let now = Utc::now();
        let (result, mut events) = {
            let mut xuples = self.xuples.write();
            let events = self.sweep(&mut xuples, now);
            (self.take(&mut xuples, agent_id, now), events)
        };
        let outcome = match result {
            Ok(Some((xuple, event))) => {
                events.push(event);
                Ok(xuple)
            }
            Ok(None) => Err(XupleError::NoAvailableXuple(self.name.clone())),
            Err(e) => Err(e),
        };
        self.publish(events);
        outcome
    }

    /// Up to `n` distinct xuples in one critical section.
    ///
    /// Returns fewer when supply runs out and an empty list when nothing is
    /// available.
    pub fn retrieve_multiple(&self, agent_id: &str, n: usize) -> XupleResult<Vec<Xuple>> {
        if agent_id.is_empty() {
            return Err(XupleError::EmptyAgentId);
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut taken = Vec::new();
        let (failure, events) = {
            let mut xuples = self.xuples.write();
            let mut events = self.sweep(&mut xuples, now);
            let mut failure = None;
            while taken.len() < n {
                match self.take(&mut xuples, agent_id, now) {
                    Ok(Some((xuple, event))) => {
                        taken.push(xuple);
                        events.push(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            (failure, events)
        };
        self.publish(events);
        match failure {
            Some(e) if taken.is_empty() => Err(e),
            Some(e) => {
                tracing::warn!(
                    "Stopped retrieving from {} after {} xuples: {}",
                    self.name,
                    taken.len(),
                    e
                );
                Ok(taken)
            }
            None => Ok(taken),
        }
    }

    /// Record a consumption for a xuple the agent already holds.
    pub fn mark_consumed(&self, xuple_id: &str, agent_id: &str) -> XupleResult<()> {
        if agent_id.is_empty() {
            return Err(XupleError::EmptyAgentId);
        }
        let now = Utc::now();
        let mut events = Vec::new();
        let result = {
            let mut xuples = self.xuples.write();
            events.extend(self.sweep(&mut xuples, now));
            match xuples.iter_mut().find(|x| x.id == xuple_id) {
                None => Err(XupleError::XupleNotFound(xuple_id.to_string())),
                Some(xuple)
                    if !xuple.is_available() || !self.consumption.can_consume(xuple, agent_id) =>
                {
                    Err(XupleError::XupleNotAvailable {
                        xuple_id: xuple_id.to_string(),
                        agent_id: agent_id.to_string(),
                    })
                }
                Some(xuple) => {
                    xuple.record_consumption(agent_id, now);
                    if self.consumption.is_fully_consumed(xuple) {
                        xuple.mark_consumed();
                    }
                    let event = XupleEvent::new(XupleEventKind::Consumed, &self.name, xuple_id);
                    events.push(event.by(agent_id));
                    Ok(())
                }
            }
        };
        self.publish(events);
        result
    }

    /// Expire every available xuple whose primary fact has this identifier.
    ///
    /// Returns how many were expired.
    pub fn expire_by_fact(&self, fact_id: &str) -> usize {
        let events: Vec<XupleEvent> = {
            let mut xuples = self.xuples.write();
            xuples
                .iter_mut()
                .filter(|x| x.fact.id == fact_id)
                .filter_map(|x| {
                    x.mark_expired()
                        .then(|| XupleEvent::new(XupleEventKind::Expired, &self.name, &x.id))
                })
                .collect()
        };
        let count = events.len();
        self.publish(events);
        count
    }

    /// Available, unexpired xuples.
    pub fn count(&self) -> usize {
        let now = Utc::now();
        self.xuples
            .read()
            .iter()
            .filter(|x| x.is_available() && !x.is_expired(now))
            .count()
    }

    /// Remove every xuple the retention policy no longer keeps.
    ///
    /// Returns the number removed; a second call right after removes nothing.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let removed: Vec<String> = {
            let mut xuples = self.xuples.write();
            let mut removed = Vec::new();
            xuples.retain(|x| {
                let keep = self.retention.should_retain(x, now) && !x.is_expired(now);
                if !keep {
                    removed.push(x.id.clone());
                }
                keep
            });
            removed
        };
        if !removed.is_empty() {
            tracing::debug!("Cleanup removed {} xuples from {}", removed.len(), self.name);
        }
        let count = removed.len();
        self.publish(
            removed
                .into_iter()
                .map(|id| XupleEvent::new(XupleEventKind::Removed, &self.name, id))
                .collect(),
        );
        count
    }

    /// Every stored xuple, bypassing policies.
    pub fn list_all(&self) -> Vec<Xuple> {
        self.xuples.read().clone()
    }

    /// Look up a stored xuple.
    pub fn get(&self, xuple_id: &str) -> Option<Xuple> {
        self.xuples.read().iter().find(|x| x.id == xuple_id).cloned()
    }

    /// Summary for inspection.
    pub fn info(&self) -> SpaceInfo {
        let now = Utc::now();
        let xuples = self.xuples.read();
        SpaceInfo {
            name: self.name.clone(),
            selection: self.selection.name(),
            consumption: self.consumption.name(),
            retention: self.retention.name(),
            max_size: self.max_size,
            stored: xuples.len(),
            available: xuples.iter().filter(|x| x.is_available() && !x.is_expired(now)).count(),
        }
    }
}
