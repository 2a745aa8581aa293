//! Registry of named xuple-spaces and the xuple factory.
//!
//! The manager is what terminal nodes hand their activations to: it
//! implements [`ActivationSink`], turning each firing into a xuple in the
//! space the rule targets and expiring it again when the firing is revoked.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{SubscriptionId, XupleEvent, XupleEventBus, XupleSubscription};
use super::space::{SpaceInfo, XupleSpace, XupleSpaceConfig};
use super::xuple::Xuple;
use crate::config::XupleDefaults;
use crate::error::{XupleError, XupleResult};
use crate::nodes::{ActionRecord, ActivationSink};
use crate::sync::RwLock;
use crate::types::Fact;

/// Named registry of xuple-spaces.
#[derive(Debug)]
pub struct XupleManager {
    spaces: RwLock<BTreeMap<String, Arc<XupleSpace>>>,
    events: Arc<XupleEventBus>,
    defaults: XupleDefaults,
}

impl Default for XupleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl XupleManager {
    /// Manager with the default policies for implicit spaces.
    pub fn new() -> Self {
        Self::with_defaults(XupleDefaults::default())
    }

    /// Manager with custom policies for implicit spaces.
    pub fn with_defaults(defaults: XupleDefaults) -> Self {
        Self {
            spaces: RwLock::new(BTreeMap::new()),
            events: Arc::new(XupleEventBus::new()),
            defaults,
        }
    }

    /// Policies applied by [`ensure_space`](Self::ensure_space).
    pub fn defaults(&self) -> &XupleDefaults {
        &self.defaults
    }

    fn default_config(&self) -> XupleSpaceConfig {
        XupleSpaceConfig::from_kinds(
            self.defaults.selection,
            self.defaults.consumption,
            self.defaults.retention,
            self.defaults.max_size,
        )
    }

    /// Register a new space.
    pub fn create_space(
        &self,
        name: &str,
        config: XupleSpaceConfig,
    ) -> XupleResult<Arc<XupleSpace>> {
        let space = Arc::new(XupleSpace::new(name, config)?.with_events(Arc::clone(&self.events)));
        let mut spaces = self.spaces.write();
        if spaces.contains_key(name) {
            return Err(XupleError::SpaceExists(name.to_string()));
        }
        spaces.insert(name.to_string(), Arc::clone(&space));
        tracing::info!("Created xuple-space {} ({:?})", name, space);
        Ok(space)
    }

    /// Look up a space.
    pub fn get_space(&self, name: &str) -> XupleResult<Arc<XupleSpace>> {
        self.spaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| XupleError::SpaceNotFound(name.to_string()))
    }

    /// Look up a space, creating it with the default policies when absent.
    pub fn ensure_space(&self, name: &str) -> XupleResult<Arc<XupleSpace>> {
        if let Some(space) = self.spaces.read().get(name) {
            return Ok(Arc::clone(space));
        }
        let mut spaces = self.spaces.write();
        if let Some(space) = spaces.get(name) {
            return Ok(Arc::clone(space));
        }
        let space = XupleSpace::new(name, self.default_config())?
            .with_events(Arc::clone(&self.events));
        let space = Arc::new(space);
        spaces.insert(name.to_string(), Arc::clone(&space));
        tracing::info!("Created xuple-space {} with default policies", name);
        Ok(space)
    }

    /// Unregister a space. Its xuples are dropped with it.
    pub fn remove_space(&self, name: &str) -> XupleResult<Arc<XupleSpace>> {
        let removed = self
            .spaces
            .write()
            .remove(name)
            .ok_or_else(|| XupleError::SpaceNotFound(name.to_string()))?;
        tracing::info!("Removed xuple-space {}", name);
        Ok(removed)
    }

    /// Names of the registered spaces, sorted.
    pub fn list_spaces(&self) -> Vec<String> {
        self.spaces.read().keys().cloned().collect()
    }

    /// Summaries of every space.
    pub fn space_infos(&self) -> Vec<SpaceInfo> {
        let spaces: Vec<Arc<XupleSpace>> = self.spaces.read().values().cloned().collect();
        spaces.iter().map(|s| s.info()).collect()
    }

    /// Build a xuple with a fresh identifier and insert it into a space.
    ///
    /// Returns the identifier of the new xuple.
    pub fn create_xuple(
        &self,
        space_name: &str,
        fact: Option<Arc<Fact>>,
        triggering_facts: Vec<Arc<Fact>>,
    ) -> XupleResult<String> {
        let fact = fact.ok_or(XupleError::NilFact)?;
        if space_name.is_empty() {
            return Err(XupleError::InvalidConfiguration("space name is empty".into()));
        }
        let space = self.get_space(space_name)?;
        let id = Uuid::new_v4().to_string();
        space.insert(Xuple::new(id.clone(), space_name, fact, triggering_facts))?;
        Ok(id)
    }

    /// Clean every space up and empty the registry.
    ///
    /// Returns the number of xuples removed by the final cleanup.
    pub fn close(&self) -> usize {
        let spaces = std::mem::take(&mut *self.spaces.write());
        let removed = spaces.values().map(|s| s.cleanup()).sum();
        tracing::info!("Closed xuple manager ({} spaces, {} xuples reaped)", spaces.len(), removed);
        removed
    }

    /// Run cleanup on every space. Returns the number removed.
    pub fn cleanup_all(&self) -> usize {
        let spaces: Vec<Arc<XupleSpace>> = self.spaces.read().values().cloned().collect();
        spaces.iter().map(|s| s.cleanup()).sum()
    }

    /// The event bus shared by every space.
    pub fn events(&self) -> &Arc<XupleEventBus> {
        &self.events
    }

    /// Subscribe to xuple events.
    pub fn subscribe(
        &self,
        subscription: XupleSubscription,
    ) -> (SubscriptionId, broadcast::Receiver<XupleEvent>) {
        self.events.subscribe(subscription)
    }
}

/// Primary fact of a firing: typed by the action, identified by the
/// activation, one field per argument.
pub fn activation_fact(record: &ActionRecord) -> Fact {
    let fields = record
        .argument_names
        .iter()
        .cloned()
        .zip(record.arguments.iter().cloned())
        .collect();
    Fact::with_fields(record.activation_id.clone(), record.action.clone(), fields)
}

impl ActivationSink for XupleManager {
    fn fire(&self, record: &ActionRecord) -> XupleResult<()> {
        self.ensure_space(&record.xuple_space)?;
        let id = self.create_xuple(
            &record.xuple_space,
            Some(Arc::new(activation_fact(record))),
            record.facts.clone(),
        )?;
        tracing::debug!(
            "Rule {} fired {} into {} as xuple {}",
            record.rule_id,
            record.action,
            record.xuple_space,
            id
        );
        Ok(())
    }

    fn revoke(&self, space: &str, activation_id: &str) -> XupleResult<()> {
        let space = match self.spaces.read().get(space) {
            Some(space) => Arc::clone(space),
            None => return Ok(()),
        };
        let expired = space.expire_by_fact(activation_id);
        if expired > 0 {
            tracing::debug!("Revoked activation {} ({} xuples expired)", activation_id, expired);
        }
        Ok(())
    }
}
