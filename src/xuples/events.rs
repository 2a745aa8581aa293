/// Change notifications for xuple-spaces.
///
/// Agents that would otherwise poll `retrieve` can subscribe to a space and
/// wake up when work arrives. Subscriptions can be:
///
/// - **Global**: every event of every space
/// - **Space-level**: events of one space
/// - **Kind-filtered**: only some event kinds (e.g. inserts)
///
/// # Example
///
/// ```ignore
/// use rete_xuples::xuples::{XupleEventBus, XupleSubscription};
///
/// let bus = XupleEventBus::new();
/// let (_id, mut rx) = bus.subscribe(XupleSubscription::space("alerts").inserts_only());
///
/// while let Ok(event) = rx.recv().await {
///     println!("{} {}", event.kind, event.xuple_id);
/// }
/// ```
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for subscription broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What happened to a xuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XupleEventKind {
    /// Stored in a space
    Inserted,
    /// Handed to an agent
    Consumed,
    /// Marked expired (time or revocation)
    Expired,
    /// Dropped by cleanup
    Removed,
}

impl fmt::Display for XupleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XupleEventKind::Inserted => "inserted",
            XupleEventKind::Consumed => "consumed",
            XupleEventKind::Expired => "expired",
            XupleEventKind::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// An event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XupleEvent {
    /// What happened
    pub kind: XupleEventKind,
    /// Space concerned
    pub space: String,
    /// Xuple concerned
    pub xuple_id: String,
    /// Consuming agent, for consumption events
    pub agent_id: Option<String>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl XupleEvent {
    /// Build an event stamped now.
    pub fn new(
        kind: XupleEventKind,
        space: impl Into<String>,
        xuple_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            space: space.into(),
            xuple_id: xuple_id.into(),
            agent_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the consuming agent.
    pub fn by(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// A subscription definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XupleSubscription {
    /// Space filter (None = all spaces)
    pub space: Option<String>,
    /// Event kinds to receive
    pub kinds: Vec<XupleEventKind>,
    /// Human-readable name
    pub name: Option<String>,
}

impl XupleSubscription {
    const ALL_KINDS: [XupleEventKind; 4] = [
        XupleEventKind::Inserted,
        XupleEventKind::Consumed,
        XupleEventKind::Expired,
        XupleEventKind::Removed,
    ];

    /// Every event of every space.
    pub fn all() -> Self {
        Self {
            space: None,
            kinds: Self::ALL_KINDS.to_vec(),
            name: None,
        }
    }

    /// Every event of one space.
    pub fn space(space: impl Into<String>) -> Self {
        Self {
            space: Some(space.into()),
            ..Self::all()
        }
    }

    /// Restrict to the given kinds.
    pub fn with_kinds(mut self, kinds: Vec<XupleEventKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Only insertions.
    pub fn inserts_only(self) -> Self {
        self.with_kinds(vec![XupleEventKind::Inserted])
    }

    /// Name the subscription.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Check if this subscription wants an event.
    pub fn matches(&self, event: &XupleEvent) -> bool {
        if !self.kinds.contains(&event.kind) {
            return false;
        }
        match &self.space {
            Some(space) => *space == event.space,
            None => true,
        }
    }
}

/// Information about an active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// The subscription ID
    pub id: SubscriptionId,
    /// The subscription definition
    pub subscription: XupleSubscription,
    /// When the subscription was created
    pub created_at: DateTime<Utc>,
    /// Number of events delivered
    pub events_delivered: u64,
}

struct SubscriptionState {
    subscription: XupleSubscription,
    sender: broadcast::Sender<XupleEvent>,
    created_at: DateTime<Utc>,
    events_delivered: AtomicU64,
}

/// Fan-out of xuple events to subscribers.
pub struct XupleEventBus {
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_id: AtomicU64,
    channel_capacity: usize,
}

impl fmt::Debug for XupleEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XupleEventBus")
            .field("subscriptions", &self.subscriptions.len())
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl XupleEventBus {
    /// Create a bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            channel_capacity: capacity.max(1),
        }
    }

    /// Subscribe; returns the identifier and a receiver.
    pub fn subscribe(
        &self,
        subscription: XupleSubscription,
    ) -> (SubscriptionId, broadcast::Receiver<XupleEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = broadcast::channel(self.channel_capacity);
        self.subscriptions.insert(
            id,
            SubscriptionState {
                subscription,
                sender,
                created_at: Utc::now(),
                events_delivered: AtomicU64::new(0),
            },
        );
        (id, receiver)
    }

    /// Another receiver on an existing subscription.
    pub fn receiver(&self, id: SubscriptionId) -> Option<broadcast::Receiver<XupleEvent>> {
        self.subscriptions.get(&id).map(|state| state.sender.subscribe())
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Information about a subscription.
    pub fn get_subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.subscriptions.get(&id).map(|state| SubscriptionInfo {
            id,
            subscription: state.subscription.clone(),
            created_at: state.created_at,
            events_delivered: state.events_delivered.load(Ordering::Relaxed),
        })
    }

    /// All active subscriptions.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                subscription: entry.value().subscription.clone(),
                created_at: entry.value().created_at,
                events_delivered: entry.value().events_delivered.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Deliver an event to every matching subscription.
    pub fn notify(&self, event: XupleEvent) {
        for entry in self.subscriptions.iter() {
            let state = entry.value();
            if state.subscription.matches(&event) && state.sender.send(event.clone()).is_ok() {
                state.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for XupleEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_event(kind: XupleEventKind, space: &str) -> XupleEvent {
        XupleEvent::new(kind, space, "x1")
    }

    #[test]
    fn test_subscription_matching() {
        let sub = XupleSubscription::space("alerts").inserts_only();
        assert!(sub.matches(&create_test_event(XupleEventKind::Inserted, "alerts")));
        assert!(!sub.matches(&create_test_event(XupleEventKind::Consumed, "alerts")));
        assert!(!sub.matches(&create_test_event(XupleEventKind::Inserted, "jobs")));
        let removed = create_test_event(XupleEventKind::Removed, "jobs");
        assert!(XupleSubscription::all().matches(&removed));
    }

    #[tokio::test]
    async fn test_bus_delivers_matching_events() {
        let bus = XupleEventBus::new();
        let (id, mut rx) = bus.subscribe(XupleSubscription::space("alerts"));

        bus.notify(create_test_event(XupleEventKind::Inserted, "jobs"));
        bus.notify(create_test_event(XupleEventKind::Consumed, "alerts").by("agent-1"));

        tokio::select! {
            event = rx.recv() => {
                let event = event.unwrap();
                assert_eq!(event.space, "alerts");
                assert_eq!(event.agent_id.as_deref(), Some("agent-1"));
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                panic!("Should have received event");
            }
        }

        assert_eq!(bus.get_subscription(id).unwrap().events_delivered, 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_multiple_receivers() {
        let bus = XupleEventBus::new();
        let (id, mut rx1) = bus.subscribe(XupleSubscription::all());
        let mut rx2 = bus.receiver(id).unwrap();

        bus.notify(create_test_event(XupleEventKind::Expired, "s"));
        assert_eq!(rx1.try_recv().unwrap().kind, XupleEventKind::Expired);
        assert_eq!(rx2.try_recv().unwrap().kind, XupleEventKind::Expired);
    }
}
