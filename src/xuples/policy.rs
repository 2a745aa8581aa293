//! Selection, consumption and retention strategies.
//!
//! Each concern is a trait so spaces can carry custom strategies; the
//! serializable `*Kind` enums name the built-ins for configuration files and
//! program declarations.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::xuple::Xuple;
use crate::sync::RwLock;

/// Built-in selection strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    /// Oldest first
    #[default]
    Fifo,
    /// Newest first
    Lifo,
    /// Uniform over the candidates
    Random,
}

impl SelectionKind {
    /// Instantiate the strategy.
    pub fn build(self) -> Arc<dyn SelectionPolicy> {
        match self {
            SelectionKind::Fifo => Arc::new(FifoSelection),
            SelectionKind::Lifo => Arc::new(LifoSelection),
            SelectionKind::Random => Arc::new(RandomSelection::new()),
        }
    }
}

impl std::str::FromStr for SelectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(SelectionKind::Fifo),
            "lifo" => Ok(SelectionKind::Lifo),
            "random" => Ok(SelectionKind::Random),
            other => Err(format!("unknown selection policy '{}'", other)),
        }
    }
}

/// Built-in consumption strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionKind {
    /// One consumption in total
    #[default]
    Once,
    /// One consumption per agent
    #[serde(alias = "per-agent", alias = "perAgent")]
    PerAgent,
    /// Up to `k` agents
    Limited(u32),
}

impl ConsumptionKind {
    /// Instantiate the strategy.
    pub fn build(self) -> Arc<dyn ConsumptionPolicy> {
        match self {
            ConsumptionKind::Once => Arc::new(OnceConsumption),
            ConsumptionKind::PerAgent => Arc::new(PerAgentConsumption),
            ConsumptionKind::Limited(k) => Arc::new(LimitedConsumption::new(k)),
        }
    }
}

impl std::str::FromStr for ConsumptionKind {
    type Err = String;

    /// `once`, `per-agent`, or `limited:<k>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "once" => Ok(ConsumptionKind::Once),
            "per-agent" | "per_agent" | "peragent" => Ok(ConsumptionKind::PerAgent),
            other => match other.strip_prefix("limited:") {
                Some(k) => k
                    .trim()
                    .parse()
                    .map(ConsumptionKind::Limited)
                    .map_err(|_| format!("invalid consumption limit '{}'", k)),
                None => Err(format!("unknown consumption policy '{}'", other)),
            },
        }
    }
}

/// Built-in retention strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    /// No expiration; cleanup still reaps consumed and expired xuples
    #[default]
    Unlimited,
    /// Expire this many seconds after creation
    Duration(u64),
}

impl RetentionKind {
    /// Instantiate the strategy.
    pub fn build(self) -> Arc<dyn RetentionPolicy> {
        match self {
            RetentionKind::Unlimited => Arc::new(UnlimitedRetention),
            RetentionKind::Duration(secs) => Arc::new(DurationRetention::from_secs(secs)),
        }
    }
}

impl std::str::FromStr for RetentionKind {
    type Err = String;

    /// `unlimited` or `duration:<seconds>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "unlimited" {
            return Ok(RetentionKind::Unlimited);
        }
        match lower.strip_prefix("duration:") {
            Some(secs) => secs
                .trim()
                .parse()
                .map(RetentionKind::Duration)
                .map_err(|_| format!("invalid retention duration '{}'", secs)),
            None => Err(format!("unknown retention policy '{}'", lower)),
        }
    }
}

/// Chooses one xuple among the candidates an agent may consume.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// Policy name.
    fn name(&self) -> String;

    /// Index of the chosen candidate. Candidates arrive in insertion order.
    fn select(&self, candidates: &[&Xuple]) -> Option<usize>;
}

/// Decides who may consume a xuple and when it is used up.
pub trait ConsumptionPolicy: Send + Sync + fmt::Debug {
    /// Policy name.
    fn name(&self) -> String;

    /// Whether the agent may consume the xuple now.
    fn can_consume(&self, xuple: &Xuple, agent_id: &str) -> bool;

    /// Called after a consumption was recorded; `true` flips the xuple to
    /// consumed.
    fn is_fully_consumed(&self, xuple: &Xuple) -> bool;
}

/// Decides expiration and what cleanup keeps.
pub trait RetentionPolicy: Send + Sync + fmt::Debug {
    /// Policy name.
    fn name(&self) -> String;

    /// Expiration stamped at insertion, `None` for never.
    fn expiration(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Whether cleanup keeps the xuple.
    fn should_retain(&self, xuple: &Xuple, now: DateTime<Utc>) -> bool;
}

/// Oldest creation timestamp wins; ties go to the earlier insertion.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoSelection;

impl SelectionPolicy for FifoSelection {
    fn name(&self) -> String {
        "fifo".into()
    }

    fn select(&self, candidates: &[&Xuple]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, x)| (x.created_at, *i))
            .map(|(i, _)| i)
    }
}

/// Newest creation timestamp wins; ties go to the later insertion.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifoSelection;

impl SelectionPolicy for LifoSelection {
    fn name(&self) -> String {
        "lifo".into()
    }

    fn select(&self, candidates: &[&Xuple]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(i, x)| (x.created_at, *i))
            .map(|(i, _)| i)
    }
}

/// Uniform choice from a generator owned by the policy instance.
#[derive(Debug)]
pub struct RandomSelection {
    rng: RwLock<StdRng>,
}

impl RandomSelection {
    /// Seeded from entropy.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Deterministic sequence for a seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RwLock::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RandomSelection {
    fn name(&self) -> String {
        "random".into()
    }

    fn select(&self, candidates: &[&Xuple]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.rng.write().gen_range(0..candidates.len()))
    }
}

/// First consumption uses the xuple up.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnceConsumption;

impl ConsumptionPolicy for OnceConsumption {
    fn name(&self) -> String {
        "once".into()
    }

    fn can_consume(&self, xuple: &Xuple, _agent_id: &str) -> bool {
        xuple.metadata.consumption_count == 0
    }

    fn is_fully_consumed(&self, _xuple: &Xuple) -> bool {
        true
    }
}

/// Every agent may consume once; never used up globally.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerAgentConsumption;

impl ConsumptionPolicy for PerAgentConsumption {
    fn name(&self) -> String {
        "per-agent".into()
    }

    fn can_consume(&self, xuple: &Xuple, agent_id: &str) -> bool {
        !xuple.consumed_by(agent_id)
    }

    fn is_fully_consumed(&self, _xuple: &Xuple) -> bool {
        false
    }
}

/// Up to `max` distinct agents.
#[derive(Debug, Clone, Copy)]
pub struct LimitedConsumption {
    max: u32,
}

impl LimitedConsumption {
    /// A limit of zero is raised to one.
    pub fn new(max: u32) -> Self {
        Self { max: max.max(1) }
    }

    /// Effective limit.
    pub fn max(&self) -> u32 {
        self.max
    }
}

impl ConsumptionPolicy for LimitedConsumption {
    fn name(&self) -> String {
        format!("limited({})", self.max)
    }

    fn can_consume(&self, xuple: &Xuple, agent_id: &str) -> bool {
        xuple.metadata.consumption_count < self.max as usize && !xuple.consumed_by(agent_id)
    }

    fn is_fully_consumed(&self, xuple: &Xuple) -> bool {
        xuple.metadata.consumption_count >= self.max as usize
    }
}

/// Never expires; cleanup keeps only available xuples.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedRetention;

impl RetentionPolicy for UnlimitedRetention {
    fn name(&self) -> String {
        "unlimited".into()
    }

    fn expiration(&self, _created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }

    fn should_retain(&self, xuple: &Xuple, _now: DateTime<Utc>) -> bool {
        xuple.is_available()
    }
}

/// Expires a fixed time after creation.
#[derive(Debug, Clone, Copy)]
pub struct DurationRetention {
    duration: Duration,
}

impl DurationRetention {
    /// Retain for `duration`.
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Retain for whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self::new(Duration::try_seconds(secs).unwrap_or(Duration::MAX))
    }

    /// Configured duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl RetentionPolicy for DurationRetention {
    fn name(&self) -> String {
        format!("duration({}s)", self.duration.num_seconds())
    }

    fn expiration(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(created_at.checked_add_signed(self.duration).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    fn should_retain(&self, xuple: &Xuple, now: DateTime<Utc>) -> bool {
        xuple.is_available() && !xuple.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fact;

    fn create_test_xuple(id: &str, offset_ms: i64) -> Xuple {
        let mut xuple = Xuple::new(id, "s", Arc::new(Fact::new(id, "Job")), Vec::new());
        xuple.created_at += Duration::milliseconds(offset_ms);
        xuple
    }

    #[test]
    fn test_fifo_and_lifo() {
        let a = create_test_xuple("a", 0);
        let b = create_test_xuple("b", 10);
        let c = create_test_xuple("c", 20);
        let candidates = vec![&b, &a, &c];
        assert_eq!(FifoSelection.select(&candidates), Some(1));
        assert_eq!(LifoSelection.select(&candidates), Some(2));
        assert_eq!(FifoSelection.select(&[]), None);
    }

    #[test]
    fn test_timestamp_ties_follow_insertion() {
        let a = create_test_xuple("a", 0);
        let mut b = create_test_xuple("b", 0);
        b.created_at = a.created_at;
        let candidates = vec![&a, &b];
        assert_eq!(FifoSelection.select(&candidates), Some(0));
        assert_eq!(LifoSelection.select(&candidates), Some(1));
    }

    #[test]
    fn test_random_is_seeded_per_instance() {
        let xs: Vec<Xuple> = (0..10).map(|i| create_test_xuple(&format!("x{}", i), i)).collect();
        let candidates: Vec<&Xuple> = xs.iter().collect();
        let first = RandomSelection::with_seed(7);
        let second = RandomSelection::with_seed(7);
        for _ in 0..20 {
            let pick = first.select(&candidates);
            assert_eq!(pick, second.select(&candidates));
            assert!(pick.is_some_and(|i| i < 10));
        }
    }

    #[test]
    fn test_consumption_policies() {
        let mut xuple = create_test_xuple("x", 0);
        assert!(OnceConsumption.can_consume(&xuple, "a"));
        xuple.record_consumption("a", Utc::now());
        assert!(!OnceConsumption.can_consume(&xuple, "b"));

        assert!(!PerAgentConsumption.can_consume(&xuple, "a"));
        assert!(PerAgentConsumption.can_consume(&xuple, "b"));
        assert!(!PerAgentConsumption.is_fully_consumed(&xuple));

        let limited = LimitedConsumption::new(2);
        assert!(limited.can_consume(&xuple, "b"));
        assert!(!limited.is_fully_consumed(&xuple));
        xuple.record_consumption("b", Utc::now());
        assert!(limited.is_fully_consumed(&xuple));
        assert!(!limited.can_consume(&xuple, "c"));

        assert_eq!(LimitedConsumption::new(0).max(), 1);
    }

    #[test]
    fn test_retention_policies() {
        let now = Utc::now();
        assert_eq!(UnlimitedRetention.expiration(now), None);

        let retention = DurationRetention::from_secs(60);
        assert_eq!(retention.expiration(now), Some(now + Duration::seconds(60)));

        let mut xuple = create_test_xuple("x", 0);
        assert!(UnlimitedRetention.should_retain(&xuple, now));
        xuple.metadata.expires_at = Some(now - Duration::seconds(1));
        assert!(!retention.should_retain(&xuple, now));
        xuple.mark_consumed();
        assert!(!UnlimitedRetention.should_retain(&xuple, now));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("LIFO".parse::<SelectionKind>(), Ok(SelectionKind::Lifo));
        assert_eq!("per-agent".parse::<ConsumptionKind>(), Ok(ConsumptionKind::PerAgent));
        assert_eq!("limited:3".parse::<ConsumptionKind>(), Ok(ConsumptionKind::Limited(3)));
        assert_eq!("duration:30".parse::<RetentionKind>(), Ok(RetentionKind::Duration(30)));
        assert!("sometimes".parse::<ConsumptionKind>().is_err());

        let kind: ConsumptionKind = serde_json::from_str(r#"{"limited": 2}"#).unwrap();
        assert_eq!(kind, ConsumptionKind::Limited(2));
        let kind: ConsumptionKind = serde_json::from_str(r#""per-agent""#).unwrap();
        assert_eq!(kind, ConsumptionKind::PerAgent);
    }
}
