//! Common types flowing through the network.
//!
//! Facts are immutable typed records; tokens are partial matches built from
//! them. Both are shared through `Arc` so a fact accepted by many memories is
//! stored once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Identifier of a fact.
pub type FactId = String;

/// Identifier of a token (`token_N`).
pub type TokenId = String;

/// Name of the pseudo-field that resolves to the fact identifier.
pub const ID_FIELD: &str = "id";

/// Base type of a field or value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseType {
    /// UTF-8 string
    String,
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Number,
    /// true / false
    #[serde(alias = "bool")]
    Boolean,
}

impl BaseType {
    /// Parse a type name as written in a rule program.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(BaseType::String),
            "integer" | "int" => Some(BaseType::Integer),
            "number" | "float" => Some(BaseType::Number),
            "boolean" | "bool" => Some(BaseType::Boolean),
            _ => None,
        }
    }

    /// Integer or number.
    pub fn is_numeric(&self) -> bool {
        matches!(self, BaseType::Integer | BaseType::Number)
    }

    /// Whether `<`, `<=`, `>`, `>=` apply.
    pub fn is_orderable(&self) -> bool {
        matches!(self, BaseType::Integer | BaseType::Number | BaseType::String)
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseType::String => write!(f, "string"),
            BaseType::Integer => write!(f, "integer"),
            BaseType::Number => write!(f, "number"),
            BaseType::Boolean => write!(f, "boolean"),
        }
    }
}

/// A field value: a small closed sum.
///
/// Serialized untagged, so `18` reads as an integer, `18.5` as a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean
    Boolean(bool),
    /// Integral value
    Integer(i64),
    /// Floating value
    Number(f64),
    /// String
    String(String),
}

impl Value {
    /// Base type carried by this value.
    pub fn base_type(&self) -> BaseType {
        match self {
            Value::Boolean(_) => BaseType::Boolean,
            Value::Integer(_) => BaseType::Integer,
            Value::Number(_) => BaseType::Number,
            Value::String(_) => BaseType::String,
        }
    }

    /// Numeric view, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view; accepts integral floats.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                if *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(*n as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer or number.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Number(_))
    }

    /// Compare two values.
    ///
    /// Numbers compare numerically with integers widened, strings
    /// lexicographically, booleans only with booleans. Anything else is
    /// incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            _ => None,
        }
    }

    /// Render without quotes, the way it appears inside identifiers.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s),
            other => f.write_str(&other.to_plain_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// A typed record asserted into the network.
///
/// Immutable after creation. Identity is by identifier: two facts are the
/// same iff their identifiers match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier
    pub id: FactId,
    /// Declared type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Field values by name
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// When the fact was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// Create a fact without fields.
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            fields: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a fact from a field map.
    pub fn with_fields(
        id: impl Into<String>,
        type_name: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            fields,
            created_at: Utc::now(),
        }
    }

    /// Builder-style field setter.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Read a field. `id` falls back to the fact identifier.
    pub fn get(&self, field: &str) -> Option<Value> {
        match self.fields.get(field) {
            Some(value) => Some(value.clone()),
            None if field == ID_FIELD => Some(Value::String(self.id.clone())),
            None => None,
        }
    }

    /// Same identifier, type and field values (creation time ignored).
    pub fn same_content(&self, other: &Fact) -> bool {
        self.id == other.id && self.type_name == other.type_name && self.fields == other.fields
    }
}

impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Fact {}

impl Hash for Fact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Variable name to the fact currently filling it.
pub type Bindings = BTreeMap<String, Arc<Fact>>;

/// A partial or complete match.
///
/// Tokens are never mutated once stored; propagation builds new ones and links
/// them to their parent by identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Unique identifier
    pub id: TokenId,
    /// Matched facts in join order
    pub facts: Vec<Arc<Fact>>,
    /// Variable bindings
    pub bindings: Bindings,
    /// Node that produced the token
    pub node_id: String,
    /// Token this one was derived from
    pub parent: Option<TokenId>,
    /// Produced by a join (true) or an alpha node (false)
    pub is_join_result: bool,
}

impl Token {
    /// One-fact token emitted by an alpha node.
    pub fn alpha(id: TokenId, variable: &str, fact: Arc<Fact>, node_id: &str) -> Self {
        let mut bindings = Bindings::new();
        bindings.insert(variable.to_string(), Arc::clone(&fact));
        Self {
            id,
            facts: vec![fact],
            bindings,
            node_id: node_id.to_string(),
            parent: None,
            is_join_result: false,
        }
    }

    /// Left token extended with a right fact.
    pub fn joined(
        id: TokenId,
        left: &Token,
        variable: &str,
        fact: Arc<Fact>,
        node_id: &str,
    ) -> Self {
        let mut facts = left.facts.clone();
        facts.push(Arc::clone(&fact));
        let mut bindings = left.bindings.clone();
        bindings.insert(variable.to_string(), fact);
        Self {
            id,
            facts,
            bindings,
            node_id: node_id.to_string(),
            parent: Some(left.id.clone()),
            is_join_result: true,
        }
    }

    /// Same facts and bindings, re-issued by a gating node.
    pub fn passed_through(id: TokenId, left: &Token, node_id: &str) -> Self {
        Self {
            id,
            facts: left.facts.clone(),
            bindings: left.bindings.clone(),
            node_id: node_id.to_string(),
            parent: Some(left.id.clone()),
            is_join_result: left.is_join_result,
        }
    }

    /// Whether the fact participates in this token.
    pub fn contains_fact(&self, fact_id: &str) -> bool {
        self.facts.iter().any(|f| f.id == fact_id)
            || self.bindings.values().any(|f| f.id == fact_id)
    }

    /// Bound variable names, sorted.
    pub fn variables(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    /// Identifiers of the matched facts, in order.
    pub fn fact_ids(&self) -> Vec<&str> {
        self.facts.iter().map(|f| f.id.as_str()).collect()
    }
}

/// Tokens compare by identifier, lineage and matched fact identifiers.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.node_id == other.node_id
            && self.parent == other.parent
            && self.fact_ids() == other.fact_ids()
    }
}

/// Atomic source of token identifiers.
#[derive(Debug, Default)]
pub struct TokenIdGenerator {
    next: AtomicU64,
}

impl TokenIdGenerator {
    /// Start at `token_1`.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Next unique identifier.
    pub fn next_id(&self) -> TokenId {
        let n = self.next.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        format!("token_{}", n)
    }

    /// Make sure later identifiers never collide with `id`.
    ///
    /// Used after memories were restored from storage.
    pub fn advance_past(&self, id: &str) {
        if let Some(n) = id.strip_prefix("token_").and_then(|n| n.parse::<u64>().ok()) {
            self.next.fetch_max(n, AtomicOrdering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fact(id: &str) -> Arc<Fact> {
        Arc::new(Fact::new(id, "Person").field("age", 30).field("name", "Ada"))
    }

    #[test]
    fn test_value_deserialize_untagged() {
        let v: Value = serde_json::from_str("18").unwrap();
        assert_eq!(v, Value::Integer(18));
        let v: Value = serde_json::from_str("18.5").unwrap();
        assert_eq!(v, Value::Number(18.5));
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Boolean(true));
        let v: Value = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(v, Value::String("x".into()));
    }

    #[test]
    fn test_value_compare_widens() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Number(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Number(3.0).compare(&Value::Integer(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::from("b").compare(&Value::from("a")),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::from("1").compare(&Value::Integer(1)), None);
        assert_eq!(Value::Boolean(true).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_as_i64_accepts_integral_floats() {
        assert_eq!(Value::Number(4.0).as_i64(), Some(4));
        assert_eq!(Value::Number(4.5).as_i64(), None);
        assert_eq!(Value::from("4").as_i64(), None);
    }

    #[test]
    fn test_base_type_parse() {
        assert_eq!(BaseType::parse("bool"), Some(BaseType::Boolean));
        assert_eq!(BaseType::parse("integer"), Some(BaseType::Integer));
        assert_eq!(BaseType::parse("Person"), None);
        assert!(BaseType::String.is_orderable());
        assert!(!BaseType::Boolean.is_orderable());
    }

    #[test]
    fn test_fact_identity_and_id_field() {
        let a = Fact::new("P1", "Person").field("age", 30);
        let b = Fact::new("P1", "Person").field("age", 31);
        assert_eq!(a, b);
        assert!(!a.same_content(&b));
        assert_eq!(a.get("id"), Some(Value::from("P1")));
        assert_eq!(a.get("age"), Some(Value::Integer(30)));
        assert_eq!(a.get("missing"), None);

        let explicit = Fact::new("internal", "User").field("id", "U1");
        assert_eq!(explicit.get("id"), Some(Value::from("U1")));
    }

    #[test]
    fn test_token_lineage() {
        let ids = TokenIdGenerator::new();
        let p = create_test_fact("P1");
        let o = Arc::new(Fact::new("O1", "Order"));

        let alpha = Token::alpha(ids.next_id(), "p", Arc::clone(&p), "alpha_p");
        assert_eq!(alpha.id, "token_1");
        assert!(!alpha.is_join_result);

        let joined = Token::joined(ids.next_id(), &alpha, "o", Arc::clone(&o), "join_0");
        assert_eq!(joined.parent.as_deref(), Some("token_1"));
        assert_eq!(joined.fact_ids(), vec!["P1", "O1"]);
        assert_eq!(joined.variables(), vec!["o", "p"]);
        assert!(joined.contains_fact("O1"));
        assert!(joined.is_join_result);

        let passed = Token::passed_through(ids.next_id(), &joined, "not_0");
        assert_eq!(passed.parent.as_deref(), Some(joined.id.as_str()));
        assert_eq!(passed.facts.len(), 2);
    }
}
