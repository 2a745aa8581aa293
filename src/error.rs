//! Error types for rule compilation, propagation and the xuple layer.
//!
//! The hierarchy follows the four tiers of failure the engine knows about:
//!
//! 1. [`ValidationError`] - raised while a program is compiled, never during
//!    steady-state processing.
//! 2. [`ReteError::Node`] - a node enrichment wrapping a lower-level cause
//!    with the identifier and kind of the node that failed.
//! 3. [`DataError`] - missing fields, runtime type clashes, unsupported
//!    aggregates. Absorbed locally: the condition is false, nothing propagates.
//! 4. [`XupleError`] - resource errors surfaced by the xuple-space API.
//!
//! Coordination with an external tuple store has its own [`CoordinationError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::nodes::NodeType;

/// Source position of an AST element, when the parser recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Kind of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationErrorKind {
    /// Generic structural problem
    #[serde(rename = "validation-error")]
    Validation,
    /// Operand types are not compatible with the operator
    TypeMismatch,
    /// Field is not declared on the type
    FieldNotFound,
    /// Type name is not declared
    UnknownType,
    /// Operator is not recognised or not applicable
    InvalidOperator,
    /// Type declared twice
    DuplicateType,
    /// Field declared twice on the same type
    DuplicateField,
    /// Type declared with an empty name
    EmptyTypeName,
    /// Field declared with an empty name
    EmptyFieldName,
    /// Expression without action clause
    MissingAction,
    /// Expression without variables
    NoVariables,
    /// Field declared with a type outside the base types
    InvalidFieldType,
}

impl ValidationErrorKind {
    /// Kebab-case name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationErrorKind::Validation => "validation-error",
            ValidationErrorKind::TypeMismatch => "type-mismatch",
            ValidationErrorKind::FieldNotFound => "field-not-found",
            ValidationErrorKind::UnknownType => "unknown-type",
            ValidationErrorKind::InvalidOperator => "invalid-operator",
            ValidationErrorKind::DuplicateType => "duplicate-type",
            ValidationErrorKind::DuplicateField => "duplicate-field",
            ValidationErrorKind::EmptyTypeName => "empty-type-name",
            ValidationErrorKind::EmptyFieldName => "empty-field-name",
            ValidationErrorKind::MissingAction => "missing-action",
            ValidationErrorKind::NoVariables => "no-variables",
            ValidationErrorKind::InvalidFieldType => "invalid-field-type",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single validation failure: a kind and a one-line message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// What went wrong
    pub kind: ValidationErrorKind,
    /// One-line human readable message
    pub message: String,
    /// Where in the rule source, if known
    pub position: Option<Position>,
}

impl ValidationError {
    /// Create a validation error without position.
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
        }
    }

    /// Attach a source position (keeps an already present one).
    pub fn at(mut self, position: Option<Position>) -> Self {
        if self.position.is_none() {
            self.position = position;
        }
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{} at {}: {}", self.kind, pos, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Every validation error collected for one program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    errors: Vec<ValidationError>,
}

impl ValidationReport {
    /// Wrap a list of errors.
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }

    /// The collected errors, in discovery order.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Number of errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// True when at least one error has the given kind.
    pub fn has_kind(&self, kind: ValidationErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    /// First error, if any.
    pub fn first(&self) -> Option<&ValidationError> {
        self.errors.first()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl From<ValidationError> for ValidationReport {
    fn from(error: ValidationError) -> Self {
        Self::new(vec![error])
    }
}

/// Runtime data problems. Never fatal to a node.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Field absent from the fact
    #[error("Field '{field}' not found on fact '{fact_id}'")]
    MissingField {
        /// Fact that was inspected
        fact_id: String,
        /// Requested field
        field: String,
    },

    /// Variable referenced but not bound in the evaluation context
    #[error("Variable '{0}' is not bound")]
    UnboundVariable(String),

    /// Operands have types the operator cannot combine
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Operator not applicable at runtime
    #[error("Invalid operator '{0}'")]
    InvalidOperator(String),

    /// Division or modulo by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Integer arithmetic overflowed
    #[error("Arithmetic overflow")]
    Overflow,

    /// Aggregate function not supported
    #[error("Unsupported aggregate '{0}'")]
    UnsupportedAggregate(String),

    /// min/max over an empty input
    #[error("Aggregate over empty input")]
    AggregateEmpty,

    /// Fact does not conform to its declared type
    #[error("Invalid fact '{fact_id}': {reason}")]
    InvalidFact {
        /// Offending fact
        fact_id: String,
        /// Why it was rejected
        reason: String,
    },
}

impl DataError {
    /// Kebab-case kind of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::MissingField { .. } => "missing-field",
            DataError::UnboundVariable(_) => "unbound-variable",
            DataError::TypeMismatch(_) => "type-mismatch",
            DataError::InvalidOperator(_) => "invalid-operator",
            DataError::DivisionByZero => "division-by-zero",
            DataError::Overflow => "overflow",
            DataError::UnsupportedAggregate(_) => "unsupported-aggregate",
            DataError::AggregateEmpty => "aggregate-empty",
            DataError::InvalidFact { .. } => "invalid-fact",
        }
    }
}

/// Resource errors of the xuple-space API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XupleError {
    /// Space has a finite capacity that is already reached
    #[error("Xuple-space '{space}' is full (capacity {capacity})")]
    SpaceFull {
        /// Space name
        space: String,
        /// Configured capacity
        capacity: usize,
    },

    /// No xuple with that identifier in the space
    #[error("Xuple '{0}' not found")]
    XupleNotFound(String),

    /// Xuple exists but cannot be consumed by that agent
    #[error("Xuple '{xuple_id}' is not available to agent '{agent_id}'")]
    XupleNotAvailable {
        /// Xuple identifier
        xuple_id: String,
        /// Requesting agent
        agent_id: String,
    },

    /// Agent identifier is empty
    #[error("Agent identifier must not be empty")]
    EmptyAgentId,

    /// Xuple creation without a fact
    #[error("Cannot create a xuple without a fact")]
    NilFact,

    /// A space with that name is already registered
    #[error("Xuple-space '{0}' already exists")]
    SpaceExists(String),

    /// No space registered under that name
    #[error("Xuple-space '{0}' not found")]
    SpaceNotFound(String),

    /// A policy handle is missing or unusable
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Nothing the agent may consume right now
    #[error("No available xuple in space '{0}'")]
    NoAvailableXuple(String),
}

impl XupleError {
    /// Kebab-case kind of the error.
    pub fn kind(&self) -> &'static str {
        match self {
            XupleError::SpaceFull { .. } => "space-full",
            XupleError::XupleNotFound(_) => "xuple-not-found",
            XupleError::XupleNotAvailable { .. } => "xuple-not-available",
            XupleError::EmptyAgentId => "empty-agent-id",
            XupleError::NilFact => "nil-fact",
            XupleError::SpaceExists(_) => "space-exists",
            XupleError::SpaceNotFound(_) => "space-not-found",
            XupleError::InvalidPolicy(_) => "invalid-policy",
            XupleError::InvalidConfiguration(_) => "invalid-configuration",
            XupleError::NoAvailableXuple(_) => "no-available-xuple",
        }
    }
}

/// Result alias for xuple-space operations.
pub type XupleResult<T> = Result<T, XupleError>;

/// Errors of the external tuple-coordination contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The call exceeded its deadline and was abandoned
    #[error("Coordination call '{operation}' timed out after {millis} ms")]
    Timeout {
        /// Primitive that timed out
        operation: String,
        /// Deadline that was applied
        millis: u64,
    },

    /// No tuple at that position
    #[error("No tuple at /{state}/{position}")]
    NotFound {
        /// State keyspace
        state: String,
        /// Position inside the state
        position: u64,
    },

    /// A compare-and-set lost the race
    #[error("Concurrent modification of {0}")]
    Conflict(String),

    /// Retry budget exhausted
    #[error("Tuple at position {position} exhausted {retries} retries")]
    Exhausted {
        /// Position of the tuple
        position: u64,
        /// Retries performed
        retries: u32,
    },

    /// Stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoordinationError {
    /// Whether the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Timeout { .. } | CoordinationError::Conflict(_)
        )
    }
}

/// Result alias for coordination primitives.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// The main error type of the engine.
///
/// All fallible network operations return `Result<T, ReteError>`.
#[derive(Error, Debug)]
pub enum ReteError {
    /// Program rejected by validation
    #[error("Validation failed: {0}")]
    Validation(ValidationReport),

    /// A node failed while propagating
    #[error("Node '{node_id}' ({node_type}) failed: {source}")]
    Node {
        /// Identifier of the failing node
        node_id: String,
        /// Kind of the failing node
        node_type: NodeType,
        /// Underlying cause
        #[source]
        source: Box<ReteError>,
    },

    /// Data problem surfaced at the API boundary
    #[error(transparent)]
    Data(#[from] DataError),

    /// Xuple-space resource error
    #[error(transparent)]
    Xuple(#[from] XupleError),

    /// Retraction or update of an unknown fact
    #[error("Fact '{0}' not found")]
    FactNotFound(String),

    /// Strict insertion of a fact that already exists
    #[error("Fact '{0}' already exists")]
    FactExists(String),

    /// Removal of an unknown rule
    #[error("Rule '{0}' not found")]
    RuleNotFound(String),

    /// Graph or memory integrity violated
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Persistence failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReteError {
    /// Wrap this error with the identity of the node it escaped from.
    ///
    /// Errors that already carry a node are passed through untouched so the
    /// innermost failing node is the one reported.
    pub fn in_node(self, node_id: impl Into<String>, node_type: NodeType) -> Self {
        match self {
            ReteError::Node { .. } => self,
            other => ReteError::Node {
                node_id: node_id.into(),
                node_type,
                source: Box::new(other),
            },
        }
    }

    /// The validation report, if this is a validation failure.
    pub fn validation_report(&self) -> Option<&ValidationReport> {
        match self {
            ReteError::Validation(report) => Some(report),
            _ => None,
        }
    }
}

impl From<ValidationReport> for ReteError {
    fn from(report: ValidationReport) -> Self {
        ReteError::Validation(report)
    }
}

impl From<ValidationError> for ReteError {
    fn from(error: ValidationError) -> Self {
        ReteError::Validation(error.into())
    }
}

/// Result type alias for engine operations.
pub type ReteResult<T> = Result<T, ReteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_kind_names() {
        assert_eq!(ValidationErrorKind::Validation.to_string(), "validation-error");
        assert_eq!(ValidationErrorKind::TypeMismatch.to_string(), "type-mismatch");
        assert_eq!(
            ValidationErrorKind::InvalidFieldType.to_string(),
            "invalid-field-type"
        );
        let json = serde_json::to_string(&ValidationErrorKind::Validation).unwrap();
        assert_eq!(json, "\"validation-error\"");
        let json = serde_json::to_string(&ValidationErrorKind::NoVariables).unwrap();
        assert_eq!(json, "\"no-variables\"");
    }

    #[test]
    fn test_validation_error_display() {
        let err =
            ValidationError::new(ValidationErrorKind::UnknownType, "type 'Foo' is not declared")
                .at(Some(Position { line: 3, column: 7 }));
        assert_eq!(err.to_string(), "unknown-type at 3:7: type 'Foo' is not declared");

        let report = ValidationReport::new(vec![
            err.clone(),
            ValidationError::new(ValidationErrorKind::MissingAction, "rule r1 has no action"),
        ]);
        assert_eq!(report.len(), 2);
        assert!(report.has_kind(ValidationErrorKind::MissingAction));
        assert!(report.to_string().contains("; missing-action"));
    }

    #[test]
    fn test_node_wrapping_keeps_innermost() {
        let err = ReteError::Invariant("broken".into()).in_node("r1_join_0", NodeType::Join);
        let rewrapped = err.in_node("root", NodeType::Root);
        match rewrapped {
            ReteError::Node { node_id, node_type, .. } => {
                assert_eq!(node_id, "r1_join_0");
                assert_eq!(node_type, NodeType::Join);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_resource_kinds() {
        assert_eq!(XupleError::EmptyAgentId.kind(), "empty-agent-id");
        assert_eq!(
            XupleError::NoAvailableXuple("tasks".into()).kind(),
            "no-available-xuple"
        );
        assert_eq!(DataError::AggregateEmpty.kind(), "aggregate-empty");
        assert!(
            CoordinationError::Timeout {
                operation: "append".into(),
                millis: 10
            }
            .is_retryable()
        );
        assert!(!CoordinationError::Exhausted { position: 1, retries: 3 }.is_retryable());
    }
}
