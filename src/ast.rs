//! Rule program AST.
//!
//! The rule text grammar lives outside this crate; its parser emits a JSON
//! document that deserializes into [`Program`]. Tag spellings used by older
//! parser versions are accepted as synonyms so persisted programs keep
//! loading.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::error::{Position, ReteError, ReteResult};
use crate::types::Value;
use crate::xuples::{ConsumptionKind, RetentionKind, SelectionKind};

/// A complete rule program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    /// Type definitions, in declaration order
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
    /// Action signatures
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    /// Xuple-spaces to create
    #[serde(default)]
    pub xuple_spaces: Vec<XupleSpaceDeclaration>,
    /// Rules
    #[serde(default)]
    pub expressions: Vec<Expression>,
    /// Inline facts asserted after compilation
    #[serde(default)]
    pub facts: Vec<FactDeclaration>,
    /// Rules to remove
    #[serde(default)]
    pub rule_removals: Vec<RuleRemoval>,
}

impl Program {
    /// Parse a program from its JSON form.
    pub fn from_json_str(json: &str) -> ReteResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a program file.
    pub fn from_file(path: impl AsRef<Path>) -> ReteResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            ReteError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&data)
    }

    /// Look up a type definition by name.
    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Look up an action definition by name.
    pub fn action_definition(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// A user-defined record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDefinition {
    /// Type name
    pub name: String,
    /// Ordered field list
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// Source position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl TypeDefinition {
    /// Build a definition from `(name, type)` pairs.
    pub fn new(name: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        Self {
            name: name.into(),
            fields: fields
                .iter()
                .map(|(n, t)| FieldDefinition::new(*n, *t))
                .collect(),
            position: None,
        }
    }

    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Primary-key fields in declaration order.
    pub fn primary_key(&self) -> Vec<&FieldDefinition> {
        self.fields.iter().filter(|f| f.is_primary_key).collect()
    }
}

/// One field of a type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    /// Field name
    pub name: String,
    /// Base type name as written (`string`, `integer`, `number`, `boolean`)
    #[serde(rename = "type")]
    pub type_name: String,
    /// Part of the primary key
    #[serde(default)]
    pub is_primary_key: bool,
}

impl FieldDefinition {
    /// Plain field.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_primary_key: false,
        }
    }

    /// Primary-key field.
    pub fn key(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            is_primary_key: true,
            ..Self::new(name, type_name)
        }
    }
}

/// Signature of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Action name
    pub name: String,
    /// Ordered parameters
    #[serde(default)]
    pub parameters: Vec<ActionParameter>,
}

impl ActionDefinition {
    /// Number of parameters without default and not optional.
    pub fn required_arity(&self) -> usize {
        self.parameters
            .iter()
            .filter(|p| !p.optional && p.default_value.is_none())
            .count()
    }
}

/// Parameter of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParameter {
    /// Parameter name
    pub name: String,
    /// Base type or declared type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// May be omitted
    #[serde(default)]
    pub optional: bool,
    /// Used when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// Declaration of a xuple-space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XupleSpaceDeclaration {
    /// Space name
    pub name: String,
    /// Selection strategy
    #[serde(default)]
    pub selection: SelectionKind,
    /// Consumption strategy
    #[serde(default)]
    pub consumption: ConsumptionKind,
    /// Retention strategy
    #[serde(default)]
    pub retention: RetentionKind,
    /// Capacity, 0 for unbounded
    #[serde(default)]
    pub max_size: usize,
}

/// A rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expression {
    /// Unique rule identifier
    pub rule_id: String,
    /// Variables of the single pattern block
    #[serde(default)]
    pub set: VariableSet,
    /// Additional pattern blocks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<VariableSet>,
    /// Constraint tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Expr>,
    /// Action clause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Target xuple-space; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xuple_space: Option<String>,
    /// Source position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Expression {
    /// Every declared variable, pattern blocks included, in order.
    pub fn variables(&self) -> Vec<&TypedVariable> {
        self.set
            .variables
            .iter()
            .chain(self.patterns.iter().flat_map(|p| p.variables.iter()))
            .collect()
    }

    /// Job calls of the action clause.
    pub fn jobs(&self) -> Vec<&JobCall> {
        self.action.as_ref().map(Action::jobs).unwrap_or_default()
    }
}

/// Ordered list of typed variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSet {
    /// Variables
    #[serde(default)]
    pub variables: Vec<TypedVariable>,
}

/// `name: Type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedVariable {
    /// Variable name
    pub name: String,
    /// Declared type name
    pub data_type: String,
}

impl TypedVariable {
    /// Create a typed variable.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Action clause: one job or a list of jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Single job (older format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobCall>,
    /// Multiple jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobCall>,
}

impl Action {
    /// One-job action.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            job: None,
            jobs: vec![JobCall {
                name: name.into(),
                args,
            }],
        }
    }

    /// `jobs` when present, otherwise the single `job`.
    pub fn jobs(&self) -> Vec<&JobCall> {
        if !self.jobs.is_empty() {
            self.jobs.iter().collect()
        } else {
            self.job.iter().collect()
        }
    }
}

/// `name(args...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCall {
    /// Action name
    pub name: String,
    /// Argument expressions
    #[serde(default)]
    pub args: Vec<Expr>,
}

/// Request to remove a rule: either the bare identifier or a command object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRemoval {
    /// `"rule_id"`
    Id(String),
    /// `{ "ruleID": "rule_id" }`
    Command {
        /// Rule to remove
        #[serde(rename = "ruleID", alias = "ruleId")]
        rule_id: String,
    },
}

impl RuleRemoval {
    /// Identifier of the rule to remove.
    pub fn rule_id(&self) -> &str {
        match self {
            RuleRemoval::Id(id) => id,
            RuleRemoval::Command { rule_id } => rule_id,
        }
    }
}

/// Inline fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactDeclaration {
    /// Type name
    pub type_name: String,
    /// Explicit identifier; derived from the type when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Field values
    #[serde(default)]
    pub fields: FactFields,
    /// Source position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// Field values of an inline fact, as a map or as parser field entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactFields {
    /// `{ "age": 25 }`
    Map(BTreeMap<String, Value>),
    /// `[{ "name": "age", "value": { "type": "number", "value": 25 } }]`
    Entries(Vec<FactFieldEntry>),
}

impl Default for FactFields {
    fn default() -> Self {
        FactFields::Map(BTreeMap::new())
    }
}

impl FactFields {
    /// Flatten into a field map.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        match self {
            FactFields::Map(map) => map.clone(),
            FactFields::Entries(entries) => entries
                .iter()
                .map(|e| (e.name.clone(), e.value.value().clone()))
                .collect(),
        }
    }
}

/// One `name = value` entry of an inline fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactFieldEntry {
    /// Field name
    pub name: String,
    /// Field value
    pub value: FactValue,
}

/// Value of an inline fact field, optionally wrapped with its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    /// `{ "type": "number", "value": 25 }`
    Typed {
        /// Type tag as emitted by the parser
        #[serde(rename = "type")]
        type_tag: String,
        /// Value
        value: Value,
    },
    /// `25`
    Plain(Value),
}

impl FactValue {
    /// The wrapped value.
    pub fn value(&self) -> &Value {
        match self {
            FactValue::Typed { value, .. } => value,
            FactValue::Plain(value) => value,
        }
    }
}

// =============================================================================
// Constraint tree
// =============================================================================

/// A node of the constraint tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expr {
    /// `object.field`
    FieldAccess {
        /// Variable name
        object: String,
        /// Field name
        field: String,
    },
    /// Bare variable reference
    Variable {
        /// Variable name
        name: String,
    },
    /// Constant
    #[serde(alias = "numberLiteral", alias = "number", alias = "integerLiteral")]
    #[serde(alias = "stringLiteral", alias = "string")]
    #[serde(alias = "booleanLiteral", alias = "boolean", alias = "bool")]
    Literal {
        /// Literal value
        value: Value,
    },
    /// Comparison, arithmetic or string operator
    #[serde(alias = "binary_op", alias = "binaryOp", alias = "comparison")]
    BinaryOperation {
        /// Left operand
        left: Box<Expr>,
        /// Operator
        operator: Operator,
        /// Right operand
        right: Box<Expr>,
        /// Source position
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
    },
    /// `left op1 right1 op2 right2 ...`, folded left to right
    #[serde(alias = "logicalExpression", alias = "logical_op")]
    LogicalExpr {
        /// First operand
        left: Box<Expr>,
        /// Remaining operations
        #[serde(default)]
        operations: Vec<LogicalOperation>,
    },
    /// `NOT expression`
    NotConstraint {
        /// Negated expression
        expression: Box<Expr>,
    },
    /// `EXISTS(variable where condition)`
    ExistsConstraint {
        /// Quantified variable
        variable: TypedVariable,
        /// Condition over the quantified and outer variables
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Box<Expr>>,
    },
    /// `FUNC(variable.field where condition) op value`
    AggregateConstraint(AggregateConstraint),
}

/// One `AND right` / `OR right` step of a logical expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalOperation {
    /// Connective
    pub op: LogicalOp,
    /// Operand
    pub right: Expr,
}

/// Aggregation over the facts of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConstraint {
    /// Aggregate function
    pub function: AggregateFunction,
    /// Aggregated variable
    pub variable: TypedVariable,
    /// Aggregated field; not needed for count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Filter over the aggregated and outer variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Box<Expr>>,
    /// Threshold comparison operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    /// Threshold value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Box<Expr>>,
    /// Name under which the result is bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregateConstraint {
    /// Name the result is bound under: the alias, or `_agg{index}` for the
    /// `index`-th aggregate of the rule.
    pub fn binding_name(&self, index: usize) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("_agg{}", index))
    }
}

impl Expr {
    /// `object.field`
    pub fn field(object: impl Into<String>, field: impl Into<String>) -> Self {
        Expr::FieldAccess {
            object: object.into(),
            field: field.into(),
        }
    }

    /// Literal constant.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    /// `left op right`
    pub fn binary(left: Expr, operator: Operator, right: Expr) -> Self {
        Expr::BinaryOperation {
            left: Box::new(left),
            operator,
            right: Box::new(right),
            position: None,
        }
    }

    /// Conjunction of the given expressions.
    pub fn and(mut exprs: Vec<Expr>) -> Self {
        if exprs.len() == 1 {
            return exprs.remove(0);
        }
        let mut iter = exprs.into_iter();
        let left = iter.next().unwrap_or(Expr::literal(true));
        Expr::LogicalExpr {
            left: Box::new(left),
            operations: iter
                .map(|right| LogicalOperation {
                    op: LogicalOp::And,
                    right,
                })
                .collect(),
        }
    }

    /// `NOT expr`
    pub fn not(expr: Expr) -> Self {
        Expr::NotConstraint {
            expression: Box::new(expr),
        }
    }

    /// `EXISTS(var: Type where condition)`
    pub fn exists(variable: TypedVariable, condition: Option<Expr>) -> Self {
        Expr::ExistsConstraint {
            variable,
            condition: condition.map(Box::new),
        }
    }

    /// Split top-level conjunctions into their operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::LogicalExpr { left, operations }
                if operations.iter().all(|op| op.op == LogicalOp::And) =>
            {
                let mut out = left.conjuncts();
                for op in operations {
                    out.extend(op.right.conjuncts());
                }
                out
            }
            other => vec![other],
        }
    }

    /// Variables referenced anywhere in the tree, quantified ones included.
    pub fn referenced_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    /// Variables referenced from outside any quantifier of this tree.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut out = self.referenced_variables();
        for bound in self.quantified_variables() {
            out.remove(&bound);
        }
        out
    }

    /// Variables introduced by EXISTS and aggregate constraints in this tree.
    pub fn quantified_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |expr| match expr {
            Expr::ExistsConstraint { variable, .. } => {
                out.insert(variable.name.clone());
            }
            Expr::AggregateConstraint(agg) => {
                out.insert(agg.variable.name.clone());
            }
            _ => {}
        });
        out
    }

    /// Nesting depth; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        let children = self.children();
        1 + children.iter().map(|c| c.depth()).max().unwrap_or(0)
    }

    /// Immediate sub-expressions.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::FieldAccess { .. } | Expr::Variable { .. } | Expr::Literal { .. } => Vec::new(),
            Expr::BinaryOperation { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::LogicalExpr { left, operations } => {
                let mut out = vec![left.as_ref()];
                out.extend(operations.iter().map(|op| &op.right));
                out
            }
            Expr::NotConstraint { expression } => vec![expression.as_ref()],
            Expr::ExistsConstraint { condition, .. } => {
                condition.iter().map(|c| c.as_ref()).collect()
            }
            Expr::AggregateConstraint(agg) => agg
                .condition
                .iter()
                .chain(agg.value.iter())
                .map(|c| c.as_ref())
                .collect(),
        }
    }

    /// Pre-order traversal.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Position recorded by the parser, if any.
    pub fn position(&self) -> Option<Position> {
        match self {
            Expr::BinaryOperation { position, .. } => *position,
            _ => None,
        }
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        self.walk(&mut |expr| match expr {
            Expr::FieldAccess { object, .. } => {
                out.insert(object.clone());
            }
            Expr::Variable { name } => {
                out.insert(name.clone());
            }
            _ => {}
        });
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::FieldAccess { object, field } => write!(f, "{}.{}", object, field),
            Expr::Variable { name } => f.write_str(name),
            Expr::Literal { value } => write!(f, "{}", value),
            Expr::BinaryOperation {
                left,
                operator,
                right,
                ..
            } => write!(f, "({} {} {})", left, operator, right),
            Expr::LogicalExpr { left, operations } => {
                write!(f, "({}", left)?;
                for op in operations {
                    write!(f, " {} {}", op.op, op.right)?;
                }
                f.write_str(")")
            }
            Expr::NotConstraint { expression } => write!(f, "NOT {}", expression),
            Expr::ExistsConstraint {
                variable,
                condition,
            } => match condition {
                Some(c) => write!(f, "EXISTS({}: {} / {})", variable.name, variable.data_type, c),
                None => write!(f, "EXISTS({}: {})", variable.name, variable.data_type),
            },
            Expr::AggregateConstraint(agg) => {
                write!(f, "{}({}", agg.function, agg.variable.name)?;
                if let Some(field) = &agg.field {
                    write!(f, ".{}", field)?;
                }
                f.write_str(")")?;
                if let (Some(op), Some(value)) = (&agg.operator, &agg.value) {
                    write!(f, " {} {}", op, value)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Binary operator. Unknown spellings are kept as [`Operator::Invalid`] and
/// reported by the type checker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `CONTAINS`
    Contains,
    /// `MATCHES`
    Matches,
    /// Anything else
    Invalid(String),
}

impl Operator {
    /// `==`, `!=`
    pub fn is_equality(&self) -> bool {
        matches!(self, Operator::Eq | Operator::Ne)
    }

    /// `<`, `<=`, `>`, `>=`
    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge)
    }

    /// Equality or ordering.
    pub fn is_comparison(&self) -> bool {
        self.is_equality() || self.is_ordering()
    }

    /// `+ - * / %`
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod
        )
    }

    /// `CONTAINS`, `MATCHES`
    pub fn is_string_op(&self) -> bool {
        matches!(self, Operator::Contains | Operator::Matches)
    }

    /// The comparison obtained by swapping operands.
    pub fn flipped(&self) -> Operator {
        match self {
            Operator::Lt => Operator::Gt,
            Operator::Le => Operator::Ge,
            Operator::Gt => Operator::Lt,
            Operator::Ge => Operator::Le,
            other => other.clone(),
        }
    }

    /// Textual form.
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::Contains => "CONTAINS",
            Operator::Matches => "MATCHES",
            Operator::Invalid(s) => s,
        }
    }
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.trim() {
            "==" | "=" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "+" => Operator::Add,
            "-" => Operator::Sub,
            "*" => Operator::Mul,
            "/" => Operator::Div,
            "%" => Operator::Mod,
            other if other.eq_ignore_ascii_case("contains") => Operator::Contains,
            other if other.eq_ignore_ascii_case("matches") => Operator::Matches,
            _ => Operator::Invalid(s),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical connective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalOp {
    /// `AND`
    And,
    /// `OR`
    Or,
    /// Anything else
    Invalid(String),
}

impl From<String> for LogicalOp {
    fn from(s: String) -> Self {
        match s.trim() {
            "&&" => LogicalOp::And,
            "||" => LogicalOp::Or,
            other if other.eq_ignore_ascii_case("and") => LogicalOp::And,
            other if other.eq_ignore_ascii_case("or") => LogicalOp::Or,
            _ => LogicalOp::Invalid(s),
        }
    }
}

impl From<LogicalOp> for String {
    fn from(op: LogicalOp) -> Self {
        op.to_string()
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => f.write_str("AND"),
            LogicalOp::Or => f.write_str("OR"),
            LogicalOp::Invalid(s) => f.write_str(s),
        }
    }
}

/// Aggregate function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AggregateFunction {
    /// Sum of a numeric field
    Sum,
    /// Number of facts
    Count,
    /// Mean of a numeric field
    Avg,
    /// Smallest value
    Min,
    /// Largest value
    Max,
    /// Anything else
    Unsupported(String),
}

impl From<String> for AggregateFunction {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "sum" => AggregateFunction::Sum,
            "count" => AggregateFunction::Count,
            "avg" | "average" => AggregateFunction::Avg,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            _ => AggregateFunction::Unsupported(s),
        }
    }
}

impl From<AggregateFunction> for String {
    fn from(f: AggregateFunction) -> Self {
        f.to_string()
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFunction::Sum => f.write_str("SUM"),
            AggregateFunction::Count => f.write_str("COUNT"),
            AggregateFunction::Avg => f.write_str("AVG"),
            AggregateFunction::Min => f.write_str("MIN"),
            AggregateFunction::Max => f.write_str("MAX"),
            AggregateFunction::Unsupported(s) => f.write_str(s),
        }
    }
}
