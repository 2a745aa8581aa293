//! Condition evaluation.
//!
//! One evaluator serves every node kind: alpha nodes evaluate against a
//! single fact, beta nodes against a token's bindings plus the candidate
//! right fact. Evaluation never panics. Missing fields, unbound variables and
//! type clashes come back as [`DataError`], which callers treat as "the
//! condition is false".

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use crate::aggregate::AGGREGATE_TYPE;
use crate::ast::{Expr, LogicalOp, Operator};
use crate::error::DataError;
use crate::types::{Bindings, Fact, Value};

/// Where variables are resolved during evaluation.
#[derive(Debug, Clone, Copy)]
pub enum EvalContext<'a> {
    /// Single fact; every object name resolves to it
    Fact(&'a Fact),
    /// Token bindings, optionally extended with one candidate fact
    Bindings {
        /// Left-side bindings
        bindings: &'a Bindings,
        /// Right-side candidate and the variable it would fill
        extra: Option<(&'a str, &'a Fact)>,
    },
}

impl<'a> EvalContext<'a> {
    /// Context over bindings alone.
    pub fn bindings(bindings: &'a Bindings) -> Self {
        EvalContext::Bindings {
            bindings,
            extra: None,
        }
    }

    /// Context over bindings plus a candidate fact.
    pub fn with_candidate(bindings: &'a Bindings, variable: &'a str, fact: &'a Fact) -> Self {
        EvalContext::Bindings {
            bindings,
            extra: Some((variable, fact)),
        }
    }

    /// The fact standing for a variable.
    pub fn resolve(&self, name: &str) -> Option<&'a Fact> {
        match *self {
            EvalContext::Fact(fact) => Some(fact),
            EvalContext::Bindings { bindings, extra } => match extra {
                Some((variable, fact)) if variable == name => Some(fact),
                _ => bindings.get(name).map(|f| f.as_ref()),
            },
        }
    }
}

/// Evaluate an expression to a value.
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, DataError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),
        Expr::FieldAccess { object, field } => {
            let fact = ctx
                .resolve(object)
                .ok_or_else(|| DataError::UnboundVariable(object.clone()))?;
            fact.get(field).ok_or_else(|| DataError::MissingField {
                fact_id: fact.id.clone(),
                field: field.clone(),
            })
        }
        Expr::Variable { name } => {
            let fact = ctx
                .resolve(name)
                .ok_or_else(|| DataError::UnboundVariable(name.clone()))?;
            if fact.type_name == AGGREGATE_TYPE {
                fact.get("value").ok_or_else(|| DataError::MissingField {
                    fact_id: fact.id.clone(),
                    field: "value".into(),
                })
            } else {
                Ok(Value::String(fact.id.clone()))
            }
        }
        Expr::BinaryOperation {
            left,
            operator,
            right,
            ..
        } => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            apply_operator(operator, &l, &r)
        }
        Expr::LogicalExpr { left, operations } => {
            let mut acc = evaluate_bool(left, ctx)?;
            for operation in operations {
                acc = match &operation.op {
                    LogicalOp::And => acc && evaluate_bool(&operation.right, ctx)?,
                    LogicalOp::Or => acc || evaluate_bool(&operation.right, ctx)?,
                    LogicalOp::Invalid(op) => return Err(DataError::InvalidOperator(op.clone())),
                };
            }
            Ok(Value::Boolean(acc))
        }
        Expr::NotConstraint { expression } => Ok(Value::Boolean(!evaluate_bool(expression, ctx)?)),
        Expr::ExistsConstraint { .. } => Err(DataError::InvalidOperator("EXISTS".into())),
        Expr::AggregateConstraint(agg) => {
            Err(DataError::InvalidOperator(agg.function.to_string()))
        }
    }
}

/// Evaluate an expression that must produce a boolean.
pub fn evaluate_bool(expr: &Expr, ctx: &EvalContext<'_>) -> Result<bool, DataError> {
    match evaluate(expr, ctx)? {
        Value::Boolean(b) => Ok(b),
        other => Err(DataError::TypeMismatch(format!(
            "'{}' evaluated to {}, expected boolean",
            expr, other
        ))),
    }
}

/// True only when the expression evaluates to `true`.
pub fn test(expr: &Expr, ctx: &EvalContext<'_>) -> bool {
    matches!(evaluate(expr, ctx), Ok(Value::Boolean(true)))
}

/// Apply a binary operator to two values.
pub fn apply_operator(
    operator: &Operator,
    left: &Value,
    right: &Value,
) -> Result<Value, DataError> {
    match operator {
        Operator::Eq | Operator::Ne => {
            let ordering = left.compare(right).ok_or_else(|| mismatch(operator, left, right))?;
            let equal = ordering == Ordering::Equal;
            Ok(Value::Boolean(if *operator == Operator::Eq { equal } else { !equal }))
        }
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            if matches!(left, Value::Boolean(_)) || matches!(right, Value::Boolean(_)) {
                return Err(mismatch(operator, left, right));
            }
            let ordering = left.compare(right).ok_or_else(|| mismatch(operator, left, right))?;
            let result = match operator {
                Operator::Lt => ordering == Ordering::Less,
                Operator::Le => ordering != Ordering::Greater,
                Operator::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Boolean(result))
        }
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod => {
            arithmetic(operator, left, right)
        }
        Operator::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => {
                Ok(Value::Boolean(haystack.contains(needle.as_str())))
            }
            _ => Err(mismatch(operator, left, right)),
        },
        Operator::Matches => match (left, right) {
            (Value::String(s), Value::String(pattern)) => {
                let re = compiled_pattern(pattern).map_err(|e| {
                    DataError::InvalidOperator(format!("MATCHES pattern '{}': {}", pattern, e))
                })?;
                Ok(Value::Boolean(re.is_match(s)))
            }
            _ => Err(mismatch(operator, left, right)),
        },
        Operator::Invalid(op) => Err(DataError::InvalidOperator(op.clone())),
    }
}

/// Compiled `MATCHES` patterns, shared by every node.
static PATTERNS: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// Upper bound on cached patterns; the cache starts over when it is reached.
const PATTERN_CACHE_LIMIT: usize = 1024;

/// Compile a pattern once and reuse it on later evaluations.
fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = PATTERNS.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    if PATTERNS.len() >= PATTERN_CACHE_LIMIT {
        PATTERNS.clear();
    }
    PATTERNS.insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn arithmetic(operator: &Operator, left: &Value, right: &Value) -> Result<Value, DataError> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            let result = match operator {
                Operator::Add => a.checked_add(b),
                Operator::Sub => a.checked_sub(b),
                Operator::Mul => a.checked_mul(b),
                Operator::Div => {
                    if b == 0 {
                        return Err(DataError::DivisionByZero);
                    }
                    return Ok(Value::Number(a as f64 / b as f64));
                }
                _ => {
                    if b == 0 {
                        return Err(DataError::DivisionByZero);
                    }
                    a.checked_rem(b)
                }
            };
            result.map(Value::Integer).ok_or(DataError::Overflow)
        }
        (l, r) if l.is_numeric() && r.is_numeric() => {
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(mismatch(operator, left, right)),
            };
            let result = match operator {
                Operator::Add => a + b,
                Operator::Sub => a - b,
                Operator::Mul => a * b,
                Operator::Div => {
                    if b == 0.0 {
                        return Err(DataError::DivisionByZero);
                    }
                    a / b
                }
                _ => {
                    if b == 0.0 {
                        return Err(DataError::DivisionByZero);
                    }
                    a % b
                }
            };
            Ok(Value::Number(result))
        }
        _ => Err(mismatch(operator, left, right)),
    }
}

fn mismatch(operator: &Operator, left: &Value, right: &Value) -> DataError {
    DataError::TypeMismatch(format!(
        "cannot apply '{}' to {} and {}",
        operator,
        left.base_type(),
        right.base_type()
    ))
}

/// `left_var.left_field op right_var.right_field`
///
/// The left variable is bound by the incoming token, the right one by the
/// candidate fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCondition {
    /// Variable bound on the left side
    pub left_var: String,
    /// Field read from the left fact
    pub left_field: String,
    /// Comparison
    pub operator: Operator,
    /// Variable filled by the right fact
    pub right_var: String,
    /// Field read from the right fact
    pub right_field: String,
}

impl JoinCondition {
    /// Build a join condition.
    pub fn new(
        left_var: impl Into<String>,
        left_field: impl Into<String>,
        operator: Operator,
        right_var: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Self {
        Self {
            left_var: left_var.into(),
            left_field: left_field.into(),
            operator,
            right_var: right_var.into(),
            right_field: right_field.into(),
        }
    }

    /// Evaluate against a token's bindings and a candidate right fact.
    ///
    /// An unbound left variable or a missing field fails the condition.
    pub fn test(&self, bindings: &Bindings, right: &Fact) -> bool {
        self.evaluate(bindings, right).unwrap_or(false)
    }

    /// Like [`JoinCondition::test`] but reporting why it failed.
    pub fn evaluate(&self, bindings: &Bindings, right: &Fact) -> Result<bool, DataError> {
        let left = bindings
            .get(&self.left_var)
            .ok_or_else(|| DataError::UnboundVariable(self.left_var.clone()))?;
        let l = left.get(&self.left_field).ok_or_else(|| DataError::MissingField {
            fact_id: left.id.clone(),
            field: self.left_field.clone(),
        })?;
        let r = right.get(&self.right_field).ok_or_else(|| DataError::MissingField {
            fact_id: right.id.clone(),
            field: self.right_field.clone(),
        })?;
        match apply_operator(&self.operator, &l, &r)? {
            Value::Boolean(b) => Ok(b),
            other => Err(DataError::TypeMismatch(format!(
                "join condition produced {}",
                other
            ))),
        }
    }

    /// The condition as an expression tree.
    pub fn to_expr(&self) -> Expr {
        Expr::binary(
            Expr::field(&self.left_var, &self.left_field),
            self.operator.clone(),
            Expr::field(&self.right_var, &self.right_field),
        )
    }
}

impl fmt::Display for JoinCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} {} {}.{}",
            self.left_var, self.left_field, self.operator, self.right_var, self.right_field
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::LogicalOperation;
    use std::sync::Arc;

    fn create_test_person() -> Fact {
        Fact::new("U1", "User")
            .field("age", 25)
            .field("score", 2.5)
            .field("name", "Ada Lovelace")
            .field("active", true)
    }

    #[test]
    fn test_single_fact_comparisons() {
        let p = create_test_person();
        let ctx = EvalContext::Fact(&p);
        let ge = Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(18));
        assert!(test(&ge, &ctx));
        let widened = Expr::binary(Expr::field("p", "score"), Operator::Lt, Expr::literal(3));
        assert!(test(&widened, &ctx));
        let ids = Expr::binary(Expr::field("p", "id"), Operator::Eq, Expr::literal("U1"));
        assert!(test(&ids, &ctx));
    }

    #[test]
    fn test_failures_are_false() {
        let p = create_test_person();
        let ctx = EvalContext::Fact(&p);
        let missing = Expr::binary(Expr::field("p", "height"), Operator::Gt, Expr::literal(1));
        assert!(!test(&missing, &ctx));
        assert!(matches!(
            evaluate(&missing, &ctx),
            Err(DataError::MissingField { .. })
        ));

        let clash = Expr::binary(Expr::field("p", "age"), Operator::Eq, Expr::literal("25"));
        assert!(matches!(evaluate(&clash, &ctx), Err(DataError::TypeMismatch(_))));

        let bool_order =
            Expr::binary(Expr::field("p", "active"), Operator::Gt, Expr::literal(false));
        assert!(!test(&bool_order, &ctx));
    }

    #[test]
    fn test_arithmetic() {
        let v = |op, a: Value, b: Value| apply_operator(&op, &a, &b);
        assert_eq!(v(Operator::Add, 2.into(), 3.into()), Ok(Value::Integer(5)));
        assert_eq!(v(Operator::Div, 7.into(), 2.into()), Ok(Value::Number(3.5)));
        assert_eq!(v(Operator::Mod, 7.into(), 2.into()), Ok(Value::Integer(1)));
        assert_eq!(v(Operator::Mul, 2.into(), 1.5.into()), Ok(Value::Number(3.0)));
        assert_eq!(v(Operator::Div, 1.into(), 0.into()), Err(DataError::DivisionByZero));
        assert_eq!(v(Operator::Mod, 1.5.into(), 0.0.into()), Err(DataError::DivisionByZero));
        assert_eq!(
            v(Operator::Add, i64::MAX.into(), 1.into()),
            Err(DataError::Overflow)
        );
        assert!(v(Operator::Add, "a".into(), 1.into()).is_err());
    }

    #[test]
    fn test_string_operators() {
        let p = create_test_person();
        let ctx = EvalContext::Fact(&p);
        let contains =
            Expr::binary(Expr::field("p", "name"), Operator::Contains, Expr::literal("Love"));
        assert!(test(&contains, &ctx));
        let matches =
            Expr::binary(Expr::field("p", "name"), Operator::Matches, Expr::literal("^Ada\\s"));
        assert!(test(&matches, &ctx));
        let bad = Expr::binary(Expr::field("p", "name"), Operator::Matches, Expr::literal("("));
        assert!(matches!(evaluate(&bad, &ctx), Err(DataError::InvalidOperator(_))));
    }

    #[test]
    fn test_matches_pattern_compiled_once() {
        let pattern = "^Lovelace-[0-9]+$";
        let first = compiled_pattern(pattern).unwrap();
        assert!(PATTERNS.contains_key(pattern));
        let second = compiled_pattern(pattern).unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(second.is_match("Lovelace-1815"));
        assert!(compiled_pattern("(").is_err());
        assert!(!PATTERNS.contains_key("("));
    }

    #[test]
    fn test_logical_fold() {
        let p = create_test_person();
        let ctx = EvalContext::Fact(&p);
        // false OR true AND true == (false OR true) AND true
        let expr = Expr::LogicalExpr {
            left: Box::new(Expr::literal(false)),
            operations: vec![
                LogicalOperation {
                    op: LogicalOp::Or,
                    right: Expr::literal(true),
                },
                LogicalOperation {
                    op: LogicalOp::And,
                    right: Expr::field("p", "active"),
                },
            ],
        };
        assert!(test(&expr, &ctx));
        assert!(!test(&Expr::not(expr), &ctx));
    }

    #[test]
    fn test_bindings_context() {
        let user = Arc::new(create_test_person());
        let order = Fact::new("O1", "Order").field("user_id", "U1");
        let mut bindings = Bindings::new();
        bindings.insert("u".into(), Arc::clone(&user));

        let expr = Expr::binary(Expr::field("u", "id"), Operator::Eq, Expr::field("o", "user_id"));
        assert!(test(&expr, &EvalContext::with_candidate(&bindings, "o", &order)));
        assert!(matches!(
            evaluate(&expr, &EvalContext::bindings(&bindings)),
            Err(DataError::UnboundVariable(_))
        ));

        let var = Expr::Variable { name: "u".into() };
        assert_eq!(
            evaluate(&var, &EvalContext::bindings(&bindings)),
            Ok(Value::from("U1"))
        );
    }

    #[test]
    fn test_join_condition() {
        let user = Arc::new(create_test_person());
        let mut bindings = Bindings::new();
        bindings.insert("u".into(), user);

        let cond = JoinCondition::new("u", "id", Operator::Eq, "o", "user_id");
        assert!(cond.test(&bindings, &Fact::new("O1", "Order").field("user_id", "U1")));
        assert!(!cond.test(&bindings, &Fact::new("O2", "Order").field("user_id", "U999")));
        assert!(!cond.test(&bindings, &Fact::new("O3", "Order")));

        let unbound = JoinCondition::new("x", "id", Operator::Eq, "o", "user_id");
        assert!(!unbound.test(&bindings, &Fact::new("O1", "Order").field("user_id", "U1")));
        assert_eq!(cond.to_string(), "u.id == o.user_id");
    }
}
