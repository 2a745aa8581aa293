//! Aggregate functions over sets of facts.

use std::cmp::Ordering;

use crate::ast::AggregateFunction;
use crate::error::DataError;
use crate::types::{Fact, Value};

/// Type name of the synthetic facts carrying aggregate results.
pub const AGGREGATE_TYPE: &str = "_aggregate";

/// Compute an aggregate over the facts.
///
/// - `count` ignores the field.
/// - `sum` stays integral while every input is an integer; empty is `0`.
/// - `avg` is always a number; empty is `0`, never NaN.
/// - `min` / `max` order strings lexicographically and numbers numerically;
///   empty input is [`DataError::AggregateEmpty`].
///
/// Facts lacking the field are skipped.
pub fn compute_aggregate(
    function: &AggregateFunction,
    field: Option<&str>,
    facts: &[&Fact],
) -> Result<Value, DataError> {
    if let AggregateFunction::Unsupported(name) = function {
        return Err(DataError::UnsupportedAggregate(name.clone()));
    }
    if *function == AggregateFunction::Count {
        return Ok(Value::Integer(facts.len() as i64));
    }

    let field = field.ok_or_else(|| {
        DataError::UnsupportedAggregate(format!("{} without a field", function))
    })?;
    let values: Vec<Value> = facts.iter().filter_map(|f| f.get(field)).collect();

    match function {
        AggregateFunction::Sum => sum(&values),
        AggregateFunction::Avg => {
            if values.is_empty() {
                return Ok(Value::Number(0.0));
            }
            let total = sum(&values)?
                .as_f64()
                .ok_or_else(|| DataError::TypeMismatch("sum is not numeric".into()))?;
            Ok(Value::Number(total / values.len() as f64))
        }
        AggregateFunction::Min => extreme(&values, Ordering::Less),
        AggregateFunction::Max => extreme(&values, Ordering::Greater),
        AggregateFunction::Count | AggregateFunction::Unsupported(_) => {
            Err(DataError::UnsupportedAggregate(function.to_string()))
        }
    }
}

fn sum(values: &[Value]) -> Result<Value, DataError> {
    let mut integral: Option<i64> = Some(0);
    let mut floating = 0.0;
    for value in values {
        match value {
            Value::Integer(i) => {
                integral = match integral {
                    Some(acc) => Some(acc.checked_add(*i).ok_or(DataError::Overflow)?),
                    None => None,
                };
                floating += *i as f64;
            }
            Value::Number(n) => {
                integral = None;
                floating += n;
            }
            other => {
                return Err(DataError::TypeMismatch(format!(
                    "cannot sum {} values",
                    other.base_type()
                )));
            }
        }
    }
    Ok(match integral {
        Some(i) => Value::Integer(i),
        None => Value::Number(floating),
    })
}

fn extreme(values: &[Value], wanted: Ordering) -> Result<Value, DataError> {
    let mut iter = values.iter();
    let mut best = iter.next().ok_or(DataError::AggregateEmpty)?;
    if matches!(best, Value::Boolean(_)) {
        return Err(DataError::TypeMismatch("booleans are not ordered".into()));
    }
    for value in iter {
        let ordering = value.compare(best).ok_or_else(|| {
            DataError::TypeMismatch(format!(
                "cannot order {} against {}",
                value.base_type(),
                best.base_type()
            ))
        })?;
        if ordering == wanted {
            best = value;
        }
    }
    Ok(best.clone())
}

/// Synthetic fact binding an aggregate result into a token.
///
/// Fields: `value` (the result) and `function`.
pub fn aggregate_fact(
    node_id: &str,
    token_id: &str,
    function: &AggregateFunction,
    value: Value,
) -> Fact {
    Fact::new(format!("{}:{}:agg", node_id, token_id), AGGREGATE_TYPE)
        .field("value", value)
        .field("function", function.to_string())
}
