//! Static type checking of constraint trees.
//!
//! Infers the base type of every sub-expression against a variable scope and
//! the type registry, enforcing the operator compatibility matrix:
//!
//! | operators            | operands                          | result                     |
//! |----------------------|-----------------------------------|----------------------------|
//! | `==` `!=`            | identical base types              | boolean                    |
//! | `<` `<=` `>` `>=`    | identical integer, number, string | boolean                    |
//! | `+` `-` `*` `/` `%`  | integer or number                 | integer if both are and    |
//! |                      |                                   | not `/`, else number       |
//! | `CONTAINS` `MATCHES` | strings                           | boolean                    |
//! | `AND` `OR` `NOT`     | booleans                          | boolean                    |
//!
//! An integral literal facing a number operand is read as a number.

use std::collections::BTreeMap;

use crate::ast::{AggregateConstraint, AggregateFunction, Expr, LogicalOp, Operator};
use crate::error::{Position, ValidationError, ValidationErrorKind};
use crate::registry::TypeRegistry;
use crate::types::{BaseType, Value};

/// What a variable in scope stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeVar {
    /// A fact of the named type
    Fact(String),
    /// The result of an aggregate
    Aggregate(BaseType),
}

/// Variables visible to an expression.
pub type Scope = BTreeMap<String, ScopeVar>;

/// Result type of an aggregate function over a field of the given type.
pub fn aggregate_result_type(
    function: &AggregateFunction,
    field: Option<BaseType>,
) -> Option<BaseType> {
    match function {
        AggregateFunction::Count => Some(BaseType::Integer),
        AggregateFunction::Avg => Some(BaseType::Number),
        AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max => field,
        AggregateFunction::Unsupported(_) => None,
    }
}

/// Operator compatibility for two operand types.
///
/// Returns the result type, or the kind of failure.
pub fn compatibility(
    left: BaseType,
    right: BaseType,
    operator: &Operator,
) -> Result<BaseType, ValidationErrorKind> {
    match operator {
        Operator::Invalid(_) => Err(ValidationErrorKind::InvalidOperator),
        op if op.is_equality() => {
            if left == right {
                Ok(BaseType::Boolean)
            } else {
                Err(ValidationErrorKind::TypeMismatch)
            }
        }
        op if op.is_ordering() => {
            if left == right && left.is_orderable() {
                Ok(BaseType::Boolean)
            } else {
                Err(ValidationErrorKind::TypeMismatch)
            }
        }
        op if op.is_arithmetic() => {
            if !left.is_numeric() || !right.is_numeric() {
                Err(ValidationErrorKind::TypeMismatch)
            } else if left == BaseType::Integer
                && right == BaseType::Integer
                && *op != Operator::Div
            {
                Ok(BaseType::Integer)
            } else {
                Ok(BaseType::Number)
            }
        }
        _ => {
            if left == BaseType::String && right == BaseType::String {
                Ok(BaseType::Boolean)
            } else {
                Err(ValidationErrorKind::TypeMismatch)
            }
        }
    }
}

/// Type checker bound to a registry.
pub struct TypeChecker<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> TypeChecker<'a> {
    /// Create a checker over the given registry.
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Base type of `object.field`.
    pub fn field_type(
        &self,
        object: &str,
        field: &str,
        scope: &Scope,
    ) -> Result<BaseType, ValidationError> {
        match scope.get(object) {
            None => Err(ValidationError::new(
                ValidationErrorKind::Validation,
                format!("variable '{}' is not declared", object),
            )),
            Some(ScopeVar::Aggregate(base)) => Ok(*base),
            Some(ScopeVar::Fact(type_name)) => {
                if !self.registry.contains(type_name) {
                    return Err(ValidationError::new(
                        ValidationErrorKind::UnknownType,
                        format!("type '{}' is not declared", type_name),
                    ));
                }
                self.registry.field_type(type_name, field).ok_or_else(|| {
                    ValidationError::new(
                        ValidationErrorKind::FieldNotFound,
                        format!("type '{}' has no field '{}'", type_name, field),
                    )
                })
            }
        }
    }

    /// Type of a literal or reference, `None` when it cannot be known.
    pub fn value_type(&self, expr: &Expr, scope: &Scope) -> Option<BaseType> {
        match expr {
            Expr::Literal { value } => Some(value.base_type()),
            Expr::FieldAccess { object, field } => self.field_type(object, field, scope).ok(),
            Expr::Variable { name } => match scope.get(name) {
                Some(ScopeVar::Aggregate(base)) => Some(*base),
                _ => None,
            },
            _ => None,
        }
    }

    /// Infer the type of an expression.
    pub fn check(&self, expr: &Expr, scope: &Scope) -> Result<BaseType, ValidationError> {
        self.check_at(expr, scope, None)
    }

    /// Check that an expression is boolean.
    pub fn check_boolean(&self, expr: &Expr, scope: &Scope) -> Result<(), ValidationError> {
        let found = self.check(expr, scope)?;
        if found != BaseType::Boolean {
            return Err(ValidationError::new(
                ValidationErrorKind::TypeMismatch,
                format!("constraint '{}' is {}, expected boolean", expr, found),
            )
            .at(expr.position()));
        }
        Ok(())
    }

    fn check_at(
        &self,
        expr: &Expr,
        scope: &Scope,
        position: Option<Position>,
    ) -> Result<BaseType, ValidationError> {
        let position = expr.position().or(position);
        let result = match expr {
            Expr::Literal { value } => Ok(value.base_type()),
            Expr::FieldAccess { object, field } => self.field_type(object, field, scope),
            Expr::Variable { name } => match scope.get(name) {
                Some(ScopeVar::Aggregate(base)) => Ok(*base),
                Some(ScopeVar::Fact(type_name)) => Err(ValidationError::new(
                    ValidationErrorKind::TypeMismatch,
                    format!("variable '{}' is a {} fact, not a value", name, type_name),
                )),
                None => Err(ValidationError::new(
                    ValidationErrorKind::Validation,
                    format!("variable '{}' is not declared", name),
                )),
            },
            Expr::BinaryOperation {
                left,
                operator,
                right,
                ..
            } => {
                let mut l = self.check_at(left, scope, position)?;
                let mut r = self.check_at(right, scope, position)?;
                if is_integral_literal(left) && r == BaseType::Number {
                    l = BaseType::Number;
                }
                if is_integral_literal(right) && l == BaseType::Number {
                    r = BaseType::Number;
                }
                compatibility(l, r, operator).map_err(|kind| {
                    let message = match kind {
                        ValidationErrorKind::InvalidOperator => {
                            format!("operator '{}' is not supported", operator)
                        }
                        _ => format!(
                            "operator '{}' cannot combine {} and {} in '{}'",
                            operator, l, r, expr
                        ),
                    };
                    ValidationError::new(kind, message)
                })
            }
            Expr::LogicalExpr { left, operations } => {
                self.expect_boolean(left, scope, position)?;
                for operation in operations {
                    if let LogicalOp::Invalid(op) = &operation.op {
                        return Err(ValidationError::new(
                            ValidationErrorKind::InvalidOperator,
                            format!("logical operator '{}' is not supported", op),
                        )
                        .at(position));
                    }
                    self.expect_boolean(&operation.right, scope, position)?;
                }
                Ok(BaseType::Boolean)
            }
            Expr::NotConstraint { expression } => {
                self.expect_boolean(expression, scope, position)?;
                Ok(BaseType::Boolean)
            }
            Expr::ExistsConstraint {
                variable,
                condition,
            } => {
                let inner = self.extend_scope(scope, &variable.name, &variable.data_type)?;
                if let Some(condition) = condition {
                    self.expect_boolean(condition, &inner, position)?;
                }
                Ok(BaseType::Boolean)
            }
            Expr::AggregateConstraint(agg) => {
                self.check_aggregate(agg, scope, position)?;
                Ok(BaseType::Boolean)
            }
        };
        result.map_err(|e| e.at(position))
    }

    /// Check an aggregate and return its result type.
    pub fn check_aggregate(
        &self,
        agg: &AggregateConstraint,
        scope: &Scope,
        position: Option<Position>,
    ) -> Result<BaseType, ValidationError> {
        let inner = self.extend_scope(scope, &agg.variable.name, &agg.variable.data_type)?;

        let field_type = match (&agg.function, &agg.field) {
            (AggregateFunction::Count, _) => None,
            (_, Some(field)) => Some(self.field_type(&agg.variable.name, field, &inner)?),
            (function, None) => {
                return Err(ValidationError::new(
                    ValidationErrorKind::Validation,
                    format!("aggregate {} needs a field", function),
                )
                .at(position));
            }
        };
        match (&agg.function, field_type) {
            (AggregateFunction::Unsupported(name), _) => {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidOperator,
                    format!("aggregate function '{}' is not supported", name),
                )
                .at(position));
            }
            (AggregateFunction::Sum | AggregateFunction::Avg, Some(t)) if !t.is_numeric() => {
                return Err(ValidationError::new(
                    ValidationErrorKind::TypeMismatch,
                    format!("aggregate {} needs a numeric field, got {}", agg.function, t),
                )
                .at(position));
            }
            (AggregateFunction::Min | AggregateFunction::Max, Some(t)) if !t.is_orderable() => {
                return Err(ValidationError::new(
                    ValidationErrorKind::TypeMismatch,
                    format!("aggregate {} needs an ordered field, got {}", agg.function, t),
                )
                .at(position));
            }
            _ => {}
        }
        let result = aggregate_result_type(&agg.function, field_type).ok_or_else(|| {
            ValidationError::new(
                ValidationErrorKind::Validation,
                format!("aggregate {} has no result type", agg.function),
            )
        })?;

        if let Some(condition) = &agg.condition {
            self.expect_boolean(condition, &inner, position)?;
        }

        match (&agg.operator, &agg.value) {
            (Some(op), Some(value)) => {
                if !op.is_comparison() {
                    return Err(ValidationError::new(
                        ValidationErrorKind::InvalidOperator,
                        format!("aggregate threshold operator '{}' is not a comparison", op),
                    )
                    .at(position));
                }
                let mut threshold = self.check_at(value, scope, position)?;
                if is_integral_literal(value) && result == BaseType::Number {
                    threshold = BaseType::Number;
                }
                compatibility(result, threshold, op).map_err(|kind| {
                    ValidationError::new(
                        kind,
                        format!(
                            "aggregate {} result is {}, threshold is {}",
                            agg.function, result, threshold
                        ),
                    )
                    .at(position)
                })?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new(
                    ValidationErrorKind::Validation,
                    "aggregate threshold needs both an operator and a value",
                )
                .at(position));
            }
        }
        Ok(result)
    }

    fn expect_boolean(
        &self,
        expr: &Expr,
        scope: &Scope,
        position: Option<Position>,
    ) -> Result<(), ValidationError> {
        let found = self.check_at(expr, scope, position)?;
        if found != BaseType::Boolean {
            return Err(ValidationError::new(
                ValidationErrorKind::TypeMismatch,
                format!("'{}' is {}, expected boolean", expr, found),
            )
            .at(expr.position().or(position)));
        }
        Ok(())
    }

    fn extend_scope(
        &self,
        scope: &Scope,
        name: &str,
        type_name: &str,
    ) -> Result<Scope, ValidationError> {
        if !self.registry.contains(type_name) {
            return Err(ValidationError::new(
                ValidationErrorKind::UnknownType,
                format!("type '{}' is not declared", type_name),
            ));
        }
        if scope.contains_key(name) {
            return Err(ValidationError::new(
                ValidationErrorKind::Validation,
                format!("variable '{}' is already declared", name),
            ));
        }
        let mut inner = scope.clone();
        inner.insert(name.to_string(), ScopeVar::Fact(type_name.to_string()));
        Ok(inner)
    }
}

fn is_integral_literal(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal { value: Value::Integer(_) })
}
