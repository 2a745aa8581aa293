//! Structural and semantic validation of rule programs.
//!
//! Runs before any node is built. Every problem is collected into a
//! [`ValidationReport`] unless `fail_fast` is set, in which case only the
//! first one is kept.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::ast::{ActionDefinition, Expr, Expression, FactDeclaration, JobCall, Program};
use crate::checker::{Scope, ScopeVar, TypeChecker, compatibility};
use crate::config::ValidationConfig;
use crate::error::{ValidationError, ValidationErrorKind, ValidationReport};
use crate::registry::TypeRegistry;
use crate::types::{BaseType, Fact, Value};

/// Program validator.
///
/// Seeded with what a running network already knows (types, rules, actions)
/// so incremental programs are checked against it.
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
    registry: TypeRegistry,
    known_rules: BTreeSet<String>,
    known_actions: BTreeMap<String, ActionDefinition>,
}

impl Validator {
    /// Validator for a fresh network.
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            registry: TypeRegistry::new(),
            known_rules: BTreeSet::new(),
            known_actions: BTreeMap::new(),
        }
    }

    /// Start from already registered types.
    pub fn with_registry(mut self, registry: &TypeRegistry) -> Self {
        self.registry = registry.clone();
        self
    }

    /// Rule identifiers already compiled.
    pub fn with_rules<I: IntoIterator<Item = String>>(mut self, rules: I) -> Self {
        self.known_rules.extend(rules);
        self
    }

    /// Actions already declared.
    pub fn with_actions<'a, I>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = &'a ActionDefinition>,
    {
        for action in actions {
            self.known_actions.insert(action.name.clone(), action.clone());
        }
        self
    }

    /// Validate a program.
    ///
    /// On success returns the registry extended with the program's types.
    pub fn validate(mut self, program: &Program) -> Result<TypeRegistry, ValidationReport> {
        let mut errors = Vec::new();

        self.validate_types(program, &mut errors);
        self.validate_actions(program, &mut errors);
        validate_spaces(program, &mut errors);

        for removal in &program.rule_removals {
            self.known_rules.remove(removal.rule_id());
        }

        if program.expressions.len() > self.config.max_expressions {
            errors.push(ValidationError::new(
                ValidationErrorKind::Validation,
                format!(
                    "program has {} expressions, the limit is {}",
                    program.expressions.len(),
                    self.config.max_expressions
                ),
            ));
        }

        let mut seen_rules = BTreeSet::new();
        for expression in &program.expressions {
            if expression.rule_id.trim().is_empty() {
                let kind = ValidationErrorKind::Validation;
                errors.push(
                    ValidationError::new(kind, "rule identifier is empty").at(expression.position),
                );
            } else if !seen_rules.insert(expression.rule_id.clone())
                || self.known_rules.contains(&expression.rule_id)
            {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::Validation,
                        format!("rule '{}' is defined twice", expression.rule_id),
                    )
                    .at(expression.position),
                );
            }
            self.validate_expression(expression, &mut errors);
        }

        for fact in &program.facts {
            self.validate_fact(fact, &mut errors);
        }

        if errors.is_empty() {
            debug!(
                types = self.registry.len(),
                expressions = program.expressions.len(),
                "Program validated"
            );
            return Ok(self.registry);
        }
        if self.config.fail_fast {
            errors.truncate(1);
        }
        Err(ValidationReport::new(errors))
    }

    fn validate_types(&mut self, program: &Program, errors: &mut Vec<ValidationError>) {
        let mut seen = BTreeSet::new();
        for definition in &program.types {
            let at = definition.position;
            if definition.name.trim().is_empty() {
                let kind = ValidationErrorKind::EmptyTypeName;
                errors.push(ValidationError::new(kind, "type name is empty").at(at));
                continue;
            }
            if !seen.insert(definition.name.clone()) {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::DuplicateType,
                        format!("type '{}' is declared twice", definition.name),
                    )
                    .at(at),
                );
                continue;
            }
            if let Some(existing) = self.registry.get(&definition.name) {
                if existing.fields != definition.fields {
                    errors.push(
                        ValidationError::new(
                            ValidationErrorKind::DuplicateType,
                            format!(
                                "type '{}' is already declared with different fields",
                                definition.name
                            ),
                        )
                        .at(at),
                    );
                    continue;
                }
            }

            let mut fields = BTreeSet::new();
            let mut valid = true;
            for field in &definition.fields {
                if field.name.trim().is_empty() {
                    errors.push(
                        ValidationError::new(
                            ValidationErrorKind::EmptyFieldName,
                            format!("type '{}' has a field with an empty name", definition.name),
                        )
                        .at(at),
                    );
                    valid = false;
                } else if !fields.insert(field.name.as_str()) {
                    errors.push(
                        ValidationError::new(
                            ValidationErrorKind::DuplicateField,
                            format!(
                                "field '{}' is declared twice on type '{}'",
                                field.name, definition.name
                            ),
                        )
                        .at(at),
                    );
                    valid = false;
                }
                if BaseType::parse(&field.type_name).is_none() {
                    errors.push(
                        ValidationError::new(
                            ValidationErrorKind::InvalidFieldType,
                            format!(
                                "field '{}.{}' has type '{}', expected {}",
                                definition.name,
                                field.name,
                                field.type_name,
                                "string, integer, number or boolean"
                            ),
                        )
                        .at(at),
                    );
                    valid = false;
                }
            }
            if valid {
                self.registry.register(definition.clone());
            }
        }
    }

    fn validate_actions(&mut self, program: &Program, errors: &mut Vec<ValidationError>) {
        let mut seen = BTreeSet::new();
        for action in &program.actions {
            if action.name.trim().is_empty() {
                errors.push(ValidationError::new(
                    ValidationErrorKind::Validation,
                    "action name is empty",
                ));
                continue;
            }
            if !seen.insert(action.name.as_str()) {
                errors.push(ValidationError::new(
                    ValidationErrorKind::Validation,
                    format!("action '{}' is declared twice", action.name),
                ));
                continue;
            }
            for parameter in &action.parameters {
                if BaseType::parse(&parameter.type_name).is_none()
                    && !self.registry.contains(&parameter.type_name)
                {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::UnknownType,
                        format!(
                            "parameter '{}' of action '{}' has unknown type '{}'",
                            parameter.name, action.name, parameter.type_name
                        ),
                    ));
                }
            }
            self.known_actions.insert(action.name.clone(), action.clone());
        }
    }

    fn validate_expression(&self, expression: &Expression, errors: &mut Vec<ValidationError>) {
        let at = expression.position;
        let rule = &expression.rule_id;
        let variables = expression.variables();

        if variables.is_empty() {
            errors.push(
                ValidationError::new(
                    ValidationErrorKind::NoVariables,
                    format!("rule '{}' declares no variables", rule),
                )
                .at(at),
            );
        }

        let mut scope = Scope::new();
        let mut scope_ok = true;
        for variable in &variables {
            if !self.registry.contains(&variable.data_type) {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::UnknownType,
                        format!(
                            "rule '{}': variable '{}' has undeclared type '{}'",
                            rule, variable.name, variable.data_type
                        ),
                    )
                    .at(at),
                );
                scope_ok = false;
            } else if scope
                .insert(variable.name.clone(), ScopeVar::Fact(variable.data_type.clone()))
                .is_some()
            {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::Validation,
                        format!("rule '{}': variable '{}' is declared twice", rule, variable.name),
                    )
                    .at(at),
                );
            }
        }

        let jobs = expression.jobs();
        if jobs.is_empty() {
            errors.push(
                ValidationError::new(
                    ValidationErrorKind::MissingAction,
                    format!("rule '{}' has no action", rule),
                )
                .at(at),
            );
        }

        if !scope_ok {
            return;
        }

        let checker = TypeChecker::new(&self.registry);
        let mut arg_scope = scope.clone();

        if let Some(constraints) = &expression.constraints {
            if constraints.depth() > self.config.max_depth {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::Validation,
                        format!(
                            "rule '{}': constraint depth {} exceeds the limit of {}",
                            rule,
                            constraints.depth(),
                            self.config.max_depth
                        ),
                    )
                    .at(at),
                );
                return;
            }
            if let Err(e) = self.check_gate_placement(rule, constraints) {
                errors.push(e.at(at));
                return;
            }
            match checker.check_boolean(constraints, &scope) {
                Ok(()) => {
                    let mut index = 0;
                    for conjunct in constraints.conjuncts() {
                        if let Expr::AggregateConstraint(agg) = conjunct {
                            if let Ok(result) = checker.check_aggregate(agg, &scope, None) {
                                let binding = agg.binding_name(index);
                                arg_scope.insert(binding, ScopeVar::Aggregate(result));
                            }
                            index += 1;
                        }
                    }
                }
                Err(e) => errors.push(e.at(at)),
            }
        }

        for job in jobs {
            self.validate_job(rule, job, &checker, &arg_scope, errors);
        }
    }

    /// EXISTS and aggregates only make sense as top-level conjuncts.
    fn check_gate_placement(&self, rule: &str, constraints: &Expr) -> Result<(), ValidationError> {
        let mut total = 0;
        constraints.walk(&mut |e| {
            if matches!(e, Expr::ExistsConstraint { .. } | Expr::AggregateConstraint(_)) {
                total += 1;
            }
        });
        let top_level = constraints
            .conjuncts()
            .into_iter()
            .filter(|c| match c {
                Expr::ExistsConstraint { .. } | Expr::AggregateConstraint(_) => true,
                Expr::NotConstraint { expression } => {
                    matches!(expression.as_ref(), Expr::ExistsConstraint { .. })
                }
                _ => false,
            })
            .count();
        if total != top_level {
            return Err(ValidationError::new(
                ValidationErrorKind::Validation,
                format!(
                    "rule '{}': EXISTS and aggregates must be top-level conjuncts",
                    rule
                ),
            ));
        }
        Ok(())
    }

    fn validate_job(
        &self,
        rule: &str,
        job: &JobCall,
        checker: &TypeChecker<'_>,
        scope: &Scope,
        errors: &mut Vec<ValidationError>,
    ) {
        if job.name.trim().is_empty() {
            errors.push(ValidationError::new(
                ValidationErrorKind::MissingAction,
                format!("rule '{}' calls an action without a name", rule),
            ));
            return;
        }

        let definition = self.known_actions.get(&job.name);
        if let Some(definition) = definition {
            let max = definition.parameters.len();
            let min = definition.required_arity();
            if job.args.len() < min || job.args.len() > max {
                errors.push(ValidationError::new(
                    ValidationErrorKind::Validation,
                    format!(
                        "rule '{}': action '{}' takes {} to {} arguments, got {}",
                        rule,
                        job.name,
                        min,
                        max,
                        job.args.len()
                    ),
                ));
                return;
            }
        }

        for (i, arg) in job.args.iter().enumerate() {
            let parameter = definition.and_then(|d| d.parameters.get(i));

            // A bare fact variable passes the fact itself.
            if let Expr::Variable { name } = arg {
                if let Some(ScopeVar::Fact(type_name)) = scope.get(name) {
                    if let Some(p) = parameter {
                        if &p.type_name != type_name && p.type_name != "string" {
                            errors.push(ValidationError::new(
                                ValidationErrorKind::TypeMismatch,
                                format!(
                                    "rule '{}': argument {} of '{}' is a {} fact, expected {}",
                                    rule, i, job.name, type_name, p.type_name
                                ),
                            ));
                        }
                    }
                    continue;
                }
            }

            let found = match checker.check(arg, scope) {
                Ok(found) => found,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let Some(parameter) = parameter else {
                continue;
            };
            let Some(expected) = BaseType::parse(&parameter.type_name) else {
                errors.push(ValidationError::new(
                    ValidationErrorKind::TypeMismatch,
                    format!(
                        "rule '{}': argument {} of '{}' must be a {} fact",
                        rule, i, job.name, parameter.type_name
                    ),
                ));
                continue;
            };
            let widened = found == BaseType::Integer && expected == BaseType::Number;
            if !widened && compatibility(found, expected, &crate::ast::Operator::Eq).is_err() {
                errors.push(ValidationError::new(
                    ValidationErrorKind::TypeMismatch,
                    format!(
                        "rule '{}': argument {} of '{}' is {}, expected {}",
                        rule, i, job.name, found, expected
                    ),
                ));
            }
        }
    }

    fn validate_fact(&self, declaration: &FactDeclaration, errors: &mut Vec<ValidationError>) {
        let at = declaration.position;
        let Some(definition) = self.registry.get(&declaration.type_name) else {
            errors.push(
                ValidationError::new(
                    ValidationErrorKind::UnknownType,
                    format!("fact of undeclared type '{}'", declaration.type_name),
                )
                .at(at),
            );
            return;
        };
        let fields = declaration.fields.to_map();
        for name in fields.keys() {
            if definition.field(name).is_none() && name != "id" {
                errors.push(
                    ValidationError::new(
                        ValidationErrorKind::FieldNotFound,
                        format!("type '{}' has no field '{}'", declaration.type_name, name),
                    )
                    .at(at),
                );
            }
        }
        let sample = Fact::with_fields(
            declaration.id.clone().unwrap_or_else(|| "inline".to_string()),
            declaration.type_name.clone(),
            fields,
        );
        if let Err(e) = self.registry.conform(&sample) {
            let kind = ValidationErrorKind::TypeMismatch;
            errors.push(ValidationError::new(kind, e.to_string()).at(at));
        }
    }
}

fn validate_spaces(program: &Program, errors: &mut Vec<ValidationError>) {
    let mut seen = BTreeSet::new();
    for space in &program.xuple_spaces {
        if space.name.trim().is_empty() {
            errors.push(ValidationError::new(
                ValidationErrorKind::Validation,
                "xuple-space name is empty",
            ));
        } else if !seen.insert(space.name.as_str()) {
            errors.push(ValidationError::new(
                ValidationErrorKind::Validation,
                format!("xuple-space '{}' is declared twice", space.name),
            ));
        }
    }
}

/// Value of an action parameter default, if declared.
pub fn parameter_default(definition: Option<&ActionDefinition>, index: usize) -> Option<Value> {
    definition?
        .parameters
        .get(index)
        .and_then(|p| p.default_value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        Action, ActionParameter, AggregateConstraint, AggregateFunction, FieldDefinition, Operator,
        TypeDefinition, TypedVariable, VariableSet,
    };

    fn create_test_program() -> Program {
        Program {
            types: vec![
                TypeDefinition::new("Person", &[("id", "string"), ("age", "integer")]),
                TypeDefinition::new("Order", &[("owner", "string"), ("amount", "number")]),
            ],
            expressions: vec![create_rule(
                "adults",
                &[("p", "Person")],
                Some(Expr::binary(Expr::field("p", "age"), Operator::Ge, Expr::literal(18))),
                Some(Action::call("notify", vec![Expr::field("p", "id")])),
            )],
            ..Program::default()
        }
    }

    fn create_rule(
        id: &str,
        vars: &[(&str, &str)],
        constraints: Option<Expr>,
        action: Option<Action>,
    ) -> Expression {
        Expression {
            rule_id: id.into(),
            set: VariableSet {
                variables: vars.iter().map(|(n, t)| TypedVariable::new(*n, *t)).collect(),
            },
            patterns: vec![],
            constraints,
            action,
            xuple_space: None,
            position: None,
        }
    }

    fn validate(program: &Program) -> Result<TypeRegistry, ValidationReport> {
        Validator::new(ValidationConfig::default()).validate(program)
    }

    #[test]
    fn test_valid_program() {
        let registry = validate(&create_test_program()).unwrap();
        assert!(registry.contains("Person"));
        assert!(registry.contains("Order"));
    }

    #[test]
    fn test_type_errors() {
        let mut program = create_test_program();
        program.types.push(TypeDefinition::new("", &[]));
        program.types.push(TypeDefinition::new("Person", &[("x", "string")]));
        program.types.push(TypeDefinition {
            name: "Broken".into(),
            fields: vec![
                FieldDefinition::new("a", "string"),
                FieldDefinition::new("a", "string"),
                FieldDefinition::new("", "string"),
                FieldDefinition::new("b", "decimal"),
            ],
            position: None,
        });
        let report = validate(&program).unwrap_err();
        assert!(report.has_kind(ValidationErrorKind::EmptyTypeName));
        assert!(report.has_kind(ValidationErrorKind::DuplicateType));
        assert!(report.has_kind(ValidationErrorKind::DuplicateField));
        assert!(report.has_kind(ValidationErrorKind::EmptyFieldName));
        assert!(report.has_kind(ValidationErrorKind::InvalidFieldType));
    }

    #[test]
    fn test_fail_fast_keeps_first_error() {
        let mut program = create_test_program();
        program.types.push(TypeDefinition::new("", &[]));
        program.expressions.push(create_rule("empty", &[], None, None));
        let config = ValidationConfig {
            fail_fast: true,
            ..ValidationConfig::default()
        };
        let report = Validator::new(config).validate(&program).unwrap_err();
        assert_eq!(report.len(), 1);
        assert_eq!(report.errors()[0].kind, ValidationErrorKind::EmptyTypeName);

        let report = validate(&program).unwrap_err();
        assert!(report.len() >= 3);
        assert!(report.has_kind(ValidationErrorKind::NoVariables));
        assert!(report.has_kind(ValidationErrorKind::MissingAction));
    }

    #[test]
    fn test_expression_errors() {
        let mut program = create_test_program();
        program.expressions.push(create_rule(
            "ghosts",
            &[("g", "Ghost")],
            None,
            Some(Action::call("haunt", vec![])),
        ));
        program.expressions.push(create_rule(
            "mismatch",
            &[("p", "Person")],
            Some(Expr::binary(Expr::field("p", "age"), Operator::Eq, Expr::literal("old"))),
            Some(Action::call("x", vec![])),
        ));
        program.expressions.push(create_rule(
            "bad_op",
            &[("p", "Person")],
            Some(Expr::binary(
                Expr::field("p", "age"),
                Operator::Invalid("<=>".into()),
                Expr::literal(1),
            )),
            Some(Action::call("x", vec![])),
        ));
        program.expressions.push(create_rule(
            "adults",
            &[("p", "Person")],
            None,
            Some(Action::call("x", vec![])),
        ));
        let report = validate(&program).unwrap_err();
        assert!(report.has_kind(ValidationErrorKind::UnknownType));
        assert!(report.has_kind(ValidationErrorKind::TypeMismatch));
        assert!(report.has_kind(ValidationErrorKind::InvalidOperator));
        assert!(report.errors().iter().any(|e| e.message.contains("defined twice")));
    }

    #[test]
    fn test_limits() {
        let mut program = create_test_program();
        let mut deep = Expr::field("p", "age");
        for _ in 0..25 {
            deep = Expr::binary(deep, Operator::Add, Expr::literal(1));
        }
        program.expressions.push(create_rule(
            "deep",
            &[("p", "Person")],
            Some(Expr::binary(deep, Operator::Gt, Expr::literal(0))),
            Some(Action::call("x", vec![])),
        ));
        let report = validate(&program).unwrap_err();
        assert!(report.errors()[0].message.contains("depth"));

        let config = ValidationConfig {
            max_expressions: 0,
            ..ValidationConfig::default()
        };
        let report = Validator::new(config)
            .validate(&create_test_program())
            .unwrap_err();
        assert!(report.errors()[0].message.contains("limit"));
    }

    #[test]
    fn test_action_signature_checks() {
        let mut program = create_test_program();
        program.actions.push(ActionDefinition {
            name: "notify".into(),
            parameters: vec![
                ActionParameter {
                    name: "who".into(),
                    type_name: "string".into(),
                    optional: false,
                    default_value: None,
                },
                ActionParameter {
                    name: "priority".into(),
                    type_name: "integer".into(),
                    optional: false,
                    default_value: Some(Value::Integer(1)),
                },
            ],
        });
        assert!(validate(&program).is_ok());

        program.expressions[0].action = Some(Action::call("notify", vec![Expr::field("p", "age")]));
        let report = validate(&program).unwrap_err();
        assert!(report.has_kind(ValidationErrorKind::TypeMismatch));

        program.expressions[0].action = Some(Action::call("notify", vec![]));
        let report = validate(&program).unwrap_err();
        assert!(report.errors()[0].message.contains("arguments"));
    }

    #[test]
    fn test_aggregate_alias_only_in_actions() {
        let mut program = create_test_program();
        let agg = AggregateConstraint {
            function: AggregateFunction::Sum,
            variable: TypedVariable::new("o", "Order"),
            field: Some("amount".into()),
            condition: Some(Box::new(Expr::binary(
                Expr::field("o", "owner"),
                Operator::Eq,
                Expr::field("p", "id"),
            ))),
            operator: Some(Operator::Gt),
            value: Some(Box::new(Expr::literal(250))),
            alias: Some("total".into()),
        };
        program.expressions = vec![create_rule(
            "big_spender",
            &[("p", "Person")],
            Some(Expr::AggregateConstraint(agg.clone())),
            Some(Action::call(
                "flag",
                vec![Expr::field("p", "id"), Expr::Variable { name: "total".into() }],
            )),
        )];
        assert!(validate(&program).is_ok());

        program.expressions[0].constraints = Some(Expr::and(vec![
            Expr::AggregateConstraint(agg),
            Expr::binary(Expr::Variable { name: "total".into() }, Operator::Gt, Expr::literal(1.0)),
        ]));
        assert!(validate(&program).is_err());
    }

    #[test]
    fn test_nested_exists_rejected() {
        let mut program = create_test_program();
        let exists = Expr::exists(TypedVariable::new("o", "Order"), None);
        program.expressions[0].constraints = Some(Expr::LogicalExpr {
            left: Box::new(exists),
            operations: vec![crate::ast::LogicalOperation {
                op: crate::ast::LogicalOp::Or,
                right: Expr::literal(true),
            }],
        });
        let report = validate(&program).unwrap_err();
        assert!(report.errors()[0].message.contains("top-level"));
    }

    #[test]
    fn test_inline_facts() {
        let mut program = create_test_program();
        program.facts.push(FactDeclaration {
            type_name: "Person".into(),
            id: None,
            fields: crate::ast::FactFields::Map(
                [("id".to_string(), Value::from("U1")), ("age".to_string(), Value::from("old"))]
                    .into_iter()
                    .collect(),
            ),
            position: None,
        });
        program.facts.push(FactDeclaration {
            type_name: "Nope".into(),
            id: None,
            fields: Default::default(),
            position: None,
        });
        let report = validate(&program).unwrap_err();
        assert!(report.has_kind(ValidationErrorKind::TypeMismatch));
        assert!(report.has_kind(ValidationErrorKind::UnknownType));
    }
}
