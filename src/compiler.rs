//! Network compiler.
//!
//! Turns a validated [`Program`] into nodes. Per rule:
//!
//! 1. every single-variable conjunct becomes a condition of that variable's
//!    alpha node;
//! 2. the variables are joined left to right, each multi-variable conjunct
//!    landing on the first join where all its variables are bound (simple
//!    field comparisons become join conditions, the rest residual filters);
//! 3. `EXISTS`, `NOT EXISTS` and aggregate conjuncts are appended as gates,
//!    fed on their right input straight from the quantified type's node;
//! 4. a terminal closes the chain.
//!
//! Type nodes are shared by every rule. Alpha nodes are shared by rules
//! testing the same type, variable and conditions; joins are shared by rules
//! with the same leading joins. Gates and terminals belong to their rule.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{ActionDefinition, Expr, Expression, Program};
use crate::builder::{BetaNetworkBuilder, ChainEnd, JoinSpec, MultiJoinPattern};
use crate::condition::JoinCondition;
use crate::config::EngineConfig;
use crate::error::{ReteError, ReteResult};
use crate::graph::{NodeGraph, ROOT_ID, shared_node_id};
use crate::network::ReteNetwork;
use crate::nodes::{
    AccumulateSpec, ActionTemplate, AlphaNode, Child, GateSpec, NodeId, ReteNode, TerminalNode,
    TypeNode,
};
use crate::registry::TypeRegistry;

/// Builds networks from programs.
#[derive(Debug, Clone, Default)]
pub struct NetworkCompiler {
    config: EngineConfig,
}

/// Where one conjunct ends up.
enum Placement<'a> {
    Alpha(String, &'a Expr),
    Beta(&'a Expr),
    Gate(&'a Expr),
}

impl NetworkCompiler {
    /// Compiler using `config` for validation limits and default spaces.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// The configuration networks are built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and compile a program into a fresh network.
    ///
    /// Rule results go to the network's own xuple manager.
    pub fn compile(&self, program: &Program) -> ReteResult<ReteNetwork> {
        let network = ReteNetwork::new(self.config.clone());
        network.add_program(program)?;
        Ok(network)
    }

    /// Create type nodes for the types `graph` does not know yet.
    ///
    /// Returns the identifiers of the new type nodes.
    pub fn add_types(
        &self,
        graph: &mut NodeGraph,
        registry: &TypeRegistry,
    ) -> ReteResult<Vec<NodeId>> {
        let mut created = Vec::new();
        for definition in registry.definitions() {
            if graph.type_node(&definition.name).is_some() {
                continue;
            }
            let node = TypeNode::new(definition.clone());
            let id = node.id().to_string();
            graph.add_node(ReteNode::Type(node), None)?;
            graph.connect(ROOT_ID, Child::left(&id))?;
            created.push(id);
        }
        Ok(created)
    }

    /// Compile every expression of a program into `graph`.
    ///
    /// Returns the identifiers of the compiled rules.
    pub fn add_rules(
        &self,
        graph: &mut NodeGraph,
        program: &Program,
        actions: &BTreeMap<String, ActionDefinition>,
    ) -> ReteResult<Vec<String>> {
        let mut rules = Vec::with_capacity(program.expressions.len());
        for expression in &program.expressions {
            self.compile_expression(graph, expression, actions)?;
            rules.push(expression.rule_id.clone());
        }
        Ok(rules)
    }

    fn type_input(graph: &NodeGraph, type_name: &str) -> ReteResult<NodeId> {
        graph
            .type_node(type_name)
            .map(|n| n.id().to_string())
            .ok_or_else(|| ReteError::Invariant(format!("type '{}' has no type node", type_name)))
    }

    fn place<'a>(
        conjunct: &'a Expr,
        first: &str,
        declared: &BTreeSet<&str>,
    ) -> ReteResult<Placement<'a>> {
        match conjunct {
            Expr::ExistsConstraint { .. } | Expr::AggregateConstraint(_) => {
                return Ok(Placement::Gate(conjunct));
            }
            Expr::NotConstraint { expression }
                if matches!(expression.as_ref(), Expr::ExistsConstraint { .. }) =>
            {
                return Ok(Placement::Gate(conjunct));
            }
            _ => {}
        }
        let free = conjunct.free_variables();
        if let Some(unknown) = free.iter().find(|v| !declared.contains(v.as_str())) {
            return Err(ReteError::Invariant(format!(
                "condition '{}' uses undeclared '{}'",
                conjunct, unknown
            )));
        }
        let mut vars = free.into_iter();
        match (vars.next(), vars.next()) {
            (None, _) => Ok(Placement::Alpha(first.to_string(), conjunct)),
            (Some(only), None) => Ok(Placement::Alpha(only, conjunct)),
            _ => Ok(Placement::Beta(conjunct)),
        }
    }

    /// `left.f op right.g` with one side on the joined variable.
    fn as_join_condition(
        expr: &Expr,
        right_var: &str,
        left_scope: &[String],
    ) -> Option<JoinCondition> {
        let Expr::BinaryOperation {
            left,
            operator,
            right,
            ..
        } = expr
        else {
            return None;
        };
        if !operator.is_comparison() {
            return None;
        }
        let (
            Expr::FieldAccess {
                object: lo,
                field: lf,
            },
            Expr::FieldAccess {
                object: ro,
                field: rf,
            },
        ) = (left.as_ref(), right.as_ref())
        else {
            return None;
        };
        let bound = |v: &String| left_scope.contains(v);
        if ro == right_var && bound(lo) {
            Some(JoinCondition::new(lo, lf, operator.clone(), ro, rf))
        } else if lo == right_var && bound(ro) {
            Some(JoinCondition::new(ro, rf, operator.flipped(), lo, lf))
        } else {
            None
        }
    }

    fn compile_expression(
        &self,
        graph: &mut NodeGraph,
        expression: &Expression,
        actions: &BTreeMap<String, ActionDefinition>,
    ) -> ReteResult<()> {
        let rule = expression.rule_id.as_str();
        let variables = expression.variables();
        let Some(first) = variables.first() else {
            return Err(ReteError::Invariant(format!("rule '{}' declares no variables", rule)));
        };
        let declared: BTreeSet<&str> = variables.iter().map(|v| v.name.as_str()).collect();

        let mut alpha: BTreeMap<String, Vec<Expr>> = BTreeMap::new();
        let mut beta: Vec<&Expr> = Vec::new();
        let mut gates: Vec<&Expr> = Vec::new();
        let conjuncts = expression
            .constraints
            .as_ref()
            .map(Expr::conjuncts)
            .unwrap_or_default();
        for conjunct in conjuncts {
            match Self::place(conjunct, &first.name, &declared)? {
                Placement::Alpha(var, expr) => alpha.entry(var).or_default().push(expr.clone()),
                Placement::Beta(expr) => beta.push(expr),
                Placement::Gate(expr) => gates.push(expr),
            }
        }

        // One alpha node per variable, shared with identical ones.
        let mut alpha_ids = Vec::with_capacity(variables.len());
        for variable in &variables {
            let conditions = alpha.remove(&variable.name).unwrap_or_default();
            let id = shared_node_id(
                "alpha",
                &(&variable.data_type, &variable.name, &conditions),
            )?;
            let input = Self::type_input(graph, &variable.data_type)?;
            let node = AlphaNode::new(id.clone(), variable.name.clone(), conditions);
            graph.add_shared(ReteNode::Alpha(node), rule)?;
            graph.connect(&input, Child::left(&id))?;
            alpha_ids.push(id);
        }

        // Join specifications, left to right.
        let mut placed = vec![false; beta.len()];
        let mut joins = Vec::new();
        let mut scope = vec![first.name.clone()];
        for (index, variable) in variables.iter().enumerate().skip(1) {
            let mut conditions = Vec::new();
            let mut filters = Vec::new();
            for (i, expr) in beta.iter().enumerate() {
                if placed[i] {
                    continue;
                }
                let free = expr.free_variables();
                let ready = free.iter().all(|v| *v == variable.name || scope.contains(v));
                if !ready {
                    continue;
                }
                placed[i] = true;
                match Self::as_join_condition(expr, &variable.name, &scope) {
                    Some(condition) => conditions.push(condition),
                    None => filters.push((*expr).clone()),
                }
            }
            joins.push(JoinSpec {
                left_type: variables[index - 1].data_type.clone(),
                right_type: variable.data_type.clone(),
                right_var: variable.name.clone(),
                conditions,
                filters,
                node_id: None,
                right_input: alpha_ids[index].clone(),
            });
            scope.push(variable.name.clone());
        }
        if let Some(i) = placed.iter().position(|p| !p) {
            return Err(ReteError::Invariant(format!(
                "rule '{}': condition '{}' could not be placed",
                rule, beta[i]
            )));
        }

        let jobs = expression.jobs();
        let action = jobs.first().map(|j| j.name.clone()).unwrap_or_default();
        let pattern = MultiJoinPattern {
            pattern_id: rule.to_string(),
            left_input: alpha_ids[0].clone(),
            left_scope: vec![first.name.clone()],
            joins,
            action,
            shared: true,
        };

        let mut builder = BetaNetworkBuilder::new(graph);
        let mut end: ChainEnd = builder.build_multi_join(&pattern)?;

        let (mut nots, mut exists, mut aggregates) = (0, 0, 0);
        for gate in gates {
            end = match gate {
                Expr::ExistsConstraint { variable, condition } => {
                    let id = format!("{}_exists_{}", rule, exists);
                    exists += 1;
                    let input = Self::type_input(builder.graph(), &variable.data_type)?;
                    let spec = GateSpec::new(variable.name.clone(), condition.as_deref().cloned());
                    builder.add_exists(rule, id, &end, spec, &input)?
                }
                Expr::NotConstraint { expression } => {
                    let Expr::ExistsConstraint { variable, condition } = expression.as_ref() else {
                        continue;
                    };
                    let id = format!("{}_not_{}", rule, nots);
                    nots += 1;
                    let input = Self::type_input(builder.graph(), &variable.data_type)?;
                    let spec = GateSpec::new(variable.name.clone(), condition.as_deref().cloned());
                    builder.add_not(rule, id, &end, spec, &input)?
                }
                Expr::AggregateConstraint(agg) => {
                    let id = format!("{}_accumulate_{}", rule, aggregates);
                    let spec = AccumulateSpec {
                        function: agg.function.clone(),
                        variable: agg.variable.name.clone(),
                        field: agg.field.clone(),
                        condition: agg.condition.as_deref().cloned(),
                        operator: agg.operator.clone(),
                        threshold: agg.value.as_deref().cloned(),
                        alias: agg.binding_name(aggregates),
                    };
                    aggregates += 1;
                    let input = Self::type_input(builder.graph(), &agg.variable.data_type)?;
                    builder.add_accumulate(rule, id, &end, spec, &input)?
                }
                _ => continue,
            };
        }
        drop(builder);

        let templates = jobs
            .iter()
            .map(|job| {
                ActionTemplate::new(job.name.clone(), job.args.clone())
                    .with_definition(actions.get(&job.name).cloned())
            })
            .collect();
        let space = expression
            .xuple_space
            .clone()
            .unwrap_or_else(|| self.config.xuples.default_space.clone());
        let terminal_id = format!("{}_terminal", rule);
        let terminal =
            TerminalNode::new(terminal_id.clone(), rule, end.scope.clone(), templates, space);
        graph.add_node(ReteNode::Terminal(terminal), Some(rule))?;
        graph.connect(&end.node_id, Child::left(&terminal_id))?;

        tracing::debug!(
            "Compiled rule {} into {} nodes",
            rule,
            graph.rule_nodes(rule).map_or(0, <[NodeId]>::len)
        );
        Ok(())
    }
}
