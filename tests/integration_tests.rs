/// Integration tests for rete-xuples.
///
/// End-to-end scenarios: a program document is compiled, facts flow through
/// the network and the resulting xuples are consumed by agents.
use rete_xuples::prelude::*;
use rete_xuples::ProgramReport;
use serde_json::{Value as Json, json};
use std::sync::Arc;

// ============================================================================
// Helpers
// ============================================================================

fn field(object: &str, name: &str) -> Json {
    json!({ "type": "fieldAccess", "object": object, "field": name })
}

fn lit(value: Json) -> Json {
    json!({ "type": "literal", "value": value })
}

fn op(left: Json, operator: &str, right: Json) -> Json {
    json!({ "type": "binaryOperation", "operator": operator, "left": left, "right": right })
}

fn and(left: Json, right: Json) -> Json {
    json!({ "type": "logicalExpr", "left": left, "operations": [{ "op": "AND", "right": right }] })
}

fn var(name: &str, data_type: &str) -> Json {
    json!({ "name": name, "dataType": data_type })
}

fn rule(rule_id: &str, vars: Vec<Json>, constraints: Json, action: &str, args: Vec<Json>) -> Json {
    json!({
        "ruleId": rule_id,
        "set": { "variables": vars },
        "constraints": constraints,
        "action": { "job": { "name": action, "args": args } }
    })
}

fn compile(program: Json) -> ReteNetwork {
    let program = Program::from_json_str(&program.to_string()).unwrap();
    NetworkCompiler::new(EngineConfig::default())
        .compile(&program)
        .unwrap()
}

fn default_space(network: &ReteNetwork) -> Arc<XupleSpace> {
    network.xuples().unwrap().get_space("default").unwrap()
}

fn create_test_xuple(id: &str) -> Xuple {
    let fact = Arc::new(Fact::new(format!("f_{}", id), "task").field("n", id));
    Xuple::new(id, "", fact, Vec::new())
}

fn create_test_space(consumption: ConsumptionKind) -> XupleSpace {
    XupleSpace::new(
        "work",
        XupleSpaceConfig::from_kinds(SelectionKind::Fifo, consumption, RetentionKind::Unlimited, 0),
    )
    .unwrap()
}

// ============================================================================
// Scenario 1: alpha filter
// ============================================================================

#[test]
fn test_alpha_filter() {
    let network = compile(json!({
        "types": [{ "name": "Person", "fields": [{ "name": "age", "type": "integer" }] }],
        "expressions": [rule(
            "adults",
            vec![var("p", "Person")],
            op(field("p", "age"), ">=", lit(json!(18))),
            "notify",
            vec![field("p", "id")],
        )]
    }));

    network
        .assert_fact(Fact::new("U1", "Person").field("age", 25))
        .unwrap();
    network
        .assert_fact(Fact::new("U2", "Person").field("age", 12))
        .unwrap();

    let activations = network.activations();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].action, "notify");
    assert_eq!(activations[0].arguments, vec![Value::from("U1")]);

    let xuple = default_space(&network).retrieve("agent-a").unwrap();
    assert_eq!(xuple.fact.type_name, "notify");
    assert_eq!(xuple.triggering_facts.len(), 1);
    assert_eq!(xuple.triggering_facts[0].id, "U1");
}

// ============================================================================
// Scenario 2: two-way join
// ============================================================================

fn create_join_network() -> ReteNetwork {
    compile(json!({
        "types": [
            { "name": "User", "fields": [
                { "name": "id", "type": "string" }, { "name": "age", "type": "integer" }
            ]},
            { "name": "Order", "fields": [
                { "name": "user_id", "type": "string" }, { "name": "product_id", "type": "string" }
            ]}
        ],
        "expressions": [rule(
            "orders",
            vec![var("u", "User"), var("o", "Order")],
            and(
                op(field("u", "id"), "==", field("o", "user_id")),
                op(field("u", "age"), ">=", lit(json!(18))),
            ),
            "process",
            vec![],
        )]
    }))
}

#[test]
fn test_two_way_join() {
    let network = create_join_network();
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1").field("age", 25))
        .unwrap();
    network
        .assert_fact(Fact::new("O1", "Order").field("user_id", "U1").field("product_id", "P1"))
        .unwrap();
    network
        .assert_fact(Fact::new("O2", "Order").field("user_id", "U999").field("product_id", "P1"))
        .unwrap();

    let activations = network.activations();
    assert_eq!(activations.len(), 1);
    let ids: Vec<&str> = activations[0].facts.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["U1", "O1"]);
    assert_eq!(default_space(&network).count(), 1);
}

#[test]
fn test_join_order_independent() {
    let network = create_join_network();
    network
        .assert_fact(Fact::new("O1", "Order").field("user_id", "U1").field("product_id", "P1"))
        .unwrap();
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1").field("age", 25))
        .unwrap();
    assert_eq!(network.activations().len(), 1);
}

// ============================================================================
// Scenario 3: accumulate sum
// ============================================================================

#[test]
fn test_accumulate_sum_crosses_threshold_once() {
    let network = compile(json!({
        "types": [
            { "name": "Customer", "fields": [{ "name": "id", "type": "string" }] },
            { "name": "Order", "fields": [
                { "name": "customer_id", "type": "string" }, { "name": "amount", "type": "integer" }
            ]}
        ],
        "expressions": [rule(
            "big_spender",
            vec![var("c", "Customer")],
            json!({
                "type": "aggregateConstraint",
                "function": "sum",
                "variable": { "name": "o", "dataType": "Order" },
                "field": "amount",
                "condition": op(field("o", "customer_id"), "==", field("c", "id")),
                "operator": ">",
                "value": lit(json!(250))
            }),
            "flag",
            vec![field("c", "id")],
        )]
    }));

    network
        .assert_fact(Fact::new("C1", "Customer").field("id", "C1"))
        .unwrap();
    let order = |id: &str, amount: i64| {
        Fact::new(id, "Order")
            .field("customer_id", "C1")
            .field("amount", amount)
    };

    network.assert_fact(order("O1", 100)).unwrap();
    assert!(network.activations().is_empty());

    network.assert_fact(order("O2", 200)).unwrap();
    assert_eq!(network.activations().len(), 1);

    network.assert_fact(order("O3", 50)).unwrap();
    assert_eq!(network.activations().len(), 1);

    let space = default_space(&network);
    assert_eq!(space.count(), 1);
    let xuple = space.retrieve("auditor").unwrap();
    assert_eq!(xuple.fact.get("arg0"), Some(Value::from("C1")));
}

// ============================================================================
// Scenario 4: negation
// ============================================================================

#[test]
fn test_negation_revokes_and_restores() {
    let network = compile(json!({
        "types": [
            { "name": "User", "fields": [{ "name": "id", "type": "string" }] },
            { "name": "Ban", "fields": [{ "name": "user_id", "type": "string" }] }
        ],
        "expressions": [rule(
            "allow",
            vec![var("u", "User")],
            json!({
                "type": "notConstraint",
                "expression": {
                    "type": "existsConstraint",
                    "variable": { "name": "b", "dataType": "Ban" },
                    "condition": op(field("b", "user_id"), "==", field("u", "id"))
                }
            }),
            "allow",
            vec![field("u", "id")],
        )]
    }));
    let space = default_space_after_fire(&network);

    assert_eq!(network.activations().len(), 1);
    assert_eq!(space.count(), 1);

    network
        .assert_fact(Fact::new("B1", "Ban").field("user_id", "U1"))
        .unwrap();
    assert!(network.activations().is_empty());
    assert_eq!(space.count(), 0);

    network.retract_fact("B1").unwrap();
    assert_eq!(network.activations().len(), 1);
    assert_eq!(space.count(), 1);
}

fn default_space_after_fire(network: &ReteNetwork) -> Arc<XupleSpace> {
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1"))
        .unwrap();
    default_space(network)
}

// ============================================================================
// Scenario 4b: existence
// ============================================================================

fn create_exists_network() -> ReteNetwork {
    compile(json!({
        "types": [
            { "name": "Customer", "fields": [{ "name": "id", "type": "string" }] },
            { "name": "Order", "fields": [
                { "name": "customer_id", "type": "string" }, { "name": "status", "type": "string" }
            ]}
        ],
        "expressions": [rule(
            "has_pending",
            vec![var("c", "Customer")],
            json!({
                "type": "existsConstraint",
                "variable": { "name": "o", "dataType": "Order" },
                "condition": and(
                    op(field("o", "customer_id"), "==", field("c", "id")),
                    op(field("o", "status"), "==", lit(json!("pending")))
                )
            }),
            "chase",
            vec![field("c", "id")],
        )]
    }))
}

#[test]
fn test_exists_fires_once_per_customer() {
    let network = create_exists_network();
    let space = default_space(&network);
    let order = |id: &str, customer: &str, status: &str| {
        Fact::new(id, "Order")
            .field("customer_id", customer)
            .field("status", status)
    };

    // Witnesses may arrive before the customer.
    network.assert_fact(order("O1", "C1", "pending")).unwrap();
    network.assert_fact(order("O2", "C1", "shipped")).unwrap();
    network
        .assert_fact(Fact::new("C1", "Customer").field("id", "C1"))
        .unwrap();
    network
        .assert_fact(Fact::new("C2", "Customer").field("id", "C2"))
        .unwrap();
    assert_eq!(network.activations().len(), 1);

    network.assert_fact(order("O3", "C1", "pending")).unwrap();
    assert_eq!(network.activations().len(), 1, "second witness fires nothing");
    assert_eq!(space.count(), 1);

    network.retract_fact("O1").unwrap();
    assert_eq!(network.activations().len(), 1, "O3 still witnesses C1");

    network.retract_fact("O3").unwrap();
    assert!(network.activations().is_empty());
    assert_eq!(space.count(), 0);

    network.assert_fact(order("O4", "C2", "pending")).unwrap();
    let activations = network.activations();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].arguments, vec![Value::from("C2")]);

    let xuple = space.retrieve("collector").unwrap();
    assert_eq!(xuple.fact.get("arg0"), Some(Value::from("C2")));
    assert_eq!(xuple.triggering_facts.len(), 1);
}

// ============================================================================
// Scenario 5: FIFO + once
// ============================================================================

#[test]
fn test_fifo_once() {
    let space = create_test_space(ConsumptionKind::Once);
    for id in ["x1", "x2", "x3"] {
        space.insert(create_test_xuple(id)).unwrap();
    }

    assert_eq!(space.retrieve("A").unwrap().id, "x1");
    assert_eq!(space.retrieve("B").unwrap().id, "x2");
    assert_eq!(space.retrieve("A").unwrap().id, "x3");
    let err = space.retrieve("A").unwrap_err();
    assert!(matches!(err, XupleError::NoAvailableXuple(_)));
    assert_eq!(err.kind(), "no-available-xuple");
}

// ============================================================================
// Scenario 6: per-agent
// ============================================================================

#[test]
fn test_per_agent() {
    let space = create_test_space(ConsumptionKind::PerAgent);
    for id in ["x1", "x2", "x3"] {
        space.insert(create_test_xuple(id)).unwrap();
    }

    for agent in ["A", "B"] {
        let seen: Vec<String> = (0..3).map(|_| space.retrieve(agent).unwrap().id).collect();
        assert_eq!(seen, vec!["x1", "x2", "x3"]);
    }
    assert!(matches!(space.retrieve("A"), Err(XupleError::NoAvailableXuple(_))));
    assert!(matches!(space.retrieve("B"), Err(XupleError::NoAvailableXuple(_))));
    assert_eq!(space.count(), 3);
}

// ============================================================================
// Round-trips
// ============================================================================

#[test]
fn test_assert_retract_leaves_memories_empty() {
    let network = create_join_network();
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1").field("age", 25))
        .unwrap();
    network
        .assert_fact(Fact::new("O1", "Order").field("user_id", "U1").field("product_id", "P1"))
        .unwrap();
    network.retract_fact("O1").unwrap();
    network.retract_fact("U1").unwrap();

    let stats = network.stats();
    assert_eq!(stats.total_facts, 0);
    assert_eq!(stats.total_tokens, 0);
    assert!(network.activations().is_empty());
}

#[test]
fn test_cleanup_idempotent() {
    let space = create_test_space(ConsumptionKind::Once);
    space.insert(create_test_xuple("x1")).unwrap();
    space.insert(create_test_xuple("x2")).unwrap();
    space.retrieve("A").unwrap();

    assert_eq!(space.cleanup(), 1);
    assert_eq!(space.cleanup(), 0);
    assert_eq!(space.list_all().len(), 1);
}

#[test]
fn test_insert_consume_cleanup_empties() {
    let space = create_test_space(ConsumptionKind::Once);
    space.insert(create_test_xuple("x1")).unwrap();
    space.mark_consumed("x1", "A").unwrap();
    space.cleanup();
    assert!(space.list_all().is_empty());
}

// ============================================================================
// Program lifecycle
// ============================================================================

#[test]
fn test_incremental_program_and_declared_space() {
    let network = create_join_network();
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1").field("age", 40))
        .unwrap();

    let addition = Program::from_json_str(
        &json!({
            "xupleSpaces": [{ "name": "vip", "selection": "lifo", "consumption": "per_agent" }],
            "expressions": [{
                "ruleId": "vip",
                "set": { "variables": [var("u", "User")] },
                "constraints": op(field("u", "age"), ">", lit(json!(30))),
                "action": { "jobs": [{ "name": "greet", "args": [field("u", "id")] }] },
                "xupleSpace": "vip"
            }],
            "ruleRemovals": ["orders"]
        })
        .to_string(),
    )
    .unwrap();
    let report: ProgramReport = network.add_program(&addition).unwrap();
    assert_eq!(report.rules_added, vec!["vip".to_string()]);
    assert_eq!(report.rules_removed, vec!["orders".to_string()]);
    assert_eq!(report.spaces_created, vec!["vip".to_string()]);
    assert_eq!(network.rules(), vec!["vip".to_string()]);

    let vip = network.xuples().unwrap().get_space("vip").unwrap();
    assert_eq!(vip.info().consumption, "per-agent");
    assert_eq!(vip.retrieve("A").unwrap().fact.get("arg0"), Some(Value::from("U1")));
    network.validate().unwrap();
}

#[test]
fn test_validation_errors_reported() {
    let program = Program::from_json_str(
        &json!({
            "types": [{ "name": "Person", "fields": [{ "name": "age", "type": "integer" }] }],
            "expressions": [rule(
                "bad",
                vec![var("p", "Person")],
                op(field("p", "height"), ">", lit(json!(1))),
                "notify",
                vec![],
            )]
        })
        .to_string(),
    )
    .unwrap();
    let err = NetworkCompiler::default().compile(&program).unwrap_err();
    let report = err.validation_report().unwrap();
    assert_eq!(report.first().unwrap().kind.as_str(), "field-not-found");
}

#[test]
fn test_inline_facts_asserted() {
    let network = compile(json!({
        "types": [{ "name": "Person", "fields": [
            { "name": "name", "type": "string", "isPrimaryKey": true },
            { "name": "age", "type": "integer" }
        ]}],
        "expressions": [rule(
            "adults",
            vec![var("p", "Person")],
            op(field("p", "age"), ">=", lit(json!(18))),
            "notify",
            vec![field("p", "name")],
        )],
        "facts": [{ "typeName": "Person", "fields": { "name": "Ada", "age": 36 } }]
    }));
    assert!(network.fact("Person~Ada").is_some());
    assert_eq!(network.activations().len(), 1);
}

#[tokio::test]
async fn test_snapshot_replay() {
    let network = create_join_network();
    network
        .assert_fact(Fact::new("U1", "User").field("id", "U1").field("age", 25))
        .unwrap();
    network
        .assert_fact(Fact::new("O1", "Order").field("user_id", "U1").field("product_id", "P1"))
        .unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("network.json");
    rete_xuples::persistence::save(&network, &path).await.unwrap();
    assert!(rete_xuples::persistence::exists(&path).await);

    let snapshot = rete_xuples::persistence::load(&path).await.unwrap();
    let fresh = create_join_network();
    assert_eq!(snapshot.replay(&fresh).unwrap(), 2);
    assert_eq!(fresh.activations().len(), 1);
}
