//! End-to-end test for running sub-flows outside a conversation.

use csm_core::{parse_sub_flow_call, AgentOptions, AggregationStrategy, ConversationalAgent, SubFlowManager};
use csm_definition::{FlowDefinition, MachineDefinition};
use csm_test_utils::coffee_shop_machine;
use pretty_assertions::assert_eq;
use serde_json::json;

fn flow(flow_id: &str) -> FlowDefinition {
    match coffee_shop_machine() {
        MachineDefinition::Multi(multi) => multi.flows[flow_id].clone(),
        MachineDefinition::Single(_) => panic!("coffee shop is a multi-flow machine"),
    }
}

fn manager() -> SubFlowManager {
    let mut manager = SubFlowManager::new();
    manager.register_sub_flow(flow("OrderCoffee")).unwrap();
    manager.register_sub_flow(flow("Pastry")).unwrap();
    manager
}

#[tokio::test]
async fn test_execute_and_aggregate() {
    let manager = manager();
    let call = parse_sub_flow_call("call:OrderCoffee:append:orders").unwrap();

    let result = manager.execute_sub_flow(&call, &["small", "regular", "yes"]).await.unwrap();
    assert!(result.completed);
    let order = result.return_value.unwrap();
    assert_eq!(order, json!({ "size": "small", "milk": "regular" }));

    let context = json!({ "orders": [{ "size": "large" }] }).as_object().cloned().unwrap();
    let context = manager.apply_aggregation(&context, &call.return_var, order, call.aggregation);
    assert_eq!(context["orders"], json!([{ "size": "large" }, { "size": "small", "milk": "regular" }]));
}

#[tokio::test]
async fn test_pastry_merge_strategy() {
    let manager = manager();
    let call = parse_sub_flow_call("call:Pastry:merge:basket").unwrap();
    assert_eq!(call.aggregation, AggregationStrategy::Merge);

    let result = manager.execute_sub_flow(&call, &["croissant"]).await.unwrap();
    let context = json!({ "basket": { "drink": "latte" } }).as_object().cloned().unwrap();
    let context = manager.apply_aggregation(&context, &call.return_var, result.return_value.unwrap(), call.aggregation);
    assert_eq!(context["basket"], json!({ "drink": "latte", "item": "croissant" }));
}

#[tokio::test]
async fn test_installed_sub_flows_serve_call_targets() {
    let host = FlowDefinition::new("Kiosk", "Idle").with_state(
        "Idle",
        csm_definition::StateDefinition::new()
            .with_transition(csm_definition::TransitionDefinition::to("call:Pastry:overwrite:treat").on("treat me")),
    );

    let mut agent = ConversationalAgent::new(AgentOptions::new());
    agent.add_flow(host).await.unwrap();
    manager().install(&mut agent).await.unwrap();
    assert_eq!(agent.flow_ids(), vec!["Kiosk", "OrderCoffee", "Pastry"]);

    agent.process_input("treat me").await.unwrap();
    let result = agent.process_input("croissant").await.unwrap();
    assert_eq!((result.machine.as_str(), result.state.as_str()), ("Kiosk", "Idle"));
    assert_eq!(result.context["treat"], json!({ "item": "croissant" }));
}
