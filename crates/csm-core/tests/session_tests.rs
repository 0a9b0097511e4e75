use csm_core::{decode_token, AgentOptions, ConversationalAgent, CoreError, ErrorOperation, StateChangeTrigger};
use csm_test_utils::{
    coffee_shop_agent, coffee_shop_machine, greeting_machine, RecordingErrorHandler, RecordingEventHandler,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};

fn restore_point(agent: &ConversationalAgent) -> (String, String) {
    agent
        .restore_point()
        .map(|(machine, state)| (machine.to_string(), state.to_string()))
        .expect("agent was restored from a token")
}

#[tokio::test]
async fn test_root_session_round_trip() {
    let mut agent = ConversationalAgent::new(AgentOptions::new().with_id("greeter"));
    agent.add_machine(greeting_machine()).await.unwrap();
    agent.process_input("hello").await.unwrap();
    agent.process_input("I am Ada").await.unwrap();
    agent.update_context(json!({ "name": "Ada" }).as_object().cloned().unwrap());

    let token = agent.to_url_hash().unwrap();
    let decoded = decode_token(&token).unwrap();
    assert!(decoded.flow.is_none());
    assert!(decoded.execution.is_none());

    let mut restored = ConversationalAgent::from_url_hash(&token, AgentOptions::new()).unwrap();
    restored.add_machine(greeting_machine()).await.unwrap();
    let (machine, state) = restore_point(&restored);
    restored.set_state(&machine, &state).unwrap();

    assert_eq!(restored.id(), "greeter");
    assert_eq!(restored.current_machine(), Some("Greeting"));
    assert_eq!(restored.current_state(), Some("Greeted"));
    assert_eq!(restored.context(), agent.context());

    let result = restored.process_input("Bye ada").await.unwrap();
    assert_eq!(result.state, "Done");
}

#[tokio::test]
async fn test_nested_tokens_carry_the_stack() {
    let mut agent = coffee_shop_agent(AgentOptions::new()).await;
    agent.process_input("order coffee").await.unwrap();
    agent.process_input("small").await.unwrap();

    let decoded = decode_token(&agent.to_url_hash().unwrap()).unwrap();
    assert_eq!(decoded.machine, "OrderCoffee");
    assert_eq!(decoded.state, "ChooseMilk");
    assert_eq!(decoded.flow.unwrap()["size"], json!("small"));
    assert_eq!(decoded.params.unwrap()["menu"], json!("coffee"));

    let execution = decoded.execution.unwrap();
    assert_eq!(execution.cf, "OrderCoffee");
    assert_eq!(execution.fs.len(), 1);
    assert_eq!(execution.fs[0].f, "Main");
    assert_eq!(execution.fs[0].s, "Welcome");
    assert_eq!(execution.fs[0].t, 0);
}

#[tokio::test]
async fn test_restore_state_emits_restore_only() {
    let agent = coffee_shop_agent(AgentOptions::new()).await;
    let token = agent.to_url_hash().unwrap();

    let events = RecordingEventHandler::new();
    let mut restored =
        ConversationalAgent::from_url_hash(&token, AgentOptions::new().with_state_change_handler(events.clone()))
            .unwrap();
    restored.add_machine(coffee_shop_machine()).await.unwrap();
    restored.restore_state("Main", "Welcome").await.unwrap();

    assert_eq!(events.triggers(), vec![StateChangeTrigger::Restore]);
    let event = &events.events()[0];
    assert_eq!(event.agent, agent.id());
    assert_eq!(event.state, "Welcome");
}

#[tokio::test]
async fn test_restored_multi_flow_machine_keeps_caller_position() {
    let mut agent = coffee_shop_agent(AgentOptions::new()).await;
    agent.process_input("add a pastry").await.unwrap();
    let token = agent.to_url_hash().unwrap();

    let mut restored = ConversationalAgent::from_url_hash(&token, AgentOptions::new()).unwrap();
    restored.add_machine(coffee_shop_machine()).await.unwrap();
    let (machine, state) = restore_point(&restored);
    restored.set_state(&machine, &state).unwrap();
    assert_eq!(restored.execution_state(), agent.execution_state());

    let result = restored.process_input("croissant").await.unwrap();
    assert_eq!(result.machine, "Main");
    assert_eq!(result.context["pastries"], json!([{ "item": "croissant" }]));
}

#[tokio::test]
async fn test_restoring_into_missing_position_fails() {
    let agent = coffee_shop_agent(AgentOptions::new()).await;
    let token = agent.to_url_hash().unwrap();

    let errors = RecordingErrorHandler::new();
    let mut restored =
        ConversationalAgent::from_url_hash(&token, AgentOptions::new().with_error_handler(errors.clone())).unwrap();
    restored.add_machine(greeting_machine()).await.unwrap();

    assert_eq!(
        restored.set_state("Main", "Welcome").unwrap_err(),
        CoreError::MachineNotFound("Main".to_string())
    );
    assert_eq!(errors.operations(), vec![ErrorOperation::Transition]);
}

#[test]
fn test_malformed_tokens_are_rejected() {
    let errors = RecordingErrorHandler::new();
    for token in ["", "not-a-token!", "eyJhIjoxfQ"] {
        let err = ConversationalAgent::from_url_hash(token, AgentOptions::new().with_error_handler(errors.clone()))
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to deserialize agent state"), "{}", err);
    }
    assert_eq!(errors.operations(), vec![ErrorOperation::Deserialize; 3]);
}

fn arb_context() -> impl Strategy<Value = serde_json::Map<String, Value>> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,12}".prop_map(Value::from),
    ];
    prop::collection::btree_map("[a-zA-Z_][a-zA-Z0-9_]{0,8}", leaf, 0..6)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_token_round_trip_preserves_session(context in arb_context(), steps in 0usize..3) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let mut agent = ConversationalAgent::new(AgentOptions::new().with_context(context.clone()));
            agent.add_machine(greeting_machine()).await.unwrap();
            for input in ["hello", "I am Bob"].iter().take(steps) {
                agent.process_input(input).await.unwrap();
            }

            let token = agent.to_url_hash().unwrap();
            let mut restored = ConversationalAgent::from_url_hash(&token, AgentOptions::new()).unwrap();
            restored.add_machine(greeting_machine()).await.unwrap();
            let (machine, state) = restore_point(&restored);
            restored.set_state(&machine, &state).unwrap();

            assert_eq!(restored.id(), agent.id());
            assert_eq!(restored.current_machine(), agent.current_machine());
            assert_eq!(restored.current_state(), agent.current_state());
            assert_eq!(restored.context(), agent.context());
        });
    }
}
