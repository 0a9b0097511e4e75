use csm_core::{AgentOptions, ConversationalAgent, CoreError, ErrorOperation};
use csm_definition::{FlowDefinition, StateDefinition, TransitionDefinition};
use csm_test_utils::{FailingEventHandler, RecordingErrorHandler};
use pretty_assertions::assert_eq;
use serde_json::json;

fn greeting() -> FlowDefinition {
    FlowDefinition::new("Greeting", "Start")
        .with_state(
            "Start",
            StateDefinition::new()
                .with_transition(
                    TransitionDefinition::to("Named")
                        .on("I am *")
                        .with_context(json!({ "greeted": true }).as_object().cloned().unwrap()),
                )
                .with_transition(TransitionDefinition::to("machine:Nowhere").on("lost")),
        )
        .with_state("Named", StateDefinition::new())
}

fn help() -> FlowDefinition {
    FlowDefinition::new("Help", "Topics").with_state("Topics", StateDefinition::new())
}

#[tokio::test]
async fn test_registry_rules() {
    let errors = RecordingErrorHandler::new();
    let mut agent = ConversationalAgent::new(AgentOptions::new().with_error_handler(errors.clone()));
    agent.add_flow(greeting()).await.unwrap();
    agent.add_flow(help()).await.unwrap();

    assert_eq!(
        agent.add_flow(help()).await.unwrap_err(),
        CoreError::DuplicateFlow("Help".to_string())
    );
    assert_eq!(agent.remove_flow("Greeting").unwrap_err(), CoreError::ActiveFlowRemoval);
    agent.remove_flow("Help").unwrap();
    assert!(!agent.has_flow("Help"));
    assert_eq!(agent.remove_flow("Help").unwrap_err(), CoreError::FlowNotFound("Help".to_string()));

    assert_eq!(errors.operations(), vec![ErrorOperation::Transition]);
}

#[tokio::test]
async fn test_unknown_machine_target_fails_without_mutation() {
    let errors = RecordingErrorHandler::new();
    let mut agent = ConversationalAgent::new(AgentOptions::new().with_id("hooked").with_error_handler(errors.clone()));
    agent.add_flow(greeting()).await.unwrap();

    let err = agent.process_input("lost").await.unwrap_err();
    assert_eq!(err, CoreError::TargetMachineNotFound("Nowhere".to_string()));
    assert_eq!(agent.current_machine(), Some("Greeting"));
    assert_eq!(agent.current_state(), Some("Start"));

    let recorded = errors.errors();
    assert_eq!(recorded.len(), 1);
    let (error, context) = &recorded[0];
    assert_eq!(error, &err);
    assert_eq!(context.operation, ErrorOperation::ProcessInput);
    assert_eq!(context.agent, "hooked");
    assert_eq!(context.machine.as_deref(), Some("Greeting"));
    assert_eq!(context.state.as_deref(), Some("Start"));
    assert_eq!(context.input.as_deref(), Some("lost"));
}

#[tokio::test]
async fn test_failing_handler_does_not_abort() {
    let handler = FailingEventHandler::new("sink unavailable");
    let errors = RecordingErrorHandler::new();
    let mut agent = ConversationalAgent::new(
        AgentOptions::new()
            .with_state_change_handler(handler.clone())
            .with_error_handler(errors.clone()),
    );
    agent.add_flow(greeting()).await.unwrap();
    let result = agent.process_input("I am Bob").await.unwrap();

    assert_eq!(result.state, "Named");
    assert_eq!(handler.calls(), 2);
    assert_eq!(errors.operations(), vec![ErrorOperation::StateEntry, ErrorOperation::StateEntry]);
    assert!(errors
        .errors()
        .iter()
        .all(|(error, _)| *error == CoreError::EventHandlerError("sink unavailable".to_string())));
}

#[tokio::test]
async fn test_bad_token_reports_deserialize() {
    let errors = RecordingErrorHandler::new();
    let err = ConversationalAgent::from_url_hash("%%%", AgentOptions::new().with_error_handler(errors.clone()))
        .unwrap_err();
    assert!(matches!(err, CoreError::DeserializationError(_)));
    assert_eq!(errors.operations(), vec![ErrorOperation::Deserialize]);
}
