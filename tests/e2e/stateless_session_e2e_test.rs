//! End-to-end test for a conversation served by stateless requests.
//!
//! Every turn builds a fresh agent from the previous token, re-registers the
//! definitions, restores the position and hands a new token back, the way a
//! messaging webhook would.

use anyhow::Context as _;
use csm_core::{AgentOptions, ConversationalAgent};
use csm_definition::MachineDefinition;
use csm_test_utils::{coffee_shop_machine, init_test_tracing, COFFEE_SHOP_JSON};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

/// What the webhook sends back to the messaging platform
#[derive(Debug)]
struct Reply {
    token: String,
    machine: String,
    state: String,
    message_id: Option<String>,
    context: serde_json::Map<String, Value>,
}

fn message_id(machine: &MachineDefinition, flow_id: &str, state: &str) -> Option<String> {
    machine
        .flows()
        .into_iter()
        .find(|flow| flow.id == flow_id)
        .and_then(|flow| flow.state(state))
        .and_then(|state| state.message_id())
        .map(str::to_string)
}

async fn handle_request(token: Option<&str>, input: &str) -> anyhow::Result<Reply> {
    let mut agent = match token {
        Some(token) => ConversationalAgent::from_url_hash(token, AgentOptions::new())?,
        None => ConversationalAgent::new(AgentOptions::new().with_id("webhook-session")),
    };
    agent.add_machine_json(COFFEE_SHOP_JSON).await?;

    if let Some((machine, state)) = agent
        .restore_point()
        .map(|(machine, state)| (machine.to_string(), state.to_string()))
    {
        agent.restore_state(&machine, &state).await?;
    }

    let result = agent.process_input(input).await.context("processing turn")?;
    Ok(Reply {
        token: agent.to_url_hash()?,
        message_id: message_id(&coffee_shop_machine(), &result.machine, &result.state),
        machine: result.machine,
        state: result.state,
        context: result.context,
    })
}

#[tokio::test]
async fn test_order_and_pay_across_requests() -> anyhow::Result<()> {
    init_test_tracing();

    let script = [
        ("Order Coffee", "OrderCoffee", "ChooseSize", Some("choose_size")),
        ("large", "OrderCoffee", "ChooseMilk", None),
        ("oat milk", "OrderCoffee", "Confirm", None),
        ("yes", "Main", "Welcome", Some("welcome")),
        ("add a pastry", "Pastry", "Pick", None),
        ("croissant", "Main", "Welcome", Some("welcome")),
        ("checkout", "Payment", "Checkout", None),
        ("card", "Payment", "Paid", None),
    ];

    let mut token: Option<String> = None;
    let mut last = None;
    for (input, machine, state, message) in script {
        let reply = handle_request(token.as_deref(), input).await?;
        assert_eq!(
            (reply.machine.as_str(), reply.state.as_str(), reply.message_id.as_deref()),
            (machine, state, message),
            "after input {:?}",
            input
        );
        token = Some(reply.token.clone());
        last = Some(reply);
    }

    let last = last.expect("script is not empty");
    assert_eq!(last.context["orders"], json!([{ "size": "large", "milk": "oat", "menu": "coffee" }]));
    assert_eq!(last.context["pastries"], json!([{ "item": "croissant" }]));
    assert_eq!(last.context["paidWith"], json!("card"));

    let restored = ConversationalAgent::from_url_hash(&last.token, AgentOptions::new())?;
    assert_eq!(restored.id(), "webhook-session");
    assert_eq!(restored.restore_point(), Some(("Payment", "Paid")));
    Ok(())
}

#[tokio::test]
async fn test_failed_turn_keeps_previous_token_usable() -> anyhow::Result<()> {
    let first = handle_request(None, "order coffee").await?;

    let mut agent = ConversationalAgent::from_url_hash(&first.token, AgentOptions::new())?;
    agent.add_machine_json(COFFEE_SHOP_JSON).await?;
    agent.set_state("OrderCoffee", "ChooseSize")?;
    agent.update_context(json!({ "soldOut": true }).as_object().cloned().unwrap_or_default());
    let blocked = agent.process_input("large").await?;
    assert!(!blocked.transitioned);

    let retry = handle_request(Some(&first.token), "large").await?;
    assert_eq!(retry.state, "ChooseMilk");
    Ok(())
}
