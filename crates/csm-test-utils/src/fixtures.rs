//! Fixture machine definitions.

use csm_core::{AgentOptions, ConversationalAgent};
use csm_definition::{parse_machine_definition, MachineDefinition};

/// Multi-flow coffee shop.
///
/// `Main.Welcome` invokes `OrderCoffee` (structured invocation, appends the
/// returned order to `orders`) and `Pastry` (`call:` convention, appends to
/// `pastries`), and jumps to `Payment` once an order exists.
pub const COFFEE_SHOP_JSON: &str = r#"{
    "id": "CoffeeShop",
    "initialFlow": "Main",
    "flows": {
        "Main": {
            "initial": "Welcome",
            "states": {
                "Welcome": {
                    "meta": { "messageId": "welcome" },
                    "transitions": [
                        { "pattern": "Order Coffee", "flowInvocation": {
                            "flowId": "OrderCoffee",
                            "parameters": { "menu": "coffee" },
                            "onResult": {
                                "end": {
                                    "operations": [{ "append": { "to": "orders", "value": "$result" } }],
                                    "target": "OrderPlaced"
                                },
                                "cancel": { "target": "Welcome" },
                                "error": { "target": "Welcome" }
                            }
                        } },
                        { "pattern": "Add a pastry", "target": "call:Pastry:append:pastries" },
                        { "pattern": "Checkout", "target": "machine:Payment",
                          "condition": "context.orders && context.orders.length > 0" },
                        { "pattern": ":default", "target": "Welcome" }
                    ]
                },
                "OrderPlaced": {
                    "meta": { "messageId": "order_placed", "transient": true },
                    "transitions": [{ "target": "Welcome", "context": { "lastOrderStatus": "placed" } }]
                }
            }
        },
        "OrderCoffee": {
            "initial": "ChooseSize",
            "returnType": { "type": "CoffeeOrder", "fields": ["size", "milk", "menu"] },
            "states": {
                "ChooseSize": {
                    "meta": { "messageId": "choose_size" },
                    "transitions": [
                        { "pattern": "small", "target": "ChooseMilk", "context": { "size": "small" } },
                        { "pattern": "large", "target": "ChooseMilk", "context": { "size": "large" },
                          "condition": { "type": "jsonlogic", "rule": { "!": { "var": "soldOut" } } } },
                        { "pattern": "never mind", "target": ":cancel" }
                    ]
                },
                "ChooseMilk": {
                    "transitions": [
                        { "pattern": "oat*", "target": "Confirm", "context": { "milk": "oat" } },
                        { "pattern": "regular", "target": "Confirm", "context": { "milk": "regular" } }
                    ]
                },
                "Confirm": {
                    "transitions": [
                        { "pattern": "yes", "target": ":end" },
                        { "pattern": "start over", "target": "ChooseSize", "priority": 1 }
                    ]
                }
            }
        },
        "Pastry": {
            "initial": "Pick",
            "states": {
                "Pick": {
                    "transitions": [
                        { "pattern": "croissant", "target": ":end", "context": { "item": "croissant" } },
                        { "pattern": "nothing", "target": ":cancel" }
                    ]
                }
            }
        },
        "Payment": {
            "initial": "Checkout",
            "states": {
                "Checkout": {
                    "transitions": [{ "pattern": "card", "target": "Paid", "context": { "paidWith": "card" } }]
                },
                "Paid": { "transitions": [] }
            }
        }
    }
}"#;

/// Legacy single-flow greeting with wildcard, interpolated and `@var` targets
pub const GREETING_JSON: &str = r#"{
    "id": "Greeting",
    "initial": "Start",
    "states": {
        "Start": {
            "transitions": [
                { "pattern": "hello", "target": "AskName" },
                { "pattern": "help", "target": "@helpState" }
            ]
        },
        "AskName": {
            "transitions": [{ "pattern": "I am *", "target": "Greeted", "context": { "named": true } }]
        },
        "Greeted": {
            "transitions": [{ "pattern": "bye #{name}", "target": "Done" }]
        },
        "Help": {
            "transitions": [{ "pattern": ":default", "target": "Start" }]
        },
        "Done": { "transitions": [] }
    }
}"#;

/// Parsed [`COFFEE_SHOP_JSON`]
pub fn coffee_shop_machine() -> MachineDefinition {
    parse_machine_definition(COFFEE_SHOP_JSON).expect("coffee shop fixture is valid")
}

/// Parsed [`GREETING_JSON`]
pub fn greeting_machine() -> MachineDefinition {
    parse_machine_definition(GREETING_JSON).expect("greeting fixture is valid")
}

/// Agent with the coffee shop registered
pub async fn coffee_shop_agent(options: AgentOptions) -> ConversationalAgent {
    let mut agent = ConversationalAgent::new(options);
    agent
        .add_machine(coffee_shop_machine())
        .await
        .expect("coffee shop fixture registers");
    agent
}
