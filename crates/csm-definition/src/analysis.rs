//! Non-blocking structural analysis of typed machine definitions.
//!
//! Target existence is deliberately not part of load-time validation: targets
//! may be resolved through context (`@var`) or registered later as separate
//! flows. The analysis here reports what looks wrong so tooling and the agent
//! can warn about it.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::machine::{markers, FlowDefinition, MachineDefinition, TerminationReason};

/// How serious a structural issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, usually intended
    Info,
    /// Probably a bug in the definition
    Warning,
}

/// Kind of structural issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Target names a state that does not exist in the flow
    UnknownState,
    /// `machine:` target or invocation names a flow the machine does not define
    UnknownFlow,
    /// `call:` target does not have the `call:<flow>:<aggregation>:<variable>` form
    MalformedCall,
    /// A termination marker in a flow nobody invokes
    RootTermination,
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralIssue {
    /// Kind of issue
    pub kind: IssueKind,
    /// Severity
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
    /// Location, e.g. `flows.Order.states.Start.transitions[1]`
    pub path: String,
}

impl fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} (at {})", self.severity, self.message, self.path)
    }
}

const AGGREGATIONS: [&str; 3] = ["append", "overwrite", "merge"];

/// Report targets that do not resolve within the machine.
///
/// `known_flows` lists flows registered elsewhere (e.g. with the agent) that
/// count as valid `machine:`, `call:` and invocation targets.
pub fn analyze_targets(machine: &MachineDefinition, known_flows: &[&str]) -> Vec<StructuralIssue> {
    let mut flow_ids: BTreeSet<&str> = machine.flows().into_iter().map(|flow| flow.id.as_str()).collect();
    flow_ids.extend(known_flows.iter().copied());

    let mut invoked: BTreeSet<&str> = BTreeSet::new();
    for flow in machine.flows() {
        for state in flow.states.values() {
            for transition in &state.transitions {
                if let Some(invocation) = &transition.flow_invocation {
                    invoked.insert(invocation.flow_id.as_str());
                } else if let Some(rest) = transition.target.strip_prefix(markers::CALL_PREFIX) {
                    invoked.insert(rest.split(':').next().unwrap_or_default());
                }
            }
        }
    }

    let multi = matches!(machine, MachineDefinition::Multi(_));
    let mut issues = Vec::new();
    for flow in machine.flows() {
        let prefix = if multi { format!("flows.{}.", flow.id) } else { String::new() };
        let is_root = !invoked.contains(flow.id.as_str());
        analyze_flow(flow, &prefix, &flow_ids, is_root, &mut issues);
    }
    issues
}

fn analyze_flow(
    flow: &FlowDefinition,
    prefix: &str,
    flow_ids: &BTreeSet<&str>,
    is_root: bool,
    issues: &mut Vec<StructuralIssue>,
) {
    for (state_id, state) in &flow.states {
        for (index, transition) in state.transitions.iter().enumerate() {
            let path = format!("{}states.{}.transitions[{}]", prefix, state_id, index);

            if let Some(invocation) = &transition.flow_invocation {
                if !flow_ids.contains(invocation.flow_id.as_str()) {
                    issues.push(StructuralIssue {
                        kind: IssueKind::UnknownFlow,
                        severity: Severity::Warning,
                        message: format!("Invoked flow '{}' is not defined", invocation.flow_id),
                        path: format!("{}.flowInvocation.flowId", path),
                    });
                }
                for reason in [TerminationReason::End, TerminationReason::Cancel, TerminationReason::Error] {
                    if let Some(handler) = invocation.on_result.get(reason) {
                        check_state_target(flow, &handler.target, &format!("{}.flowInvocation.onResult.{}", path, reason), issues);
                    }
                }
                continue;
            }

            let target = transition.target.as_str();
            if target.starts_with(markers::VARIABLE_PREFIX) {
                continue;
            }

            if TerminationReason::from_target(target).is_some() {
                if is_root {
                    issues.push(StructuralIssue {
                        kind: IssueKind::RootTermination,
                        severity: Severity::Info,
                        message: format!("Flow '{}' terminates with '{}' but is never invoked", flow.id, target),
                        path,
                    });
                }
            } else if let Some(flow_id) = target.strip_prefix(markers::MACHINE_PREFIX) {
                if !flow_ids.contains(flow_id) {
                    issues.push(StructuralIssue {
                        kind: IssueKind::UnknownFlow,
                        severity: Severity::Warning,
                        message: format!("Target machine '{}' is not defined", flow_id),
                        path,
                    });
                }
            } else if let Some(call) = target.strip_prefix(markers::CALL_PREFIX) {
                let parts: Vec<&str> = call.split(':').collect();
                if parts.len() != 3 || !AGGREGATIONS.contains(&parts[1]) || parts[2].is_empty() {
                    issues.push(StructuralIssue {
                        kind: IssueKind::MalformedCall,
                        severity: Severity::Warning,
                        message: format!("Sub-flow call '{}' must have the form call:<flow>:<append|overwrite|merge>:<variable>", target),
                        path,
                    });
                } else if !flow_ids.contains(parts[0]) {
                    issues.push(StructuralIssue {
                        kind: IssueKind::UnknownFlow,
                        severity: Severity::Warning,
                        message: format!("Called sub-flow '{}' is not defined", parts[0]),
                        path,
                    });
                }
            } else {
                check_state_target(flow, target, &path, issues);
            }
        }
    }
}

fn check_state_target(flow: &FlowDefinition, target: &str, path: &str, issues: &mut Vec<StructuralIssue>) {
    if target.starts_with(markers::VARIABLE_PREFIX) || flow.states.contains_key(target) {
        return;
    }
    issues.push(StructuralIssue {
        kind: IssueKind::UnknownState,
        severity: Severity::Warning,
        message: format!("Target state '{}' not found in flow '{}'", target, flow.id),
        path: path.to_string(),
    });
}
