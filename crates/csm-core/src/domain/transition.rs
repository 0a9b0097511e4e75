use csm_definition::{FlowInvocation, TerminationReason, TransitionDefinition};

/// Outcome of evaluating one input against a flow machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Nothing matched; the machine is unchanged
    None,

    /// Moved to another state of the same flow
    State {
        /// New current state
        target: String,
        /// Transition taken
        transition: TransitionDefinition,
    },

    /// Jump to another registered flow
    Machine {
        /// Flow to activate
        target: String,
        /// Transition taken
        transition: TransitionDefinition,
    },

    /// Invoke another flow and wait for its result
    FlowInvocation {
        /// What to invoke and how to handle the result
        invocation: FlowInvocation,
        /// Declaration index of the transition within its state
        transition_index: usize,
        /// Transition taken
        transition: TransitionDefinition,
    },

    /// Return from the current flow
    FlowTermination {
        /// Why the flow returned
        reason: TerminationReason,
        /// Transition taken
        transition: TransitionDefinition,
    },
}

impl TransitionResult {
    /// Transition taken, if any
    pub fn transition(&self) -> Option<&TransitionDefinition> {
        match self {
            TransitionResult::None => None,
            TransitionResult::State { transition, .. }
            | TransitionResult::Machine { transition, .. }
            | TransitionResult::FlowInvocation { transition, .. }
            | TransitionResult::FlowTermination { transition, .. } => Some(transition),
        }
    }

    /// Whether anything matched
    pub fn is_none(&self) -> bool {
        matches!(self, TransitionResult::None)
    }
}
