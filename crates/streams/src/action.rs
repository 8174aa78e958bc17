use std::fmt;

use crate::FlowRate;

/// What a flow-rate transition does to an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowActionType {
    Create,
    Update,
    Terminate,
}

impl FlowActionType {
    /// Classify a transition from its previous and new rates.
    ///
    /// `0 -> 0` is not a transition and yields `None`.
    pub fn classify(previous: FlowRate, new: FlowRate) -> Option<Self> {
        match (previous == 0, new == 0) {
            (true, true) => None,
            (true, false) => Some(FlowActionType::Create),
            (false, true) => Some(FlowActionType::Terminate),
            (false, false) => Some(FlowActionType::Update),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowActionType::Create => "create",
            FlowActionType::Update => "update",
            FlowActionType::Terminate => "terminate",
        }
    }
}

impl fmt::Display for FlowActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
