use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a node is in its master/slave lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Unstarted,
    Joining,
    Master,
    Slave,
    BranchedRecovery,
    ShuttingDown,
    Stopped,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Unstarted => "Unstarted",
            NodePhase::Joining => "Joining",
            NodePhase::Master => "Master",
            NodePhase::Slave => "Slave",
            NodePhase::BranchedRecovery => "BranchedRecovery",
            NodePhase::ShuttingDown => "ShuttingDown",
            NodePhase::Stopped => "Stopped",
        }
    }

    /// Whether a role-bound instance is published in this phase.
    pub fn is_serving(&self) -> bool {
        matches!(self, NodePhase::Master | NodePhase::Slave)
    }

    pub fn can_transition_to(&self, next: NodePhase) -> bool {
        use NodePhase::*;
        if *self == next {
            return true;
        }
        match self {
            Unstarted => matches!(next, Joining | ShuttingDown | Stopped),
            Joining => true,
            Master | Slave => !matches!(next, Unstarted),
            BranchedRecovery => !matches!(next, Unstarted),
            ShuttingDown => matches!(next, Stopped | Joining),
            // A kernel panic may restart a stopped node.
            Stopped => matches!(next, Joining | ShuttingDown),
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
