use crate::identity::MachineId;
use crate::lifecycle::NodePhase;
use serde::Serialize;

/// Point-in-time view of a node, for operators and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HaStatus {
    pub machine_id: MachineId,
    pub cluster_name: String,
    pub server: String,
    pub phase: NodePhase,
    pub is_master: bool,
    /// Last time transactions from the master were applied, in epoch millis; 0 if never.
    pub last_update_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_of_shutdown: Option<String>,
}

impl HaStatus {
    pub fn is_serving(&self) -> bool {
        self.phase.is_serving()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
