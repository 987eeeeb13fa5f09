//! Cluster identities: machines, store lineage, committed transactions.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type TxId = u64;

/// Identity of a cluster member, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(i32);

impl MachineId {
    /// Author recorded for transactions committed before the store joined a cluster.
    pub const NO_MASTER: MachineId = MachineId(-1);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_no_master(self) -> bool {
        self == Self::NO_MASTER
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lineage stamp written into a store when it is created.
///
/// Two stores share history only if their ids are equal; the value is never
/// derived from store contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    pub creation_time_ms: u64,
    pub random_id: u64,
}

impl StoreId {
    pub fn new(creation_time_ms: u64, random_id: u64) -> Self {
        Self {
            creation_time_ms,
            random_id,
        }
    }

    pub fn generate() -> Self {
        let creation_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self::new(creation_time_ms, rand::thread_rng().gen())
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId[{}/{}]",
            self.creation_time_ms,
            hex::encode(self.random_id.to_be_bytes())
        )
    }
}

/// Which machine was master when a transaction was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAuthorship {
    pub machine_id: MachineId,
    pub tx_id: TxId,
}

impl TxAuthorship {
    pub fn new(machine_id: MachineId, tx_id: TxId) -> Self {
        Self { machine_id, tx_id }
    }
}

impl fmt::Display for TxAuthorship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine {} at tx {}", self.machine_id, self.tx_id)
    }
}

/// Descriptor the coordination service keeps for each member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: MachineId,
    pub server: Option<String>,
    pub last_committed_tx: TxId,
    pub backup_port: Option<u16>,
}

impl Machine {
    pub fn new(machine_id: MachineId, server: impl Into<String>) -> Self {
        Self {
            machine_id,
            server: Some(server.into()),
            last_committed_tx: 0,
            backup_port: None,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "MachineInfo[ID:{}, server:{}]", self.machine_id, server),
            None => write!(f, "MachineInfo[ID:{}]", self.machine_id),
        }
    }
}
