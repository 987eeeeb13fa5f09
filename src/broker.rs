//! Seams to the coordination service and to the current master.
//!
//! The coordination service ("broker") answers who the master is, arbitrates
//! cluster creation and hosts the master-side server. The master handle is
//! the transport-level client used by slaves. Both are supplied by the
//! embedder; the node only consumes these traits.

use crate::identity::{Machine, MachineId, StoreId, TxAuthorship, TxId};
use crate::protocol::{Response, SlaveContext, StoreWriter};
use crate::storage::LocalGraph;
use crate::util::{BrokerError, ComError};
use std::fmt;
use std::sync::{Arc, Weak};

/// Client handle for requests against the current master.
pub trait Master: Send + Sync {
    /// Streams every store file into `writer`; the response carries the
    /// transactions committed while the copy was in flight.
    fn copy_store(
        &self,
        context: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>, ComError>;

    /// Asks which machine authored `tx_id` in the store identified by `store_id`.
    fn master_id_for_committed_tx(
        &self,
        tx_id: TxId,
        store_id: StoreId,
    ) -> Result<Response<TxAuthorship>, ComError>;

    /// Returns every transaction committed after the positions in `context`.
    fn pull_updates(&self, context: &SlaveContext) -> Result<Response<()>, ComError>;
}

/// Server endpoint running on this node while it is master.
pub trait MasterServer: Send + Sync {
    fn shutdown(&self);
}

/// The master as currently resolved by the broker.
#[derive(Clone)]
pub struct MasterRef {
    /// Absent when the broker knows the master but cannot reach it, and when
    /// this node itself is the master.
    pub handle: Option<Arc<dyn Master>>,
    pub machine: Machine,
}

impl MasterRef {
    pub fn new(handle: Option<Arc<dyn Master>>, machine: Machine) -> Self {
        Self { handle, machine }
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine.machine_id
    }

    pub fn is(&self, machine_id: MachineId) -> bool {
        self.machine.machine_id == machine_id
    }
}

impl fmt::Debug for MasterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterRef")
            .field("machine", &self.machine)
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

impl fmt::Display for MasterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.machine,
            if self.handle.is_some() {
                "connected"
            } else {
                "no handle"
            }
        )
    }
}

/// Receives "the master may have changed" signals.
pub trait MasterChangeListener: Send + Sync {
    fn master_changed(&self, reason: &str);
}

pub trait Broker: Send + Sync {
    /// Resolves the current master; `force_refresh` bypasses any cached answer.
    fn master(&self, force_refresh: bool) -> Result<Option<MasterRef>, BrokerError>;

    /// Attempts to found a cluster with `candidate`; returns the store id that won.
    fn create_cluster(&self, candidate: StoreId) -> Result<StoreId, BrokerError>;

    fn notify_master_changed(&self, master: &Machine) -> Result<(), BrokerError>;

    /// Re-advertises this node as master after it (re)took the role.
    fn rebind_master(&self) -> Result<(), BrokerError>;

    fn instantiate_master_server(
        &self,
        graph: Arc<dyn LocalGraph>,
    ) -> Result<Box<dyn MasterServer>, BrokerError>;

    /// Publishes this slave's last committed transaction to the coordination service.
    fn set_last_committed_tx(&self, tx_id: TxId) -> Result<(), BrokerError>;

    fn i_am_master(&self) -> bool;

    fn set_connection_information(&self, _graph: &dyn LocalGraph) {}

    fn attach_listener(&self, _listener: Weak<dyn MasterChangeListener>) {}

    /// Human-readable status, logged after every role start.
    fn status_lines(&self) -> Vec<String> {
        Vec::new()
    }

    fn shutdown(&self);
}
