//! Seams to the embedded storage engine.
//!
//! The engine is external: the node only starts instances bound to a role,
//! queries their committed history, feeds them transactions pulled from the
//! master and shuts them down.

use crate::broker::Broker;
use crate::identity::{StoreId, TxAuthorship, TxId};
use crate::protocol::{CommittedTransaction, DataSourcePosition};
use crate::receiver::ResponseReceiver;
use crate::update_mode::LastTxReporter;
use crate::util::StorageError;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Marker file whose presence means a store has been created in a directory.
pub const STORE_FILE_NAME: &str = "neostore";
/// Base name of the logical log; rotated history files append `.v<version>`.
pub const LOGICAL_LOG_NAME: &str = "nioneo_logical.log";
/// Diagnostic log kept in the store directory and never displaced by recovery.
pub const MESSAGES_LOG_NAME: &str = "messages.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineRole {
    Master,
    Slave,
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineRole::Master => write!(f, "master"),
            MachineRole::Slave => write!(f, "slave"),
        }
    }
}

/// Role-specific dependencies handed to the engine when an instance starts.
///
/// A master-bound instance allocates ids and locks locally; a slave-bound
/// instance forwards them to the master through the broker and routes
/// responses back through `receiver`.
pub enum RoleBinding {
    Master {
        broker: Arc<dyn Broker>,
    },
    Slave {
        broker: Arc<dyn Broker>,
        receiver: Weak<dyn ResponseReceiver>,
        tx_reporter: LastTxReporter,
        lock_read_timeout: Duration,
        max_concurrent_channels: usize,
    },
}

impl RoleBinding {
    pub fn role(&self) -> MachineRole {
        match self {
            RoleBinding::Master { .. } => MachineRole::Master,
            RoleBinding::Slave { .. } => MachineRole::Slave,
        }
    }
}

impl fmt::Debug for RoleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleBinding::Master { .. } => f.debug_struct("Master").finish_non_exhaustive(),
            RoleBinding::Slave {
                tx_reporter,
                lock_read_timeout,
                max_concurrent_channels,
                ..
            } => f
                .debug_struct("Slave")
                .field("tx_reporter", tx_reporter)
                .field("lock_read_timeout", lock_read_timeout)
                .field("max_concurrent_channels", max_concurrent_channels)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
    TxManagerNotOk,
    StorageMediaFull,
}

pub trait KernelEventHandler: Send + Sync {
    fn before_shutdown(&self) {}

    fn kernel_panic(&self, error: ErrorState);
}

pub trait TransactionEventHandler: Send + Sync {
    fn after_commit(&self, _tx_id: TxId) {}

    fn after_rollback(&self, _tx_id: TxId) {}
}

/// A running, role-bound storage instance.
pub trait LocalGraph: Send + Sync {
    fn role(&self) -> MachineRole;

    fn store_id(&self) -> StoreId;

    /// Last committed transaction of the graph data source.
    fn last_committed_tx_id(&self) -> TxId;

    /// Which machine was master when `tx_id` committed, read from the local log.
    fn master_for_committed_tx(&self, tx_id: TxId) -> Result<TxAuthorship, StorageError>;

    /// Last committed transaction per registered data source.
    fn data_sources(&self) -> Vec<DataSourcePosition>;

    fn apply_transactions(
        &self,
        data_source: &str,
        transactions: &[CommittedTransaction],
    ) -> Result<(), StorageError>;

    fn rotate_logs(&self) -> Result<(), StorageError>;

    /// Drops id ranges handed out by a previous master.
    fn forget_id_allocations_from_master(&self) {}

    fn register_kernel_event_handler(&self, handler: Arc<dyn KernelEventHandler>);

    fn unregister_kernel_event_handler(&self, handler: &Arc<dyn KernelEventHandler>) -> bool;

    fn register_transaction_event_handler(&self, handler: Arc<dyn TransactionEventHandler>);

    fn unregister_transaction_event_handler(
        &self,
        handler: &Arc<dyn TransactionEventHandler>,
    ) -> bool;

    fn create_node(&self) -> Result<u64, StorageError>;

    /// Stops the instance. Calling it on a stopped instance is a no-op.
    fn shutdown(&self) -> Result<(), StorageError>;
}

pub trait GraphFactory: Send + Sync {
    fn store_exists(&self, store_dir: &Path) -> bool {
        store_dir.join(STORE_FILE_NAME).exists()
    }

    fn logical_log_name(&self) -> &str {
        LOGICAL_LOG_NAME
    }

    /// Starts an instance bound to `binding`'s role. `store_id` is set when
    /// this node just founded the cluster and must stamp the new store.
    fn open(
        &self,
        store_dir: &Path,
        store_id: Option<StoreId>,
        binding: RoleBinding,
    ) -> Result<Arc<dyn LocalGraph>, StorageError>;

    /// Starts a plain instance used to replay transactions after a store copy.
    fn open_for_copy(&self, store_dir: &Path) -> Result<Arc<dyn LocalGraph>, StorageError>;

    /// Sets the version the next logical log will be written with.
    fn set_log_version(&self, store_dir: &Path, version: u64) -> Result<(), StorageError>;
}
