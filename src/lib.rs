//! Master/slave coordination core for a highly available, replicated graph
//! store node.
//!
//! An [`HaNode`] owns one role-bound storage instance at a time. It asks the
//! coordination service who the master is, starts the instance as master or
//! slave, verifies that local committed history agrees with the master's,
//! recovers from branched data by copying a fresh store, and keeps a slave
//! current with a background update puller.

pub mod branched;
pub mod broker;
pub mod config;
pub mod identity;
pub mod lifecycle;
pub mod node;
pub mod protocol;
pub mod puller;
pub mod receiver;
pub mod status;
pub mod storage;
pub mod store_copy;
pub mod timeouts;
pub mod update_mode;
pub mod util;

pub use branched::{BranchedDataPolicy, PolicyOutcome};
pub use broker::{Broker, Master, MasterChangeListener, MasterRef, MasterServer};
pub use config::{ConfigError, HaConfig};
pub use identity::{Machine, MachineId, StoreId, TxAuthorship, TxId};
pub use lifecycle::{GraphSlot, NodePhase};
pub use node::HaNode;
pub use protocol::{
    CommittedTransaction, DataSourcePosition, FileStoreWriter, Response, SlaveContext,
    StoreWriter, TransactionStream, DEFAULT_DATA_SOURCE,
};
pub use puller::UpdatePuller;
pub use receiver::ResponseReceiver;
pub use status::HaStatus;
pub use storage::{
    ErrorState, GraphFactory, KernelEventHandler, LocalGraph, MachineRole, RoleBinding,
    TransactionEventHandler,
};
pub use timeouts::HaTimeouts;
pub use update_mode::{LastTxReporter, SlaveUpdateMode};
pub use util::{BranchedData, BrokerError, ComError, ErrorKind, HaError, StorageError};
