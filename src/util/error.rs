use crate::config::ConfigError;
use crate::identity::{MachineId, StoreId, TxAuthorship, TxId};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the master over the transport layer.
#[derive(Debug, Error)]
pub enum ComError {
    #[error("master at {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("no response from master within {0:?}")]
    Timeout(Duration),
    #[error("store id mismatch (local {local}, master {master})")]
    StoreIdMismatch { local: StoreId, master: StoreId },
    #[error("communication I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the coordination service.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("coordination service disconnected: {0}")]
    Disconnected(String),
    #[error("broker has been shut down")]
    Shutdown,
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the embedded storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no logical log for version {version}")]
    NoSuchLogVersion { version: u64 },
    #[error("unknown data source {0}")]
    UnknownDataSource(String),
    #[error("storage instance is not running")]
    NotRunning,
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Diagnosis produced when local committed history diverges from the master's.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BranchedData {
    pub message: String,
    pub local_machine: MachineId,
    pub master_machine: MachineId,
    pub tx_id: TxId,
    pub local_author: Option<TxAuthorship>,
    pub master_author: Option<TxAuthorship>,
}

impl BranchedData {
    pub fn diverged(
        local_machine: MachineId,
        master_machine: MachineId,
        tx_id: TxId,
        local_author: TxAuthorship,
        master_author: TxAuthorship,
    ) -> Self {
        let message = format!(
            "branched data, I (machine {local_machine}) think the author of tx {tx_id} is \
             {local_author}, but master (machine {master_machine}) says it is {master_author}"
        );
        Self {
            message,
            local_machine,
            master_machine,
            tx_id,
            local_author: Some(local_author),
            master_author: Some(master_author),
        }
    }

    /// The local author lookup failed in an unexpected way; a fresh copy resolves it either way.
    pub fn unverifiable(
        local_machine: MachineId,
        master_machine: MachineId,
        tx_id: TxId,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self {
            message: format!(
                "maybe not branched data, but a fresh copy resolves it: author lookup for tx \
                 {tx_id} on machine {local_machine} failed: {reason}"
            ),
            local_machine,
            master_machine,
            tx_id,
            local_author: None,
            master_author: None,
        }
    }
}

/// How the role evaluator treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Coordination or communication hiccup; surfaced without shutting down.
    Transient,
    /// Local history diverged; recoverable once per evaluation.
    BranchedData,
    /// Anything else; the node records the cause and shuts down.
    Fatal,
    /// Rejected configuration, raised before any disk or network activity.
    Config,
}

#[derive(Debug, Error)]
pub enum HaError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("communication with master failed: {0}")]
    Communication(#[from] ComError),
    #[error("coordination failure: {0}")]
    Coordination(#[from] BrokerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    BranchedData(BranchedData),
    #[error("branched data detected and policy is to shut down: {0}")]
    BranchedDataShutdown(BranchedData),
    #[error("no master elected in cluster")]
    NoMaster,
    #[error("unable to get a handle to master machine {0} from the coordination service")]
    MasterUnavailable(MachineId),
    #[error(
        "tried to join the cluster for {:?}, but was unable to: {}",
        .waited,
        .last_failure.as_deref().unwrap_or("no master found")
    )]
    JoinTimeout {
        waited: Duration,
        last_failure: Option<String>,
    },
    #[error("gave up copying store from master after {attempts} attempts")]
    CopyExhausted {
        attempts: usize,
        #[source]
        source: Box<HaError>,
    },
    #[error("role evaluation failed, node shut down: {0}")]
    Fatal(#[source] Arc<HaError>),
    #[error("graph database not started: {cause}")]
    NotStarted {
        #[source]
        cause: Arc<HaError>,
    },
    #[error("graph database not assigned and no cause of shutdown, maybe not started yet or in the middle of master/slave swap")]
    NotAssigned,
    #[error("shutdown called")]
    Closed,
}

impl HaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HaError::Communication(_) | HaError::Coordination(_) | HaError::NoMaster => {
                ErrorKind::Transient
            }
            HaError::BranchedData(_) => ErrorKind::BranchedData,
            HaError::Config(_) => ErrorKind::Config,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_branched_data(&self) -> bool {
        matches!(self.kind(), ErrorKind::BranchedData)
    }
}

impl From<BranchedData> for HaError {
    fn from(err: BranchedData) -> Self {
        HaError::BranchedData(err)
    }
}
