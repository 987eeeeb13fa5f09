//! Values exchanged with the master: slave contexts, responses carrying
//! committed transactions, and the sink a streamed store copy is written to.

use crate::identity::{MachineId, StoreId, TxId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Name of the data source holding the graph store itself.
pub const DEFAULT_DATA_SOURCE: &str = "nioneodb";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourcePosition {
    pub data_source: String,
    pub last_committed_tx: TxId,
}

impl DataSourcePosition {
    pub fn new(data_source: impl Into<String>, last_committed_tx: TxId) -> Self {
        Self {
            data_source: data_source.into(),
            last_committed_tx,
        }
    }
}

/// What a slave tells the master about itself on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveContext {
    pub session_id: u64,
    pub machine_id: MachineId,
    pub event_identifier: i32,
    pub last_applied: Vec<DataSourcePosition>,
}

impl SlaveContext {
    pub fn new(
        session_id: u64,
        machine_id: MachineId,
        event_identifier: i32,
        last_applied: Vec<DataSourcePosition>,
    ) -> Self {
        Self {
            session_id,
            machine_id,
            event_identifier,
            last_applied,
        }
    }

    /// Context used for a full store copy: nothing has been applied yet.
    pub fn anonymous(machine_id: MachineId) -> Self {
        Self::new(0, machine_id, 0, Vec::new())
    }

    pub fn last_applied_for(&self, data_source: &str) -> Option<TxId> {
        self.last_applied
            .iter()
            .find(|position| position.data_source == data_source)
            .map(|position| position.last_committed_tx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub tx_id: TxId,
    pub master_id: MachineId,
    pub payload: Vec<u8>,
}

impl CommittedTransaction {
    pub fn new(tx_id: TxId, master_id: MachineId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tx_id,
            master_id,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStream {
    pub data_source: String,
    pub transactions: Vec<CommittedTransaction>,
}

/// A master reply: the requested value plus any transactions the slave is missing.
#[derive(Debug, Clone)]
pub struct Response<T> {
    payload: T,
    store_id: StoreId,
    streams: Vec<TransactionStream>,
}

impl<T> Response<T> {
    pub fn new(payload: T, store_id: StoreId) -> Self {
        Self {
            payload,
            store_id,
            streams: Vec::new(),
        }
    }

    pub fn with_transactions(
        mut self,
        data_source: impl Into<String>,
        transactions: Vec<CommittedTransaction>,
    ) -> Self {
        self.streams.push(TransactionStream {
            data_source: data_source.into(),
            transactions,
        });
        self
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn streams(&self) -> &[TransactionStream] {
        &self.streams
    }

    pub fn transaction_count(&self) -> usize {
        self.streams
            .iter()
            .map(|stream| stream.transactions.len())
            .sum()
    }
}

/// Destination for the files of a streamed store copy.
pub trait StoreWriter {
    /// Writes one file, `path` being relative to the store root. Returns bytes written.
    fn write(&mut self, path: &str, data: &mut dyn Read) -> io::Result<u64>;

    fn done(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes copied store files beneath a store directory.
#[derive(Debug)]
pub struct FileStoreWriter {
    base: PathBuf,
    written: Vec<PathBuf>,
}

impl FileStoreWriter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            written: Vec::new(),
        }
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("store file path {path:?} escapes the store directory"),
            ));
        }
        Ok(self.base.join(relative))
    }
}

impl StoreWriter for FileStoreWriter {
    fn write(&mut self, path: &str, data: &mut dyn Read) -> io::Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        let written = io::copy(data, &mut file)?;
        file.sync_all()?;
        self.written.push(target);
        Ok(written)
    }
}
