//! Application of master responses to the local store.

use crate::identity::TxId;
use crate::protocol::{Response, SlaveContext, TransactionStream};
use crate::storage::LocalGraph;
use crate::util::{HaError, StorageError};
use log::debug;

/// Consumes responses from the master on behalf of a slave-bound instance.
pub trait ResponseReceiver: Send + Sync {
    /// Context describing what this node has applied, sent with every request.
    fn slave_context(&self, event_identifier: i32) -> Result<SlaveContext, HaError>;

    /// Applies the transactions piggybacked on a response.
    fn apply_streams(&self, streams: &[TransactionStream]) -> Result<(), HaError>;
}

impl<'a> dyn ResponseReceiver + 'a {
    /// Applies the response's transactions and hands back its payload.
    pub fn receive<T>(&self, response: Response<T>) -> Result<T, HaError> {
        self.apply_streams(response.streams())?;
        Ok(response.into_payload())
    }
}

/// Applies `streams` to `graph`, skipping transactions it already committed.
/// Returns the number of transactions applied.
pub fn apply_streams(
    graph: &dyn LocalGraph,
    streams: &[TransactionStream],
) -> Result<usize, StorageError> {
    let positions = graph.data_sources();
    let mut applied = 0;
    for stream in streams {
        let last: TxId = positions
            .iter()
            .find(|position| position.data_source == stream.data_source)
            .map(|position| position.last_committed_tx)
            .unwrap_or_default();
        let missing = stream
            .transactions
            .iter()
            .position(|tx| tx.tx_id > last)
            .map(|start| &stream.transactions[start..])
            .unwrap_or(&[]);
        if missing.is_empty() {
            continue;
        }
        graph.apply_transactions(&stream.data_source, missing)?;
        debug!(
            "event=transactions_applied data_source={} count={} last_tx={}",
            stream.data_source,
            missing.len(),
            missing.last().map(|tx| tx.tx_id).unwrap_or(last)
        );
        applied += missing.len();
    }
    Ok(applied)
}
