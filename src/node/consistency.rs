use super::{HaNode, NodeState};
use crate::broker::MasterRef;
use crate::lifecycle::NodePhase;
use crate::storage::LocalGraph;
use crate::util::{BranchedData, HaError, RetryPolicy, StorageError};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread;

impl HaNode {
    /// Verifies that the master agrees on who authored this node's last
    /// committed transaction. A disagreement means the local history forked.
    pub(super) fn ensure_data_consistency(
        &self,
        state: &mut NodeState,
        graph: &dyn LocalGraph,
        master: &MasterRef,
    ) -> Result<(), HaError> {
        if master.is(self.machine_id()) {
            return Ok(());
        }
        let Some(handle) = master.handle.clone() else {
            return Err(HaError::MasterUnavailable(master.machine_id()));
        };

        let tx_id = graph.last_committed_tx_id();
        let local = match graph.master_for_committed_tx(tx_id) {
            Ok(author) => author,
            Err(StorageError::NoSuchLogVersion { version }) => {
                info!(
                    "event=consistency_vacuous machine_id={} tx={tx_id} missing_log_version={version}",
                    self.machine_id()
                );
                return Ok(());
            }
            Err(StorageError::Io(err)) => {
                warn!(
                    "event=consistency_lookup_failed machine_id={} tx={tx_id} error={err}",
                    self.machine_id()
                );
                return Ok(());
            }
            Err(err) => {
                return Err(BranchedData::unverifiable(
                    self.machine_id(),
                    master.machine_id(),
                    tx_id,
                    err,
                )
                .into())
            }
        };

        let store_id = graph.store_id();
        let mut retry = RetryPolicy::fixed(usize::MAX, self.config.timeouts.verify_backoff)
            .with_time_budget(Some(self.config.read_timeout))
            .handle();
        let remote = loop {
            match handle.master_id_for_committed_tx(tx_id, store_id) {
                Ok(response) => break response.into_payload(),
                Err(err) => match retry.next_delay() {
                    Some(delay) => {
                        debug!(
                            "event=consistency_query_retry tx={tx_id} attempt={} error={err}",
                            retry.attempts()
                        );
                        thread::sleep(delay);
                    }
                    None => {
                        error!(
                            "event=consistency_query_timeout machine_id={} master={} tx={tx_id} error={err}",
                            self.machine_id(),
                            master.machine_id()
                        );
                        return Err(HaError::Fatal(Arc::new(HaError::Communication(err))));
                    }
                },
            }
        };

        if !local.machine_id.is_no_master() && local != remote {
            let branched =
                BranchedData::diverged(self.machine_id(), master.machine_id(), tx_id, local, remote);
            error!("event=branched_data machine_id={} error={branched}", self.machine_id());
            self.internal_shutdown_locked(state, false, NodePhase::BranchedRecovery);
            self.slot.record_cause(
                Arc::new(HaError::BranchedData(branched.clone())),
                NodePhase::BranchedRecovery,
            );
            return Err(branched.into());
        }

        info!(
            "event=consistency_verified machine_id={} master={} tx={tx_id} author={}",
            self.machine_id(),
            master.machine_id(),
            remote.machine_id
        );
        Ok(())
    }
}
