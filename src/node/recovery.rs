use super::{HaNode, NodeState};
use crate::branched::PolicyOutcome;
use crate::broker::MasterRef;
use crate::lifecycle::NodePhase;
use crate::store_copy::copy_store_from_master;
use crate::util::{BranchedData, HaError, RetryPolicy};
use log::{info, warn};
use std::thread;

impl HaNode {
    /// Moves the branched store out of the way per the configured policy and
    /// replaces it with a fresh copy from the master.
    pub(super) fn get_fresh_database_from_master(
        &self,
        state: &mut NodeState,
        branched: &BranchedData,
    ) -> Result<(), HaError> {
        let master = self.broker.master(true)?.ok_or(HaError::NoMaster)?;
        self.internal_shutdown_locked(state, false, NodePhase::BranchedRecovery);

        let policy = self.config.branched_data_policy;
        info!(
            "event=branched_data_policy machine_id={} policy={policy} store_dir={}",
            self.machine_id(),
            self.store_dir.display()
        );
        match policy.handle(&self.store_dir)? {
            PolicyOutcome::ShutdownNode => {
                return Err(HaError::BranchedDataShutdown(branched.clone()))
            }
            PolicyOutcome::Quarantined(dir) => {
                info!("event=branched_data_kept quarantine={}", dir.display())
            }
            PolicyOutcome::Deleted => {}
        }
        self.copy_store_with_retry(master)
    }

    /// Copies the store, re-resolving the master between failed attempts.
    pub(super) fn copy_store_with_retry(&self, master: MasterRef) -> Result<(), HaError> {
        let timeouts = &self.config.timeouts;
        let mut retry = RetryPolicy::fixed(timeouts.copy_attempts, timeouts.copy_delay).handle();
        let mut master = master;
        loop {
            let copied = match &master.handle {
                Some(handle) if !master.is(self.machine_id()) => copy_store_from_master(
                    &**handle,
                    self.machine_id(),
                    &self.store_dir,
                    &*self.factory,
                ),
                _ => Err(HaError::MasterUnavailable(master.machine_id())),
            };
            let err = match copied {
                Ok(store_id) => {
                    info!(
                        "event=fresh_store_copied machine_id={} master={} store_id={store_id}",
                        self.machine_id(),
                        master.machine_id()
                    );
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(
                "event=store_copy_failed machine_id={} attempt={} error={err}",
                self.machine_id(),
                retry.attempts()
            );
            let Some(delay) = retry.next_delay() else {
                return Err(HaError::CopyExhausted {
                    attempts: retry.attempts(),
                    source: Box::new(err),
                });
            };
            thread::sleep(delay);
            match self.broker.master(true) {
                Ok(Some(resolved)) => master = resolved,
                Ok(None) => warn!("event=store_copy_no_master machine_id={}", self.machine_id()),
                Err(err) => warn!(
                    "event=store_copy_master_lookup_failed machine_id={} error={err}",
                    self.machine_id()
                ),
            }
        }
    }
}
