use super::{HaNode, NodeState};
use crate::identity::StoreId;
use crate::lifecycle::NodePhase;
use crate::store_copy::copy_store_from_master;
use crate::util::HaError;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

impl HaNode {
    pub(super) fn start_up(&self) -> Result<(), HaError> {
        let mut state = self.state.lock();
        self.slot.set_phase(NodePhase::Joining);
        let store_id = if self.factory.store_exists(&self.store_dir) {
            None
        } else {
            self.join_cluster()?
        };
        self.new_master_locked(&mut state, store_id, "starting up for the first time")?;
        drop(state);
        self.graph()?;
        Ok(())
    }

    /// Obtains a store for an empty node: copies it from an existing master
    /// or, when permitted, founds the cluster. Returns the new store id if
    /// this node founded it.
    fn join_cluster(&self) -> Result<Option<StoreId>, HaError> {
        let timeouts = &self.config.timeouts;
        let started = Instant::now();
        let deadline = started + timeouts.join_deadline;
        let mut last_failure: Option<String> = None;
        while Instant::now() < deadline {
            match self.broker.master(true) {
                Ok(Some(master)) if !master.is(self.machine_id()) && master.handle.is_some() => {
                    if let Some(handle) = &master.handle {
                        match copy_store_from_master(
                            &**handle,
                            self.machine_id(),
                            &self.store_dir,
                            &*self.factory,
                        ) {
                            Ok(store_id) => {
                                info!(
                                    "event=joined_cluster machine_id={} master={} store_id={store_id}",
                                    self.machine_id(),
                                    master.machine_id()
                                );
                                return Ok(None);
                            }
                            Err(err) => {
                                warn!(
                                    "event=join_copy_failed machine_id={} master={} error={err}",
                                    self.machine_id(),
                                    master.machine_id()
                                );
                                last_failure = Some(err.to_string());
                            }
                        }
                    }
                }
                Ok(_) if self.config.allow_init_cluster => {
                    let candidate = StoreId::generate();
                    match self.broker.create_cluster(candidate) {
                        Ok(winner) if winner == candidate => {
                            info!(
                                "event=founded_cluster machine_id={} store_id={candidate}",
                                self.machine_id()
                            );
                            return Ok(Some(candidate));
                        }
                        Ok(winner) => {
                            debug!("event=cluster_creation_lost winner={winner}");
                            last_failure = Some(format!("another machine created cluster {winner}"));
                        }
                        Err(err) => last_failure = Some(err.to_string()),
                    }
                }
                Ok(_) => last_failure = Some("no master found and cluster init not allowed".into()),
                Err(err) => {
                    warn!("event=join_master_lookup_failed machine_id={} error={err}", self.machine_id());
                    last_failure = Some(err.to_string());
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(timeouts.join_poll.min(remaining));
        }
        Err(HaError::JoinTimeout {
            waited: started.elapsed(),
            last_failure,
        })
    }

    /// Stops the puller, the master server and the storage instance.
    pub fn internal_shutdown(&self, rotate_logs: bool) {
        let mut state = self.state.lock();
        self.internal_shutdown_locked(&mut state, rotate_logs, NodePhase::Joining);
    }

    pub(super) fn internal_shutdown_locked(
        &self,
        state: &mut NodeState,
        rotate_logs: bool,
        next: NodePhase,
    ) {
        if let Some(puller) = state.puller.take() {
            info!("event=internal_shutdown step=puller machine_id={}", self.machine_id());
            puller.stop();
        }
        if let Some(server) = state.master_server.take() {
            info!("event=internal_shutdown step=master_server machine_id={}", self.machine_id());
            server.shutdown();
        }
        self.slot.retract(next);
        if let Some(graph) = state.graph.take() {
            if rotate_logs {
                if let Err(err) = graph.rotate_logs() {
                    warn!("event=rotate_logs_failed machine_id={} error={err}", self.machine_id());
                }
            }
            info!(
                "event=internal_shutdown step=graph machine_id={} role={}",
                self.machine_id(),
                graph.role()
            );
            if let Err(err) = graph.shutdown() {
                warn!("event=graph_shutdown_failed machine_id={} error={err}", self.machine_id());
            }
        }
    }

    /// Stops serving and records `cause`; later storage access fails with it.
    pub fn shutdown(&self, cause: HaError, shutdown_broker: bool) {
        let mut state = self.state.lock();
        self.shutdown_locked(&mut state, Arc::new(cause), shutdown_broker);
    }

    pub(super) fn shutdown_locked(
        &self,
        state: &mut NodeState,
        cause: Arc<HaError>,
        shutdown_broker: bool,
    ) {
        info!(
            "event=shutdown machine_id={} shutdown_broker={shutdown_broker} cause=\"{cause}\"",
            self.machine_id()
        );
        self.slot.record_cause(cause, NodePhase::ShuttingDown);
        if shutdown_broker {
            self.broker.shutdown();
        }
        self.internal_shutdown_locked(state, false, NodePhase::ShuttingDown);
        self.slot.set_phase(NodePhase::Stopped);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown(HaError::Closed, true);
    }

    pub(super) fn restart_after_panic(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        error!("event=tx_manager_not_ok machine_id={} action=restart", self.machine_id());
        let mut state = self.state.lock();
        self.internal_shutdown_locked(&mut state, true, NodePhase::Joining);
        if let Err(err) = self.new_master_locked(&mut state, None, "tx manager not ok") {
            error!("event=panic_restart_failed machine_id={} error={err}", self.machine_id());
        }
    }
}
