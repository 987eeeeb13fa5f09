use super::{HaNode, NodeState};
use crate::broker::{MasterRef, MasterServer};
use crate::identity::StoreId;
use crate::lifecycle::NodePhase;
use crate::puller::UpdatePuller;
use crate::receiver::ResponseReceiver;
use crate::storage::{LocalGraph, MachineRole, RoleBinding};
use crate::util::{ErrorKind, HaError};
use log::{error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// What one evaluation started; discarded if the evaluation fails.
#[derive(Default)]
struct Started {
    graph: Option<Arc<dyn LocalGraph>>,
    server: Option<Box<dyn MasterServer>>,
}

impl Started {
    fn discard(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(graph) = self.graph.take() {
            if let Err(err) = graph.shutdown() {
                warn!("event=discard_graph_failed role={} error={err}", graph.role());
            }
        }
    }
}

impl HaNode {
    /// Re-evaluates this node's role after the master may have changed.
    ///
    /// Concurrent callers are serialized on the transition lock.
    pub fn new_master(&self, reason: &str) -> Result<(), HaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(match self.slot.cause() {
                Some(cause) => HaError::NotStarted { cause },
                None => HaError::Closed,
            });
        }
        let mut state = self.state.lock();
        self.new_master_locked(&mut state, None, reason)
    }

    pub(super) fn new_master_locked(
        &self,
        state: &mut NodeState,
        store_id: Option<StoreId>,
        reason: &str,
    ) -> Result<(), HaError> {
        info!(
            "event=new_master machine_id={} reason=\"{reason}\"",
            self.machine_id()
        );
        let branched = match self.do_new_master(state, store_id) {
            Err(HaError::BranchedData(branched)) => branched,
            other => return other,
        };

        self.slot.set_phase(NodePhase::BranchedRecovery);
        if let Err(err) = self.get_fresh_database_from_master(state, &branched) {
            return Err(self.fail(state, err));
        }
        info!(
            "event=new_master_retry machine_id={} reason=\"{reason}\" after=\"{branched}\"",
            self.machine_id()
        );
        match self.do_new_master(state, store_id) {
            Err(HaError::BranchedData(again)) => {
                error!(
                    "event=branched_data_after_fresh_copy machine_id={} error={again}",
                    self.machine_id()
                );
                Err(self.fail(state, HaError::BranchedData(again)))
            }
            other => other,
        }
    }

    fn do_new_master(&self, state: &mut NodeState, store_id: Option<StoreId>) -> Result<(), HaError> {
        let err = match self.reevaluate(state, store_id) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match err.kind() {
            ErrorKind::Transient => {
                warn!(
                    "event=reevaluate_failed machine_id={} kind=transient error={err}",
                    self.machine_id()
                );
                Err(err)
            }
            ErrorKind::BranchedData => Err(err),
            ErrorKind::Fatal | ErrorKind::Config => Err(self.fail(state, err)),
        }
    }

    /// Records `err` as the cause of shutdown and stops serving.
    pub(super) fn fail(&self, state: &mut NodeState, err: HaError) -> HaError {
        let cause = match err {
            HaError::Fatal(cause) => cause,
            other => Arc::new(other),
        };
        error!(
            "event=ha_node_fatal machine_id={} error={cause}",
            self.machine_id()
        );
        self.shutdown_locked(state, cause.clone(), false);
        HaError::Fatal(cause)
    }

    fn reevaluate(&self, state: &mut NodeState, store_id: Option<StoreId>) -> Result<(), HaError> {
        let master = self.broker.master(true)?.ok_or(HaError::NoMaster)?;
        info!(
            "event=reevaluate machine_id={} master={} currently_master={}",
            self.machine_id(),
            master,
            current_role(state) == Some(MachineRole::Master)
        );

        let mut started = Started::default();
        let phase = match self.assume_role(state, &master, store_id, &mut started) {
            Ok(phase) => phase,
            Err(err) => {
                started.discard();
                return Err(err);
            }
        };

        if let Some(server) = started.server.take() {
            state.master_server = Some(server);
        }
        if let Some(graph) = started.graph.take() {
            self.after_graph_started(&*graph);
            state.graph = Some(graph);
        }
        if let Some(graph) = &state.graph {
            self.slot.publish(graph.clone(), phase);
        }
        if phase == NodePhase::Slave && state.puller.is_none() {
            if let Some(interval) = self.config.pull_interval {
                match UpdatePuller::start(self.self_ref.clone(), interval) {
                    Ok(puller) => state.puller = Some(puller),
                    Err(err) => warn!(
                        "event=update_puller_start_failed machine_id={} error={err}",
                        self.machine_id()
                    ),
                }
            }
        }
        Ok(())
    }

    fn assume_role(
        &self,
        state: &mut NodeState,
        master: &MasterRef,
        store_id: Option<StoreId>,
        started: &mut Started,
    ) -> Result<NodePhase, HaError> {
        let role = current_role(state);
        if master.is(self.machine_id()) {
            if role != Some(MachineRole::Master) {
                self.internal_shutdown_locked(state, true, NodePhase::Joining);
                let graph = self.start_as_master(store_id)?;
                started.graph = Some(graph.clone());
                started.server = Some(self.broker.instantiate_master_server(graph)?);
            }
            self.broker.rebind_master()?;
            return Ok(NodePhase::Master);
        }

        self.broker.notify_master_changed(&master.machine)?;
        let graph = match state.graph.clone() {
            Some(graph) if role == Some(MachineRole::Slave) => {
                graph.forget_id_allocations_from_master();
                graph
            }
            _ => {
                self.internal_shutdown_locked(state, true, NodePhase::Joining);
                let graph = self.start_as_slave(store_id)?;
                started.graph = Some(graph.clone());
                graph
            }
        };
        self.ensure_data_consistency(state, &*graph, master)?;
        Ok(NodePhase::Slave)
    }

    fn start_as_master(&self, store_id: Option<StoreId>) -> Result<Arc<dyn LocalGraph>, HaError> {
        info!("event=starting_as_master machine_id={}", self.machine_id());
        let binding = RoleBinding::Master {
            broker: self.broker.clone(),
        };
        let graph = self.factory.open(&self.store_dir, store_id, binding)?;
        self.log_ha_info("started as master");
        Ok(graph)
    }

    fn start_as_slave(&self, store_id: Option<StoreId>) -> Result<Arc<dyn LocalGraph>, HaError> {
        info!("event=starting_as_slave machine_id={}", self.machine_id());
        let receiver: Weak<dyn ResponseReceiver> = self.self_ref.clone();
        let binding = RoleBinding::Slave {
            broker: self.broker.clone(),
            receiver,
            tx_reporter: self.config.slave_update_mode.reporter(self.broker.clone()),
            lock_read_timeout: self.config.lock_read_timeout,
            max_concurrent_channels: self.config.max_concurrent_channels_per_slave,
        };
        let graph = self.factory.open(&self.store_dir, store_id, binding)?;
        self.log_ha_info("started as slave");
        Ok(graph)
    }

    fn log_ha_info(&self, started: &str) {
        info!("--- HIGH AVAILABILITY CONFIGURATION START ---");
        info!(
            "machine {} {started} (cluster {}, server {})",
            self.machine_id(),
            self.config.cluster_name,
            self.config.server
        );
        for line in self.broker.status_lines() {
            info!("{line}");
        }
        info!("--- HIGH AVAILABILITY CONFIGURATION END ---");
    }
}

fn current_role(state: &NodeState) -> Option<MachineRole> {
    state.graph.as_ref().map(|graph| graph.role())
}
