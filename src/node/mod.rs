//! The HA node: owns the role-bound storage instance and moves it between
//! master and slave as the coordination service dictates.
//!
//! Every role transition, startup and shutdown runs under `state`, the
//! node-wide transition lock. The published instance lives in a
//! [`GraphSlot`] so readers never contend with a transition in progress.

mod consistency;
mod evaluator;
mod recovery;
mod startup;

use crate::broker::{Broker, MasterChangeListener, MasterServer};
use crate::config::HaConfig;
use crate::identity::{MachineId, TxId};
use crate::lifecycle::{GraphSlot, NodePhase};
use crate::protocol::{SlaveContext, TransactionStream};
use crate::puller::UpdatePuller;
use crate::receiver::{self, ResponseReceiver};
use crate::status::HaStatus;
use crate::storage::{
    ErrorState, GraphFactory, KernelEventHandler, LocalGraph, TransactionEventHandler,
};
use crate::util::{ErrorKind, HaError};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// State only touched while holding the transition lock.
#[derive(Default)]
struct NodeState {
    graph: Option<Arc<dyn LocalGraph>>,
    master_server: Option<Box<dyn MasterServer>>,
    puller: Option<UpdatePuller>,
}

pub struct HaNode {
    self_ref: Weak<HaNode>,
    config: HaConfig,
    store_dir: PathBuf,
    broker: Arc<dyn Broker>,
    factory: Arc<dyn GraphFactory>,
    state: Mutex<NodeState>,
    slot: GraphSlot,
    kernel_handlers: RwLock<Vec<Arc<dyn KernelEventHandler>>>,
    tx_handlers: RwLock<Vec<Arc<dyn TransactionEventHandler>>>,
    startup_time_ms: u64,
    last_update_ms: AtomicU64,
    closed: AtomicBool,
}

impl HaNode {
    /// Joins (or founds) the cluster and blocks until this node serves as
    /// master or slave.
    pub fn start(
        store_dir: impl Into<PathBuf>,
        config: HaConfig,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn GraphFactory>,
    ) -> Result<Arc<Self>, HaError> {
        let node = Arc::new_cyclic(|self_ref: &Weak<HaNode>| HaNode {
            self_ref: self_ref.clone(),
            config,
            store_dir: store_dir.into(),
            broker,
            factory,
            state: Mutex::new(NodeState::default()),
            slot: GraphSlot::new(),
            kernel_handlers: RwLock::new(Vec::new()),
            tx_handlers: RwLock::new(Vec::new()),
            startup_time_ms: now_ms(),
            last_update_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        node.kernel_handlers.write().push(Arc::new(TxManagerPanicRestart {
            node: node.self_ref.clone(),
        }));
        let listener: Weak<dyn MasterChangeListener> = node.self_ref.clone();
        node.broker.attach_listener(listener);

        info!(
            "event=ha_node_starting machine_id={} store_dir={} cluster={}",
            node.machine_id(),
            node.store_dir.display(),
            node.config.cluster_name
        );
        if let Err(err) = node.start_up() {
            error!("event=ha_node_start_failed machine_id={} error={err}", node.machine_id());
            if node.phase() != NodePhase::Stopped {
                node.internal_shutdown(false);
            }
            return Err(err);
        }
        Ok(node)
    }

    /// Parses `values` and starts the node. Configuration errors surface
    /// before the disk or the network is touched.
    pub fn from_map(
        store_dir: impl Into<PathBuf>,
        values: &HashMap<String, String>,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn GraphFactory>,
    ) -> Result<Arc<Self>, HaError> {
        let config = HaConfig::from_map(values)?;
        Self::start(store_dir, config, broker, factory)
    }

    pub fn machine_id(&self) -> MachineId {
        self.config.machine_id
    }

    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn phase(&self) -> NodePhase {
        self.slot.phase()
    }

    /// Asks the coordination service, not the local phase.
    pub fn is_master(&self) -> bool {
        self.broker.i_am_master()
    }

    /// The active instance, waiting a bounded time for a transition in progress.
    pub fn graph(&self) -> Result<Arc<dyn LocalGraph>, HaError> {
        self.slot.wait(self.config.graph_wait())
    }

    pub fn create_node(&self) -> Result<u64, HaError> {
        Ok(self.graph()?.create_node()?)
    }

    pub fn last_committed_tx_id(&self) -> Result<TxId, HaError> {
        Ok(self.graph()?.last_committed_tx_id())
    }

    /// Epoch millis of the last applied master response; 0 if none yet.
    pub fn last_update_time(&self) -> u64 {
        self.last_update_ms.load(Ordering::Acquire)
    }

    pub fn cause_of_shutdown(&self) -> Option<Arc<HaError>> {
        self.slot.cause()
    }

    /// Drops the coordination session, as a network partition would.
    pub fn shutdown_broker(&self) {
        info!("event=broker_shutdown machine_id={}", self.machine_id());
        self.broker.shutdown();
    }

    pub fn register_kernel_event_handler(&self, handler: Arc<dyn KernelEventHandler>) {
        self.kernel_handlers.write().push(handler.clone());
        if let Some(graph) = self.slot.current() {
            graph.register_kernel_event_handler(handler);
        }
    }

    pub fn unregister_kernel_event_handler(
        &self,
        handler: &Arc<dyn KernelEventHandler>,
    ) -> Result<bool, HaError> {
        Ok(self.graph()?.unregister_kernel_event_handler(handler))
    }

    pub fn register_transaction_event_handler(&self, handler: Arc<dyn TransactionEventHandler>) {
        self.tx_handlers.write().push(handler.clone());
        if let Some(graph) = self.slot.current() {
            graph.register_transaction_event_handler(handler);
        }
    }

    pub fn unregister_transaction_event_handler(
        &self,
        handler: &Arc<dyn TransactionEventHandler>,
    ) -> Result<bool, HaError> {
        Ok(self.graph()?.unregister_transaction_event_handler(handler))
    }

    pub fn status(&self) -> HaStatus {
        let phase = self.slot.phase();
        HaStatus {
            machine_id: self.machine_id(),
            cluster_name: self.config.cluster_name.clone(),
            server: self.config.server.clone(),
            phase,
            is_master: phase == NodePhase::Master,
            last_update_ms: self.last_update_time(),
            cause_of_shutdown: self.slot.cause().map(|cause| cause.to_string()),
        }
    }

    /// Pulls every transaction this slave is missing from the master.
    ///
    /// A no-op on the master. Coordination and communication failures
    /// trigger a role re-evaluation and are returned to the caller.
    pub fn pull_updates(&self) -> Result<(), HaError> {
        if self.slot.phase() == NodePhase::Master {
            return Ok(());
        }
        let result = self.pull_from_master();
        if let Err(err) = &result {
            if err.kind() == ErrorKind::Transient || matches!(err, HaError::MasterUnavailable(_)) {
                if let Err(again) = self.new_master(&format!("pull updates failed: {err}")) {
                    warn!("event=new_master_after_pull_failed error={again}");
                }
            }
        }
        result
    }

    fn pull_from_master(&self) -> Result<(), HaError> {
        let mut master = self.broker.master(false)?;
        if master.is_none() {
            self.new_master("no master known when pulling updates")?;
            master = self.broker.master(false)?;
        }
        let master = master.ok_or(HaError::NoMaster)?;
        let handle = master
            .handle
            .clone()
            .ok_or(HaError::MasterUnavailable(master.machine_id()))?;
        let context = self.slave_context(-1)?;
        let response = handle.pull_updates(&context)?;
        let this: &dyn ResponseReceiver = self;
        this.receive(response)
    }

    /// Replays registered handlers onto a freshly started instance.
    fn after_graph_started(&self, graph: &dyn LocalGraph) {
        self.broker.set_connection_information(graph);
        for handler in self.kernel_handlers.read().iter() {
            graph.register_kernel_event_handler(handler.clone());
        }
        for handler in self.tx_handlers.read().iter() {
            graph.register_transaction_event_handler(handler.clone());
        }
    }

    fn update_time(&self) {
        self.last_update_ms.store(now_ms(), Ordering::Release);
    }

    /// Runs a role re-evaluation on its own thread. Used for signals that
    /// may arrive while the caller sits inside a broker or engine call.
    fn request_new_master(&self, reason: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let node = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name("ha-new-master".into())
            .spawn(move || {
                if let Some(node) = node.upgrade() {
                    if let Err(err) = node.new_master(&reason) {
                        warn!("event=new_master_failed reason=\"{reason}\" error={err}");
                    }
                }
            });
        if let Err(err) = spawned {
            error!("event=new_master_spawn_failed error={err}");
        }
    }
}

impl fmt::Debug for HaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaNode")
            .field("machine_id", &self.machine_id())
            .field("phase", &self.slot.phase())
            .field("store_dir", &self.store_dir)
            .finish_non_exhaustive()
    }
}

impl MasterChangeListener for HaNode {
    fn master_changed(&self, reason: &str) {
        self.request_new_master(reason.to_string());
    }
}

impl ResponseReceiver for HaNode {
    fn slave_context(&self, event_identifier: i32) -> Result<SlaveContext, HaError> {
        let graph = self.graph()?;
        Ok(SlaveContext::new(
            self.startup_time_ms,
            self.machine_id(),
            event_identifier,
            graph.data_sources(),
        ))
    }

    fn apply_streams(&self, streams: &[TransactionStream]) -> Result<(), HaError> {
        let applied = self
            .graph()
            .and_then(|graph| receiver::apply_streams(&*graph, streams).map_err(HaError::from));
        match applied {
            Ok(_) => {
                self.update_time();
                Ok(())
            }
            Err(err) => {
                warn!("event=receive_failed machine_id={} error={err}", self.machine_id());
                self.request_new_master(format!("failed to apply transactions from master: {err}"));
                Err(err)
            }
        }
    }
}

/// Restarts the node when the transaction manager reports it can no longer commit.
struct TxManagerPanicRestart {
    node: Weak<HaNode>,
}

impl KernelEventHandler for TxManagerPanicRestart {
    fn kernel_panic(&self, error: ErrorState) {
        if error != ErrorState::TxManagerNotOk {
            return;
        }
        let node = self.node.clone();
        let spawned = thread::Builder::new()
            .name("ha-panic-restart".into())
            .spawn(move || {
                if let Some(node) = node.upgrade() {
                    node.restart_after_panic();
                }
            });
        if let Err(err) = spawned {
            error!("event=panic_restart_spawn_failed error={err}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
