#![allow(dead_code)]

use graphha::broker::{Broker, Master, MasterChangeListener, MasterRef, MasterServer};
use graphha::config::HaConfig;
use graphha::identity::{Machine, MachineId, StoreId, TxAuthorship, TxId};
use graphha::protocol::{
    CommittedTransaction, DataSourcePosition, Response, SlaveContext, StoreWriter,
    DEFAULT_DATA_SOURCE,
};
use graphha::storage::{
    GraphFactory, KernelEventHandler, LocalGraph, MachineRole, RoleBinding,
    TransactionEventHandler, STORE_FILE_NAME,
};
use graphha::timeouts::HaTimeouts;
use graphha::util::{BrokerError, ComError, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fast_timeouts() -> HaTimeouts {
    HaTimeouts {
        join_deadline: Duration::from_millis(600),
        join_poll: Duration::from_millis(20),
        verify_backoff: Duration::from_millis(10),
        copy_attempts: 3,
        copy_delay: Duration::from_millis(10),
        graph_wait: Some(Duration::from_millis(300)),
    }
}

pub fn config(machine_id: i32, extra: &[(&str, &str)]) -> HaConfig {
    let mut values = HashMap::new();
    values.insert("ha.server_id".to_string(), machine_id.to_string());
    values.insert("ha.coordinators".to_string(), "127.0.0.1:2181".to_string());
    values.insert(
        "ha.server".to_string(),
        format!("127.0.0.1:{}", 6360 + machine_id),
    );
    for (key, value) in extra {
        values.insert(key.to_string(), value.to_string());
    }
    let mut config = HaConfig::from_map(&values).expect("valid test config");
    config.read_timeout = Duration::from_millis(300);
    config.with_timeouts(fast_timeouts())
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn machine(id: i32) -> Machine {
    Machine::new(MachineId::new(id), format!("127.0.0.1:{}", 6360 + id))
}

/// On-disk content of a fake store: its lineage and committed history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreImage {
    pub store_id: StoreId,
    pub last_committed_tx: TxId,
    pub authors: Vec<(TxId, i32)>,
    #[serde(default)]
    pub missing_log: bool,
}

impl StoreImage {
    pub fn new(store_id: StoreId, last_committed_tx: TxId) -> Self {
        Self {
            store_id,
            last_committed_tx,
            authors: Vec::new(),
            missing_log: false,
        }
    }

    pub fn authored(mut self, tx_id: TxId, machine_id: i32) -> Self {
        self.authors.push((tx_id, machine_id));
        self
    }

    pub fn author_of(&self, tx_id: TxId) -> MachineId {
        self.authors
            .iter()
            .find(|(tx, _)| *tx == tx_id)
            .map(|(_, machine)| MachineId::new(*machine))
            .unwrap_or(MachineId::NO_MASTER)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("store image serializes")
    }

    pub fn write_to(&self, store_dir: &Path) {
        fs::create_dir_all(store_dir).unwrap();
        fs::write(store_dir.join(STORE_FILE_NAME), self.to_bytes()).unwrap();
    }

    pub fn read_from(store_dir: &Path) -> Option<Self> {
        let bytes = fs::read(store_dir.join(STORE_FILE_NAME)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Broker

#[derive(Default)]
struct BrokerState {
    master: Option<MasterRef>,
    cluster_store: Option<StoreId>,
    notified: Vec<MachineId>,
    rebinds: usize,
    master_servers: usize,
    last_reported_tx: Option<TxId>,
    listener: Option<Weak<dyn MasterChangeListener>>,
    lookup_failures: usize,
}

pub struct FakeBroker {
    machine_id: MachineId,
    state: Mutex<BrokerState>,
    disconnected: AtomicBool,
    servers_shut_down: Arc<AtomicUsize>,
}

impl FakeBroker {
    pub fn new(machine_id: i32) -> Arc<Self> {
        Arc::new(Self {
            machine_id: MachineId::new(machine_id),
            state: Mutex::new(BrokerState::default()),
            disconnected: AtomicBool::new(false),
            servers_shut_down: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_master_self(&self) {
        self.state.lock().master = Some(MasterRef::new(None, machine(self.machine_id.get())));
    }

    pub fn set_master(&self, master: &Arc<FakeMaster>) {
        let handle: Arc<dyn Master> = master.clone();
        self.state.lock().master =
            Some(MasterRef::new(Some(handle), machine(master.machine_id.get())));
    }

    /// Known master without a reachable handle.
    pub fn set_master_unreachable(&self, machine_id: i32) {
        self.state.lock().master = Some(MasterRef::new(None, machine(machine_id)));
    }

    pub fn clear_master(&self) {
        self.state.lock().master = None;
    }

    pub fn fail_next_lookups(&self, count: usize) {
        self.state.lock().lookup_failures = count;
    }

    pub fn current_master(&self) -> Option<MachineId> {
        self.state
            .lock()
            .master
            .as_ref()
            .map(|master| master.machine_id())
    }

    pub fn cluster_store(&self) -> Option<StoreId> {
        self.state.lock().cluster_store
    }

    pub fn set_cluster_store(&self, store_id: StoreId) {
        self.state.lock().cluster_store = Some(store_id);
    }

    pub fn notified(&self) -> Vec<MachineId> {
        self.state.lock().notified.clone()
    }

    pub fn rebinds(&self) -> usize {
        self.state.lock().rebinds
    }

    pub fn master_servers(&self) -> usize {
        self.state.lock().master_servers
    }

    pub fn master_servers_shut_down(&self) -> usize {
        self.servers_shut_down.load(Ordering::SeqCst)
    }

    pub fn last_reported_tx(&self) -> Option<TxId> {
        self.state.lock().last_reported_tx
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.state
            .lock()
            .listener
            .as_ref()
            .and_then(|listener| listener.upgrade())
            .is_some()
    }

    /// Delivers a master-changed signal the way a coordination callback would.
    pub fn fire_master_changed(&self, reason: &str) {
        let listener = self
            .state
            .lock()
            .listener
            .as_ref()
            .and_then(|listener| listener.upgrade());
        if let Some(listener) = listener {
            listener.master_changed(reason);
        }
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(BrokerError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl Broker for FakeBroker {
    fn master(&self, _force_refresh: bool) -> Result<Option<MasterRef>, BrokerError> {
        self.check_connected()?;
        let mut state = self.state.lock();
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(BrokerError::Disconnected("connection loss".into()));
        }
        Ok(state.master.clone())
    }

    fn create_cluster(&self, candidate: StoreId) -> Result<StoreId, BrokerError> {
        self.check_connected()?;
        let mut state = self.state.lock();
        match state.cluster_store {
            Some(existing) => Ok(existing),
            None => {
                state.cluster_store = Some(candidate);
                state.master = Some(MasterRef::new(None, machine(self.machine_id.get())));
                Ok(candidate)
            }
        }
    }

    fn notify_master_changed(&self, master: &Machine) -> Result<(), BrokerError> {
        self.check_connected()?;
        self.state.lock().notified.push(master.machine_id);
        Ok(())
    }

    fn rebind_master(&self) -> Result<(), BrokerError> {
        self.check_connected()?;
        self.state.lock().rebinds += 1;
        Ok(())
    }

    fn instantiate_master_server(
        &self,
        _graph: Arc<dyn LocalGraph>,
    ) -> Result<Box<dyn MasterServer>, BrokerError> {
        self.state.lock().master_servers += 1;
        Ok(Box::new(FakeMasterServer {
            shut_down: self.servers_shut_down.clone(),
        }))
    }

    fn set_last_committed_tx(&self, tx_id: TxId) -> Result<(), BrokerError> {
        self.check_connected()?;
        self.state.lock().last_reported_tx = Some(tx_id);
        Ok(())
    }

    fn i_am_master(&self) -> bool {
        self.state
            .lock()
            .master
            .as_ref()
            .map(|master| master.is(self.machine_id))
            .unwrap_or(false)
    }

    fn attach_listener(&self, listener: Weak<dyn MasterChangeListener>) {
        self.state.lock().listener = Some(listener);
    }

    fn status_lines(&self) -> Vec<String> {
        vec![format!("MachineId: {}", self.machine_id)]
    }

    fn shutdown(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

struct FakeMasterServer {
    shut_down: Arc<AtomicUsize>,
}

impl MasterServer for FakeMasterServer {
    fn shutdown(&self) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Master

pub struct FakeMaster {
    pub machine_id: MachineId,
    image: Mutex<StoreImage>,
    extra_files: Vec<(String, Vec<u8>)>,
    committed: Mutex<Vec<CommittedTransaction>>,
    claimed_authors: Mutex<HashMap<TxId, TxAuthorship>>,
    copy_failures: AtomicUsize,
    authorship_failures: AtomicUsize,
    unreachable: AtomicBool,
    copies: AtomicUsize,
    pulls: AtomicUsize,
    authorship_queries: AtomicUsize,
}

impl FakeMaster {
    pub fn new(machine_id: i32, image: StoreImage) -> Arc<Self> {
        Arc::new(Self {
            machine_id: MachineId::new(machine_id),
            image: Mutex::new(image),
            extra_files: vec![
                ("nioneo_logical.log.v3".to_string(), b"history".to_vec()),
                ("index/lucene.db".to_string(), b"index".to_vec()),
            ],
            committed: Mutex::new(Vec::new()),
            claimed_authors: Mutex::new(HashMap::new()),
            copy_failures: AtomicUsize::new(0),
            authorship_failures: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            copies: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            authorship_queries: AtomicUsize::new(0),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.image.lock().store_id
    }

    /// Commits a transaction on the master; slaves see it on their next pull.
    pub fn commit(&self, tx_id: TxId) {
        let mut image = self.image.lock();
        image.last_committed_tx = tx_id;
        image.authors.push((tx_id, self.machine_id.get()));
        self.committed
            .lock()
            .push(CommittedTransaction::new(tx_id, self.machine_id, b"tx".to_vec()));
    }

    /// Answers authorship queries for `tx_id` with `machine_id`, whatever the store says.
    pub fn claim_author(&self, tx_id: TxId, machine_id: i32) {
        self.claim_authorship(tx_id, TxAuthorship::new(MachineId::new(machine_id), tx_id));
    }

    /// Answers authorship queries for `tx_id` with exactly `answer`.
    pub fn claim_authorship(&self, tx_id: TxId, answer: TxAuthorship) {
        self.claimed_authors.lock().insert(tx_id, answer);
    }

    pub fn fail_copies(&self, count: usize) {
        self.copy_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_authorship_queries(&self, count: usize) {
        self.authorship_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn authorship_queries(&self) -> usize {
        self.authorship_queries.load(Ordering::SeqCst)
    }

    fn unreachable_error(&self) -> ComError {
        ComError::Unreachable {
            address: format!("127.0.0.1:{}", 6360 + self.machine_id.get()),
            reason: "connection refused".into(),
        }
    }

    fn transactions_after(&self, last: TxId) -> Vec<CommittedTransaction> {
        self.committed
            .lock()
            .iter()
            .filter(|tx| tx.tx_id > last)
            .cloned()
            .collect()
    }
}

impl Master for FakeMaster {
    fn copy_store(
        &self,
        _context: &SlaveContext,
        writer: &mut dyn StoreWriter,
    ) -> Result<Response<()>, ComError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }
        if self
            .copy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(ComError::Timeout(Duration::from_millis(20)));
        }
        let image = self.image.lock().clone();
        writer.write(STORE_FILE_NAME, &mut image.to_bytes().as_slice())?;
        for (path, data) in &self.extra_files {
            writer.write(path, &mut data.as_slice())?;
        }
        writer.done()?;
        Ok(Response::new((), image.store_id)
            .with_transactions(DEFAULT_DATA_SOURCE, self.transactions_after(image.last_committed_tx)))
    }

    fn master_id_for_committed_tx(
        &self,
        tx_id: TxId,
        _store_id: StoreId,
    ) -> Result<Response<TxAuthorship>, ComError> {
        self.authorship_queries.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }
        if self
            .authorship_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(ComError::Timeout(Duration::from_millis(20)));
        }
        let image = self.image.lock();
        let author = match self.claimed_authors.lock().get(&tx_id) {
            Some(answer) => *answer,
            None => TxAuthorship::new(image.author_of(tx_id), tx_id),
        };
        Ok(Response::new(author, image.store_id))
    }

    fn pull_updates(&self, context: &SlaveContext) -> Result<Response<()>, ComError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }
        let last = context.last_applied_for(DEFAULT_DATA_SOURCE).unwrap_or_default();
        Ok(Response::new((), self.store_id())
            .with_transactions(DEFAULT_DATA_SOURCE, self.transactions_after(last)))
    }
}

// ---------------------------------------------------------------------------
// Storage engine

pub struct FakeGraph {
    role: MachineRole,
    store_dir: PathBuf,
    image: StoreImage,
    last_committed: AtomicU64,
    applied: Mutex<Vec<TxId>>,
    running: AtomicBool,
    nodes: AtomicU64,
    rotations: AtomicUsize,
    kernel_handlers: Mutex<Vec<Arc<dyn KernelEventHandler>>>,
    tx_handlers: Mutex<Vec<Arc<dyn TransactionEventHandler>>>,
    forgotten_allocations: AtomicUsize,
    active: Arc<AtomicUsize>,
    binding: Mutex<Option<RoleBinding>>,
}

impl FakeGraph {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<TxId> {
        self.applied.lock().clone()
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn kernel_handler_count(&self) -> usize {
        self.kernel_handlers.lock().len()
    }

    pub fn transaction_handler_count(&self) -> usize {
        self.tx_handlers.lock().len()
    }

    pub fn forgotten_allocations(&self) -> usize {
        self.forgotten_allocations.load(Ordering::SeqCst)
    }

    /// Simulates the engine reporting a commit to its slave binding.
    pub fn report_commit(&self, tx_id: TxId) {
        if let Some(RoleBinding::Slave { tx_reporter, .. }) = &*self.binding.lock() {
            tx_reporter.report(tx_id);
        }
    }

    /// Raises a kernel panic on every registered kernel handler.
    pub fn panic_kernel(&self, error: graphha::storage::ErrorState) {
        let handlers = self.kernel_handlers.lock().clone();
        for handler in handlers {
            handler.kernel_panic(error);
        }
    }

    fn check_running(&self) -> Result<(), StorageError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StorageError::NotRunning)
        }
    }
}

impl LocalGraph for FakeGraph {
    fn role(&self) -> MachineRole {
        self.role
    }

    fn store_id(&self) -> StoreId {
        self.image.store_id
    }

    fn last_committed_tx_id(&self) -> TxId {
        self.last_committed.load(Ordering::SeqCst)
    }

    fn master_for_committed_tx(&self, tx_id: TxId) -> Result<TxAuthorship, StorageError> {
        if self.image.missing_log {
            return Err(StorageError::NoSuchLogVersion { version: 0 });
        }
        Ok(TxAuthorship::new(self.image.author_of(tx_id), tx_id))
    }

    fn data_sources(&self) -> Vec<DataSourcePosition> {
        vec![DataSourcePosition::new(
            DEFAULT_DATA_SOURCE,
            self.last_committed_tx_id(),
        )]
    }

    fn apply_transactions(
        &self,
        data_source: &str,
        transactions: &[CommittedTransaction],
    ) -> Result<(), StorageError> {
        self.check_running()?;
        if data_source != DEFAULT_DATA_SOURCE {
            return Err(StorageError::UnknownDataSource(data_source.to_string()));
        }
        let mut applied = self.applied.lock();
        for tx in transactions {
            applied.push(tx.tx_id);
            self.last_committed.fetch_max(tx.tx_id, Ordering::SeqCst);
        }
        Ok(())
    }

    fn rotate_logs(&self) -> Result<(), StorageError> {
        self.check_running()?;
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn forget_id_allocations_from_master(&self) {
        self.forgotten_allocations.fetch_add(1, Ordering::SeqCst);
    }

    fn register_kernel_event_handler(&self, handler: Arc<dyn KernelEventHandler>) {
        self.kernel_handlers.lock().push(handler);
    }

    fn unregister_kernel_event_handler(&self, handler: &Arc<dyn KernelEventHandler>) -> bool {
        let mut handlers = self.kernel_handlers.lock();
        let before = handlers.len();
        handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        handlers.len() != before
    }

    fn register_transaction_event_handler(&self, handler: Arc<dyn TransactionEventHandler>) {
        self.tx_handlers.lock().push(handler);
    }

    fn unregister_transaction_event_handler(
        &self,
        handler: &Arc<dyn TransactionEventHandler>,
    ) -> bool {
        let mut handlers = self.tx_handlers.lock();
        let before = handlers.len();
        handlers.retain(|existing| !Arc::ptr_eq(existing, handler));
        handlers.len() != before
    }

    fn create_node(&self) -> Result<u64, StorageError> {
        self.check_running()?;
        Ok(self.nodes.fetch_add(1, Ordering::SeqCst))
    }

    fn shutdown(&self) -> Result<(), StorageError> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.binding.lock().take();
        }
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    graphs: Vec<Arc<FakeGraph>>,
    opened: Vec<(MachineRole, PathBuf)>,
    copy_opens: usize,
    log_versions: Vec<u64>,
    fail_opens: usize,
}

#[derive(Default)]
pub struct FakeGraphFactory {
    state: Mutex<FactoryState>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl FakeGraphFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn opened_roles(&self) -> Vec<MachineRole> {
        self.state
            .lock()
            .opened
            .iter()
            .map(|(role, _)| *role)
            .collect()
    }

    pub fn graphs(&self) -> Vec<Arc<FakeGraph>> {
        self.state.lock().graphs.clone()
    }

    pub fn latest(&self) -> Option<Arc<FakeGraph>> {
        self.state.lock().graphs.last().cloned()
    }

    pub fn copy_opens(&self) -> usize {
        self.state.lock().copy_opens
    }

    pub fn log_versions(&self) -> Vec<u64> {
        self.state.lock().log_versions.clone()
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }

    fn start_graph(
        &self,
        store_dir: &Path,
        role: MachineRole,
        image: StoreImage,
        binding: Option<RoleBinding>,
    ) -> Arc<FakeGraph> {
        let graph = Arc::new(FakeGraph {
            role,
            store_dir: store_dir.to_path_buf(),
            last_committed: AtomicU64::new(image.last_committed_tx),
            image,
            applied: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            nodes: AtomicU64::new(0),
            rotations: AtomicUsize::new(0),
            kernel_handlers: Mutex::new(Vec::new()),
            tx_handlers: Mutex::new(Vec::new()),
            forgotten_allocations: AtomicUsize::new(0),
            active: self.active.clone(),
            binding: Mutex::new(binding),
        });
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        graph
    }
}

impl GraphFactory for FakeGraphFactory {
    fn open(
        &self,
        store_dir: &Path,
        store_id: Option<StoreId>,
        binding: RoleBinding,
    ) -> Result<Arc<dyn LocalGraph>, StorageError> {
        {
            let mut state = self.state.lock();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(StorageError::Other("store locked".into()));
            }
        }
        let image = match (StoreImage::read_from(store_dir), store_id) {
            (_, Some(store_id)) => {
                let image = StoreImage::new(store_id, 0);
                image.write_to(store_dir);
                image
            }
            (Some(image), None) => image,
            (None, None) => {
                let image = StoreImage::new(StoreId::generate(), 0);
                image.write_to(store_dir);
                image
            }
        };
        let role = binding.role();
        let graph = self.start_graph(store_dir, role, image, Some(binding));
        let mut state = self.state.lock();
        state.opened.push((role, store_dir.to_path_buf()));
        state.graphs.push(graph.clone());
        Ok(graph)
    }

    fn open_for_copy(&self, store_dir: &Path) -> Result<Arc<dyn LocalGraph>, StorageError> {
        let image = StoreImage::read_from(store_dir)
            .ok_or_else(|| StorageError::Other("no store image after copy".into()))?;
        let graph = self.start_graph(store_dir, MachineRole::Slave, image, None);
        self.state.lock().copy_opens += 1;
        Ok(graph)
    }

    fn set_log_version(&self, _store_dir: &Path, version: u64) -> Result<(), StorageError> {
        self.state.lock().log_versions.push(version);
        Ok(())
    }
}
