//! How a slave reports its last committed transaction to the coordination service.

use crate::broker::Broker;
use crate::config::ConfigError;
use crate::identity::TxId;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlaveUpdateMode {
    Sync,
    #[default]
    Async,
    None,
}

impl SlaveUpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaveUpdateMode::Sync => "sync",
            SlaveUpdateMode::Async => "async",
            SlaveUpdateMode::None => "none",
        }
    }

    /// Whether the coordination service is kept informed at all.
    pub fn syncs_with_coordinator(&self) -> bool {
        !matches!(self, SlaveUpdateMode::None)
    }

    pub fn reporter(&self, broker: Arc<dyn Broker>) -> LastTxReporter {
        match self {
            SlaveUpdateMode::Sync => LastTxReporter::Sync(broker),
            SlaveUpdateMode::Async => LastTxReporter::Async(AsyncTxReporter::spawn(broker)),
            SlaveUpdateMode::None => LastTxReporter::Disabled,
        }
    }
}

impl FromStr for SlaveUpdateMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "sync" => Ok(SlaveUpdateMode::Sync),
            "async" => Ok(SlaveUpdateMode::Async),
            "none" => Ok(SlaveUpdateMode::None),
            other => Err(ConfigError::UnknownUpdateMode(other.to_string())),
        }
    }
}

impl fmt::Display for SlaveUpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called by a slave-bound engine after each commit.
pub enum LastTxReporter {
    Sync(Arc<dyn Broker>),
    Async(AsyncTxReporter),
    Disabled,
}

impl LastTxReporter {
    pub fn report(&self, tx_id: TxId) {
        match self {
            LastTxReporter::Sync(broker) => {
                if let Err(err) = broker.set_last_committed_tx(tx_id) {
                    warn!("event=last_tx_report_failed tx={tx_id} error={err}");
                }
            }
            LastTxReporter::Async(reporter) => reporter.offer(tx_id),
            LastTxReporter::Disabled => {}
        }
    }
}

impl fmt::Debug for LastTxReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastTxReporter::Sync(_) => f.write_str("Sync"),
            LastTxReporter::Async(_) => f.write_str("Async"),
            LastTxReporter::Disabled => f.write_str("Disabled"),
        }
    }
}

#[derive(Default)]
struct ReporterState {
    pending: Option<TxId>,
    stopped: bool,
}

struct ReporterShared {
    state: Mutex<ReporterState>,
    wakeup: Condvar,
}

/// Background reporter; only the most recent transaction id is published.
pub struct AsyncTxReporter {
    shared: Arc<ReporterShared>,
    join: Option<thread::JoinHandle<()>>,
}

impl AsyncTxReporter {
    fn spawn(broker: Arc<dyn Broker>) -> Self {
        let shared = Arc::new(ReporterShared {
            state: Mutex::new(ReporterState::default()),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        let join = thread::Builder::new()
            .name("last-tx-reporter".into())
            .spawn(move || loop {
                let tx_id = {
                    let mut state = worker.state.lock();
                    while state.pending.is_none() && !state.stopped {
                        worker.wakeup.wait(&mut state);
                    }
                    match state.pending.take() {
                        Some(tx_id) => tx_id,
                        None => break,
                    }
                };
                if let Err(err) = broker.set_last_committed_tx(tx_id) {
                    warn!("event=last_tx_report_failed tx={tx_id} error={err}");
                }
            });
        let join = match join {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("event=last_tx_reporter_spawn_failed error={err}");
                None
            }
        };
        Self { shared, join }
    }

    pub fn offer(&self, tx_id: TxId) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.pending = Some(state.pending.map_or(tx_id, |pending| pending.max(tx_id)));
        self.shared.wakeup.notify_one();
    }
}

impl Drop for AsyncTxReporter {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.join.take() {
            if handle.join().is_err() {
                debug!("event=last_tx_reporter_panicked");
            }
        }
    }
}
