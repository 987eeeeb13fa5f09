//! Periodic pull of committed transactions from the master.

use crate::node::HaNode;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

struct PullerShared {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// Fixed-delay pull loop running on its own thread while the node is a slave.
///
/// The first pull happens one interval after start. Failures are logged and
/// the loop continues. Stopping never joins the thread: a pull in flight may
/// itself be stopping the puller through a role change.
pub struct UpdatePuller {
    shared: Arc<PullerShared>,
    interval: Duration,
}

impl UpdatePuller {
    pub fn start(node: Weak<HaNode>, interval: Duration) -> std::io::Result<Self> {
        if interval.is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "pull interval must be positive",
            ));
        }
        let shared = Arc::new(PullerShared {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let worker = shared.clone();
        thread::Builder::new()
            .name("update-puller".into())
            .spawn(move || run(worker, node, interval))?;
        info!("event=update_puller_started interval={interval:?}");
        Ok(Self { shared, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop(&self) {
        let mut stopped = self.shared.stopped.lock();
        if !*stopped {
            *stopped = true;
            self.shared.wakeup.notify_all();
            debug!("event=update_puller_stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped.lock()
    }
}

impl Drop for UpdatePuller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<PullerShared>, node: Weak<HaNode>, interval: Duration) {
    loop {
        let deadline = Instant::now() + interval;
        {
            let mut stopped = shared.stopped.lock();
            while !*stopped {
                if shared.wakeup.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
        }
        let Some(node) = node.upgrade() else {
            return;
        };
        if let Err(err) = node.pull_updates() {
            warn!("event=pull_updates_failed error={err}");
        }
    }
}
