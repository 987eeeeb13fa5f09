use super::phase::NodePhase;
use crate::storage::LocalGraph;
use crate::util::HaError;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SlotState {
    graph: Option<Arc<dyn LocalGraph>>,
    cause: Option<Arc<HaError>>,
    phase: NodePhase,
}

/// The instance callers are served from, plus why there is none.
///
/// Writers hold the node's transition lock; readers only take the slot's
/// own mutex, so waiting for a graph never blocks a role change.
pub struct GraphSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Default for GraphSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                graph: None,
                cause: None,
                phase: NodePhase::Unstarted,
            }),
            changed: Condvar::new(),
        }
    }

    /// Publishes a started instance and clears any recorded cause.
    pub fn publish(&self, graph: Arc<dyn LocalGraph>, phase: NodePhase) {
        let mut state = self.state.lock();
        transition(&mut state, phase);
        state.graph = Some(graph);
        state.cause = None;
        self.changed.notify_all();
    }

    /// Withdraws the published instance, if any.
    pub fn retract(&self, phase: NodePhase) -> Option<Arc<dyn LocalGraph>> {
        let mut state = self.state.lock();
        transition(&mut state, phase);
        self.changed.notify_all();
        state.graph.take()
    }

    pub fn record_cause(&self, cause: Arc<HaError>, phase: NodePhase) {
        let mut state = self.state.lock();
        transition(&mut state, phase);
        state.cause = Some(cause);
        self.changed.notify_all();
    }

    pub fn set_phase(&self, phase: NodePhase) {
        let mut state = self.state.lock();
        transition(&mut state, phase);
        self.changed.notify_all();
    }

    pub fn phase(&self) -> NodePhase {
        self.state.lock().phase
    }

    pub fn cause(&self) -> Option<Arc<HaError>> {
        self.state.lock().cause.clone()
    }

    pub fn current(&self) -> Option<Arc<dyn LocalGraph>> {
        self.state.lock().graph.clone()
    }

    /// Waits up to `timeout` for an instance to be published.
    ///
    /// Returns immediately with the recorded cause once the node has stopped.
    pub fn wait(&self, timeout: Duration) -> Result<Arc<dyn LocalGraph>, HaError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(graph) = &state.graph {
                return Ok(graph.clone());
            }
            if state.phase == NodePhase::Stopped && state.cause.is_some() {
                break;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                if let Some(graph) = &state.graph {
                    return Ok(graph.clone());
                }
                break;
            }
        }
        match &state.cause {
            Some(cause) => Err(HaError::NotStarted {
                cause: cause.clone(),
            }),
            None => Err(HaError::NotAssigned),
        }
    }
}

fn transition(state: &mut SlotState, next: NodePhase) {
    if !state.phase.can_transition_to(next) {
        warn!("event=unexpected_phase_transition from={} to={next}", state.phase);
    } else if state.phase != next {
        debug!("event=phase_transition from={} to={next}", state.phase);
    }
    state.phase = next;
}
