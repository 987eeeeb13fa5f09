use std::time::{Duration, Instant};

/// Bounded retry schedule shared by the verification poll and the store copy loop.
///
/// A policy is immutable; each retry loop takes its own [`RetryHandle`] which
/// tracks attempts and the optional wall-clock budget.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            time_budget: None,
        }
    }

    /// Caps the wall-clock time of the loop. A zero budget allows only the
    /// first attempt.
    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        self.handle_from(Instant::now())
    }

    pub fn handle_from(&self, start: Instant) -> RetryHandle {
        let deadline = self
            .time_budget
            .and_then(|budget| start.checked_add(budget));
        RetryHandle {
            policy: self.clone(),
            attempts: 1,
            deadline,
        }
    }
}

/// Per-loop retry state. The first attempt is counted when the handle is created.
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Returns the delay to sleep before the next attempt, or `None` once the
    /// attempt budget or the time budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay;
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match now.checked_add(delay) {
                Some(next_instant) if next_instant <= deadline => {}
                _ => return None,
            }
        }
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
