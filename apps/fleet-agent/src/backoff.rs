use std::time::Duration;

/// Reconnect schedule: the Nth consecutive failure waits the Nth step, then
/// holds at the last step forever.
#[derive(Debug, Clone)]
pub struct Backoff {
    steps: Vec<Duration>,
    failures: usize,
}

impl Backoff {
    /// `steps` must be non-empty; config validation guarantees it.
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps, failures: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let idx = self.failures.min(self.steps.len().saturating_sub(1));
        self.failures = self.failures.saturating_add(1);
        self.steps.get(idx).copied().unwrap_or(Duration::from_secs(1))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}
