use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Collapses a burst of tool-call detections into one parse.
///
/// Every detection pushes the deadline out by `window`; only the snapshot
/// current when the deadline passes is handed on.
#[derive(Debug)]
pub struct ToolCallDebouncer {
    window: Duration,
    deadline: Option<Instant>,
    latest: Option<String>,
    observed: usize,
}

impl ToolCallDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            latest: None,
            observed: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn observe(&mut self, snapshot: &str) {
        self.latest = Some(snapshot.to_string());
        self.deadline = Some(Instant::now() + self.window);
        self.observed += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Detections since the last `take`.
    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn is_due(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves once the window has elapsed; never resolves while disarmed.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Disarm and return the last observed snapshot.
    pub fn take(&mut self) -> Option<String> {
        self.deadline = None;
        self.observed = 0;
        self.latest.take()
    }

    pub fn reset(&mut self) {
        self.take();
    }
}
