use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, Listeners};
use crate::file_store::{normalize_path, FileStore};

/// A proposed change to one file, waiting for the user to accept or reject it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingDiff {
    pub id: String,
    pub path: String,
    /// `None` when the file does not exist yet.
    pub old_content: Option<String>,
    pub new_content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added_lines: usize,
    pub removed_lines: usize,
}

impl PendingDiff {
    pub fn new(path: &str, old_content: Option<String>, new_content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: normalize_path(path),
            old_content,
            new_content,
            created_at: Utc::now(),
        }
    }

    pub fn is_new_file(&self) -> bool {
        self.old_content.is_none()
    }

    pub fn unified_diff(&self) -> String {
        let old = self.old_content.as_deref().unwrap_or("");
        diffy::create_patch(old, &self.new_content).to_string()
    }

    pub fn stats(&self) -> DiffStats {
        count_diff_stats(&self.unified_diff())
    }
}

pub fn count_diff_stats(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            stats.added_lines += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            stats.removed_lines += 1;
        }
    }
    stats
}

/// Pending diffs keyed by path, at most one per path.
///
/// Every mutation happens in a single critical section and listeners are
/// notified after the lock is released, so a subscriber never observes a
/// half-applied change.
pub struct DiffBus {
    diffs: Mutex<HashMap<String, PendingDiff>>,
    store: Arc<dyn FileStore>,
    listeners: Listeners,
}

impl DiffBus {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self::with_listeners(store, Listeners::new())
    }

    pub fn with_listeners(store: Arc<dyn FileStore>, listeners: Listeners) -> Self {
        Self {
            diffs: Mutex::new(HashMap::new()),
            store,
            listeners,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingDiff>> {
        self.diffs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener);
    }

    /// Queue a change for review, replacing any earlier one for the same path.
    pub fn publish(&self, path: &str, old_content: Option<String>, new_content: String) -> PendingDiff {
        let diff = PendingDiff::new(path, old_content, new_content);
        let replaced = self.lock().insert(diff.path.clone(), diff.clone());
        if replaced.is_some() {
            info!(path = %diff.path, "replaced pending diff");
        }
        self.listeners.emit(&EngineEvent::DiffPublished {
            path: diff.path.clone(),
        });
        diff
    }

    /// Write the pending change to disk.
    ///
    /// The diff leaves the map before the write starts, so a concurrent
    /// `reject` cannot also claim it. On failure it goes back, unless a newer
    /// diff for the same path was published in the meantime.
    pub async fn accept(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let diff = self
            .lock()
            .remove(&path)
            .ok_or_else(|| EngineError::NoPendingDiff(path.clone()))?;

        match self.store.write_file(&diff.path, &diff.new_content).await {
            Ok(()) => {
                info!(path = %path, "accepted diff");
                self.listeners.emit(&EngineEvent::DiffAccepted { path: path.clone() });
                self.listeners.emit(&EngineEvent::DirectoryRefresh);
                Ok(())
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to apply diff");
                self.lock().entry(path.clone()).or_insert(diff);
                Err(EngineError::WriteConflict {
                    path,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop the pending change without touching disk.
    pub fn reject(&self, path: &str) -> Result<PendingDiff> {
        let path = normalize_path(path);
        let diff = self
            .lock()
            .remove(&path)
            .ok_or_else(|| EngineError::NoPendingDiff(path.clone()))?;
        info!(path = %path, "rejected diff");
        self.listeners.emit(&EngineEvent::DiffRejected { path });
        Ok(diff)
    }

    /// Accept every pending diff, oldest first. No rollback: each path
    /// reports its own outcome.
    pub async fn accept_all(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for diff in self.list() {
            let outcome = self.accept(&diff.path).await;
            results.push((diff.path, outcome));
        }
        results
    }

    /// Pending diffs ordered by creation time.
    pub fn list(&self) -> Vec<PendingDiff> {
        let mut diffs: Vec<PendingDiff> = self.lock().values().cloned().collect();
        diffs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        diffs
    }

    pub fn get(&self, path: &str) -> Option<PendingDiff> {
        self.lock().get(&normalize_path(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::MemoryFileStore;

    fn bus_with_store() -> (DiffBus, Arc<MemoryFileStore>) {
        let store = Arc::new(MemoryFileStore::with_files([("a.rs", "old")]));
        (DiffBus::new(store.clone()), store)
    }

    fn recorded(bus: &DiffBus) -> Arc<Mutex<Vec<EngineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn test_count_diff_stats() {
        let diff = r#"--- a/file.txt
+++ b/file.txt
@@ -1,3 +1,4 @@
 line1
-old line
+new line
+added line
 line3
"#;
        assert_eq!(
            count_diff_stats(diff),
            DiffStats {
                added_lines: 2,
                removed_lines: 1
            }
        );
    }

    #[test]
    fn test_publish_replaces_same_path() {
        let (bus, _) = bus_with_store();
        bus.publish("a.rs", Some("old".into()), "first".into());
        bus.publish("./a.rs", Some("old".into()), "second".into());
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.get("a.rs").unwrap().new_content, "second");
    }

    #[tokio::test]
    async fn test_accept_writes_and_notifies() {
        let (bus, store) = bus_with_store();
        let events = recorded(&bus);
        bus.publish("src/new.rs", None, "fn main() {}".into());

        bus.accept("src/new.rs").await.unwrap();
        assert!(bus.is_empty());
        assert_eq!(store.snapshot()["src/new.rs"], "fn main() {}");

        let events = events.lock().unwrap();
        assert_eq!(
            events[1..],
            [
                EngineEvent::DiffAccepted {
                    path: "src/new.rs".into()
                },
                EngineEvent::DirectoryRefresh
            ]
        );
    }

    #[tokio::test]
    async fn test_accept_and_reject_are_exclusive() {
        let (bus, store) = bus_with_store();
        bus.publish("a.rs", Some("old".into()), "new".into());
        bus.accept("a.rs").await.unwrap();
        assert!(matches!(bus.reject("a.rs"), Err(EngineError::NoPendingDiff(_))));

        bus.publish("a.rs", Some("new".into()), "newer".into());
        bus.reject("a.rs").unwrap();
        assert!(matches!(bus.accept("a.rs").await, Err(EngineError::NoPendingDiff(_))));
        assert_eq!(store.snapshot()["a.rs"], "new");
    }

    #[tokio::test]
    async fn test_failed_write_keeps_diff() {
        let (bus, store) = bus_with_store();
        bus.publish("a.rs", Some("old".into()), "new".into());
        store.set_fail_writes(true);

        let err = bus.accept("a.rs").await.unwrap_err();
        assert!(matches!(err, EngineError::WriteConflict { .. }));
        assert!(bus.get("a.rs").is_some());
        assert_eq!(store.snapshot()["a.rs"], "old");
    }

    #[tokio::test]
    async fn test_accept_all_reports_per_path() {
        let (bus, store) = bus_with_store();
        bus.publish("a.rs", Some("old".into()), "A".into());
        bus.publish("b.rs", None, "B".into());

        let results = bus.accept_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(store.snapshot()["b.rs"], "B");
    }

    #[test]
    fn test_preview_for_new_file() {
        let diff = PendingDiff::new("x.py", None, "a\nb\n".into());
        assert!(diff.is_new_file());
        assert_eq!(diff.stats().added_lines, 2);
        assert!(diff.unified_diff().contains("+a"));
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_publish() {
        let (bus, _) = bus_with_store();
        bus.subscribe(|_| panic!("ui crashed"));
        let events = recorded(&bus);
        bus.publish("a.rs", None, "x".into());
        assert_eq!(bus.len(), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
