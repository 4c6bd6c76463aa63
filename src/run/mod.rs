//! Per-run completion tracking across recursive fan-out
//!
//! One logical crawl run (a category tree, a keyword search) is accepted at a
//! time per tracker. While a run is active, further root tasks on the primary
//! input are deflected back to their origin transport instead of accepted.
//! Workers report fan-out as they complete; the run finishes when the pending
//! count returns to zero with no worker active, at which point the per-run
//! caches reset and ingestion resumes.
//!
//! Every mutation and the completion check run under one mutex, so the
//! "cleanup fires exactly once" property holds on a multi-threaded runtime,
//! where the source's cooperative single-thread scheduling can no longer be
//! assumed.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct RunState {
    active: bool,
    /// Outstanding sub-tasks for the active run. Never negative: completions
    /// only come from accepted tasks, each counted on acceptance or fan-out.
    pending: u64,
    /// Per-run filter list, lowercased on acceptance.
    filters: Vec<String>,
    /// Container ids (category pages) already expanded this run.
    seen_containers: HashSet<String>,
    /// Natural record keys already emitted this run.
    seen_records: HashSet<String>,
}

/// Tracks one group's active run. Shared by every worker of the group.
#[derive(Debug, Default)]
pub struct RunTracker {
    state: Mutex<RunState>,
}

impl RunTracker {
    pub fn new() -> Self {
        RunTracker::default()
    }

    /// Attempts to accept a root task.
    ///
    /// Returns false while a run is active; the caller must deflect the task
    /// back to its origin transport. On acceptance the pending count starts
    /// at 1 (the root itself) and the given filters become the run's filter
    /// set.
    pub fn accept_root(&self, filters: &[String]) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.active {
            return false;
        }
        state.active = true;
        state.pending = 1;
        state.filters = filters.iter().map(|f| f.to_lowercase()).collect();
        true
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Lowercased filter set of the active run.
    pub fn filters(&self) -> Vec<String> {
        self.state.lock().unwrap().filters.clone()
    }

    /// Applies one task completion that fanned out into `children` follow-up
    /// sub-tasks: `pending += children - 1`, atomically.
    pub fn apply_fanout(&self, children: usize) {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            tracing::error!("fan-out reported with no active run");
            return;
        }
        state.pending = state.pending.saturating_sub(1) + children as u64;
    }

    pub fn pending(&self) -> u64 {
        self.state.lock().unwrap().pending
    }

    /// Marks a container id as expanded; returns true if it was already seen
    /// this run.
    pub fn container_seen(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        !state.seen_containers.insert(id.to_string())
    }

    /// Marks a record's natural key as emitted; returns true if it was
    /// already emitted this run.
    pub fn record_seen(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        !state.seen_records.insert(key.to_string())
    }

    /// Completion check, called when the group's pool goes idle. If the
    /// active run has no pending sub-tasks the run state resets and the
    /// method returns true — exactly once per run, for any interleaving.
    pub fn finish_if_done(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.active || state.pending != 0 {
            return false;
        }
        state.active = false;
        state.filters.clear();
        state.seen_containers.clear();
        state.seen_records.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_root_deflected_while_active() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&[]));
        assert!(!tracker.accept_root(&[]));
        tracker.apply_fanout(0);
        assert!(tracker.finish_if_done());
        assert!(tracker.accept_root(&[]));
    }

    #[test]
    fn test_fanout_accounting_balances() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&[]));
        // root fans out into 3 children
        tracker.apply_fanout(3);
        assert_eq!(tracker.pending(), 3);
        // each child completes without further fan-out
        tracker.apply_fanout(0);
        tracker.apply_fanout(0);
        assert!(!tracker.finish_if_done());
        tracker.apply_fanout(0);
        assert_eq!(tracker.pending(), 0);
        assert!(tracker.finish_if_done());
        // cleanup fired; a second check is a no-op
        assert!(!tracker.finish_if_done());
    }

    #[test]
    fn test_empty_root_finishes_immediately() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&[]));
        tracker.apply_fanout(0);
        assert_eq!(tracker.pending(), 0);
        assert!(tracker.finish_if_done());
    }

    #[test]
    fn test_filters_lowercased_and_cleared() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&["Electronics".to_string()]));
        assert_eq!(tracker.filters(), vec!["electronics".to_string()]);
        tracker.apply_fanout(0);
        assert!(tracker.finish_if_done());
        assert!(tracker.filters().is_empty());
    }

    #[test]
    fn test_record_dedup_within_run() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&[]));
        assert!(!tracker.record_seen("a"));
        assert!(!tracker.record_seen("b"));
        assert!(tracker.record_seen("b"));
    }

    #[test]
    fn test_container_seen() {
        let tracker = RunTracker::new();
        assert!(tracker.accept_root(&[]));
        assert!(!tracker.container_seen("123"));
        assert!(tracker.container_seen("123"));
    }
}
