//! Navigation stack: ordered activated units with contiguous 1-based depths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::config::NavigationConfig;
use crate::navigation::unit::ActivatedUnit;
use crate::util::lock;

/// A removed unit that stays activated until its deadline.
#[derive(Debug)]
struct PendingDeactivation {
    deadline: Instant,
    unit: Arc<ActivatedUnit>,
}

#[derive(Debug)]
pub struct NavigationStack {
    config: NavigationConfig,
    entries: Mutex<Vec<Arc<ActivatedUnit>>>,
    disposal: Mutex<Vec<PendingDeactivation>>,
    generation: AtomicU64,
    restoring: AtomicBool,
}

impl NavigationStack {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
            disposal: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            restoring: AtomicBool::new(false),
        }
    }

    /// Structural change counter.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    /// Append a unit at the top. Returns its depth.
    ///
    /// The previous top is flagged dirty so its latest state gets saved.
    pub fn push(&self, unit: Arc<ActivatedUnit>) -> usize {
        let depth = {
            let mut entries = lock(&self.entries);
            if let Some(top) = entries.last() {
                top.notify_state_changed();
            }
            let depth = entries.len() + 1;
            unit.set_depth(depth);
            entries.push(unit);
            depth
        };
        self.bump();
        tracing::debug!(depth, "Unit pushed");
        depth
    }

    /// Remove `unit` wherever it sits. Returns `false` if it is not on the stack.
    pub fn remove(&self, unit: &ActivatedUnit) -> bool {
        let position = lock(&self.entries)
            .iter()
            .position(|u| u.id() == unit.id());
        match position {
            Some(index) => self.remove_at(index + 1).is_some(),
            None => false,
        }
    }

    /// Remove the unit at 1-based `position`, renumbering everything after it.
    pub fn remove_at(&self, position: usize) -> Option<Arc<ActivatedUnit>> {
        let removed = {
            let mut entries = lock(&self.entries);
            if position == 0 || position > entries.len() {
                return None;
            }
            let removed = entries.remove(position - 1);
            if !self.is_restoring() {
                renumber_from(&entries, position - 1);
            }
            removed
        };
        self.bump();
        self.schedule_deactivation(vec![Arc::clone(&removed)]);
        tracing::debug!(position, kind = removed.kind(), "Unit removed");
        Some(removed)
    }

    /// Remove every unit.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *lock(&self.entries));
        self.bump();
        self.schedule_deactivation(removed);
    }

    /// Remove everything above `depth`. Position 1 is always kept.
    pub fn reset_to_root(&self, depth: usize) {
        let keep = depth.max(1);
        let removed = {
            let mut entries = lock(&self.entries);
            if entries.len() <= keep {
                return;
            }
            entries.split_off(keep)
        };
        self.bump();
        self.schedule_deactivation(removed);
    }

    fn schedule_deactivation(&self, units: Vec<Arc<ActivatedUnit>>) {
        if units.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.config.deactivation_delay;
        let mut disposal = lock(&self.disposal);
        disposal.extend(
            units
                .into_iter()
                .map(|unit| PendingDeactivation { deadline, unit }),
        );
    }

    /// Finally deactivate removed units whose deadline passed.
    ///
    /// Returns the former depths of deactivated units that lie beyond the
    /// current stack depth; their persisted slots are stale.
    pub fn collect_disposals(&self, now: Instant) -> Vec<usize> {
        let expired: Vec<PendingDeactivation> = {
            let mut disposal = lock(&self.disposal);
            let mut expired = Vec::new();
            while disposal.last().is_some_and(|d| d.deadline <= now) {
                if let Some(entry) = disposal.pop() {
                    expired.push(entry);
                }
            }
            expired
        };
        if expired.is_empty() {
            return Vec::new();
        }

        let current_depth = self.depth();
        let mut stale = Vec::new();
        for PendingDeactivation { unit, .. } in expired {
            let depth = unit.depth();
            unit.deactivate();
            if depth > current_depth {
                stale.push(depth);
            }
        }
        stale
    }

    /// Units still waiting for final deactivation.
    pub fn pending_deactivations(&self) -> usize {
        lock(&self.disposal).len()
    }

    /// Top of the stack.
    pub fn current(&self) -> Option<Arc<ActivatedUnit>> {
        lock(&self.entries).last().cloned()
    }

    /// Unit at 1-based `position`.
    pub fn get(&self, position: usize) -> Option<Arc<ActivatedUnit>> {
        position
            .checked_sub(1)
            .and_then(|index| lock(&self.entries).get(index).cloned())
    }

    pub fn depth(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Point-in-time copy of the stack, bottom first.
    pub fn snapshot(&self) -> Vec<Arc<ActivatedUnit>> {
        lock(&self.entries).clone()
    }

    /// Suspend renumbering while restored units are linked.
    pub fn begin_restoration(&self) {
        self.restoring.store(true, Ordering::SeqCst);
    }

    /// End a restoration pass and renumber every entry.
    pub fn notify_restoration_completed(&self, success: bool) {
        self.restoring.store(false, Ordering::SeqCst);
        let entries = lock(&self.entries);
        renumber_from(&entries, 0);
        tracing::debug!(success, depth = entries.len(), "Navigation restoration finished");
    }
}

fn renumber_from(entries: &[Arc<ActivatedUnit>], start: usize) {
    for (index, unit) in entries.iter().enumerate().skip(start) {
        unit.set_depth(index + 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn stack() -> NavigationStack {
        NavigationStack::new(NavigationConfig {
            deactivation_delay: Duration::from_secs(5),
        })
    }

    fn unit(kind: &str) -> Arc<ActivatedUnit> {
        Arc::new(ActivatedUnit::new(kind, json!({})))
    }

    fn depths(stack: &NavigationStack) -> Vec<usize> {
        stack.snapshot().iter().map(|u| u.depth()).collect()
    }

    #[test]
    fn push_assigns_next_depth_without_renumbering() {
        let stack = stack();
        assert_eq!(stack.push(unit("m")), 1);
        assert_eq!(stack.push(unit("a")), 2);
        assert_eq!(stack.push(unit("b")), 3);
        assert_eq!(depths(&stack), vec![1, 2, 3]);
        assert_eq!(stack.generation(), 3);
    }

    #[test]
    fn push_marks_previous_top_dirty() {
        let stack = stack();
        let root = unit("m");
        stack.push(root.clone());
        root.set_materialized(true);
        stack.push(unit("a"));
        assert!(!root.is_materialized());
    }

    #[test]
    fn removal_renumbers_following_entries() {
        let stack = stack();
        let (root, a, b) = (unit("m"), unit("a"), unit("b"));
        stack.push(root);
        stack.push(a.clone());
        stack.push(b.clone());

        assert!(stack.remove(&a));
        assert_eq!(depths(&stack), vec![1, 2]);
        assert_eq!(b.depth(), 2);
        // Removed units stay activated until disposal.
        assert_eq!(a.depth(), 2);
        assert_eq!(stack.pending_deactivations(), 1);
    }

    #[test]
    fn remove_at_out_of_range() {
        let stack = stack();
        stack.push(unit("m"));
        assert!(stack.remove_at(0).is_none());
        assert!(stack.remove_at(2).is_none());
        assert_eq!(stack.generation(), 1);
    }

    #[test]
    fn reset_to_root_keeps_first_position() {
        let stack = stack();
        for kind in ["m", "a", "b", "c"] {
            stack.push(unit(kind));
        }
        stack.reset_to_root(0);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current().unwrap().kind(), "m");
    }

    #[test]
    fn clear_bumps_generation() {
        let stack = stack();
        stack.push(unit("m"));
        let before = stack.generation();
        stack.clear();
        assert!(stack.is_empty());
        assert!(stack.generation() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn disposal_reports_only_depths_beyond_stack() {
        let stack = stack();
        let units: Vec<_> = ["m", "a", "b"].into_iter().map(unit).collect();
        for u in &units {
            stack.push(u.clone());
        }

        // Back then forward: depth 3 is removed and a new unit takes it.
        stack.remove_at(3);
        stack.push(unit("b2"));
        // Back twice: depth 3 and 2 removed.
        stack.remove_at(3);
        stack.remove_at(2);

        assert!(stack.collect_disposals(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let mut stale = stack.collect_disposals(Instant::now());
        stale.sort();
        assert_eq!(stale, vec![2, 3, 3]);
        assert!(!units[2].is_activated());
        assert_eq!(stack.pending_deactivations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disposal_keeps_slots_still_in_range() {
        let stack = stack();
        for kind in ["m", "a", "b"] {
            stack.push(unit(kind));
        }
        let removed = stack.remove_at(3).unwrap();
        stack.push(unit("c"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(stack.collect_disposals(Instant::now()).is_empty());
        assert!(!removed.is_activated());
    }

    #[test]
    fn restoration_suspends_renumbering() {
        let stack = stack();
        for kind in ["m", "a", "b"] {
            stack.push(unit(kind));
        }
        stack.begin_restoration();
        stack.remove_at(1);
        assert_eq!(depths(&stack), vec![2, 3]);

        stack.notify_restoration_completed(true);
        assert_eq!(depths(&stack), vec![1, 2]);
        assert!(!stack.is_restoring());
    }
}
