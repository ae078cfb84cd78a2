use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::heuristics::Heuristics;
use crate::utils::formatted_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Young,
    Old,
    Global,
}

impl GenerationKind {
    pub fn name(self) -> &'static str {
        match self {
            GenerationKind::Young => "young",
            GenerationKind::Old => "old",
            GenerationKind::Global => "global",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared marking work-queue handle.
///
/// The control plane only needs to know how much marking work is
/// outstanding; the queue payload itself belongs to the marking machinery.
/// A bootstrap young cycle hands the old generation's queue set to the
/// young collector so old references found during the young mark are
/// enqueued here.
pub struct MarkQueueSet {
    tasks: AtomicUsize,
}

impl MarkQueueSet {
    pub fn new() -> Self {
        Self {
            tasks: AtomicUsize::new(0),
        }
    }

    pub fn tasks(&self) -> usize {
        self.tasks.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks() == 0
    }

    pub fn add_tasks(&self, n: usize) {
        self.tasks.fetch_add(n, Ordering::AcqRel);
    }

    /// Takes up to `n` tasks off the queue set; returns how many were taken.
    pub fn take_tasks(&self, n: usize) -> usize {
        let mut current = self.tasks.load(Ordering::Acquire);
        loop {
            let taken = current.min(n);
            if taken == 0 {
                return 0;
            }
            match self.tasks.compare_exchange_weak(
                current,
                current - taken,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return taken,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn clear(&self) {
        self.tasks.store(0, Ordering::Release);
    }
}

impl Default for MarkQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Generation {
    kind: GenerationKind,
    heuristics: Mutex<Box<dyn Heuristics>>,
    used: AtomicUsize,
    mark_complete: AtomicBool,
    task_queues: Arc<MarkQueueSet>,
    /// Young only: the old generation's queue set while a bootstrap cycle
    /// wires young marking into the old mark.
    old_gen_task_queues: Mutex<Option<Arc<MarkQueueSet>>>,
}

impl Generation {
    pub fn new(kind: GenerationKind, heuristics: Box<dyn Heuristics>) -> Self {
        Self {
            kind,
            heuristics: Mutex::new(heuristics),
            used: AtomicUsize::new(0),
            mark_complete: AtomicBool::new(false),
            task_queues: Arc::new(MarkQueueSet::new()),
            old_gen_task_queues: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn heuristics(&self) -> MutexGuard<'_, Box<dyn Heuristics>> {
        self.heuristics.lock()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Release);
    }

    pub fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn is_mark_complete(&self) -> bool {
        self.mark_complete.load(Ordering::Acquire)
    }

    pub fn set_mark_complete(&self) {
        self.mark_complete.store(true, Ordering::Release);
    }

    pub fn set_mark_incomplete(&self) {
        self.mark_complete.store(false, Ordering::Release);
    }

    pub fn task_queues(&self) -> &Arc<MarkQueueSet> {
        &self.task_queues
    }

    pub fn set_old_gen_task_queues(&self, queues: Option<Arc<MarkQueueSet>>) {
        *self.old_gen_task_queues.lock() = queues;
    }

    pub fn old_gen_task_queues(&self) -> Option<Arc<MarkQueueSet>> {
        self.old_gen_task_queues.lock().clone()
    }

    pub fn log_status(&self) {
        debug!(
            generation = %self.kind,
            used = %formatted_size(self.used()),
            mark_complete = self.is_mark_complete(),
            queued_tasks = self.task_queues.tasks(),
            "generation status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::AdaptiveHeuristics;

    #[test]
    fn queue_take_is_bounded() {
        let q = MarkQueueSet::new();
        q.add_tasks(10);
        assert_eq!(q.take_tasks(4), 4);
        assert_eq!(q.take_tasks(100), 6);
        assert_eq!(q.take_tasks(1), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn bootstrap_wiring_detaches() {
        let young = Generation::new(
            GenerationKind::Young,
            Box::new(AdaptiveHeuristics::new(3, false)),
        );
        let old = Generation::new(
            GenerationKind::Old,
            Box::new(AdaptiveHeuristics::new(3, false)),
        );
        assert!(young.old_gen_task_queues().is_none());
        young.set_old_gen_task_queues(Some(old.task_queues().clone()));
        young.old_gen_task_queues().unwrap().add_tasks(3);
        assert_eq!(old.task_queues().tasks(), 3);
        young.set_old_gen_task_queues(None);
        assert!(young.old_gen_task_queues().is_none());
    }
}
