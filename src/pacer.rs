use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Allocator-side rate limiter.
///
/// Mutators claim allocation budget before allocating; when the budget is
/// exhausted they wait, bounded, for the control thread's periodic
/// notifier or for the collector to replenish the budget. The control
/// loop is responsible for servicing this structure: feeding the tally on
/// idle iterations, flushing stats per cycle, and resetting it for idle.
pub struct Pacer {
    budget_words: AtomicIsize,
    idle_budget_words: isize,

    lock: Mutex<()>,
    cv: Condvar,

    claimed_words: AtomicUsize,
    waited: AtomicUsize,
    cycle_claimed_words: AtomicUsize,
}

impl Pacer {
    /// A waiting mutator rechecks its claim at least this often even
    /// without a notification.
    pub const MAX_WAIT: Duration = Duration::from_millis(10);

    pub fn new(idle_budget_words: usize) -> Self {
        Self {
            budget_words: AtomicIsize::new(idle_budget_words as isize),
            idle_budget_words: idle_budget_words as isize,
            lock: Mutex::new(()),
            cv: Condvar::new(),
            claimed_words: AtomicUsize::new(0),
            waited: AtomicUsize::new(0),
            cycle_claimed_words: AtomicUsize::new(0),
        }
    }

    /// Claim budget for an allocation, waiting (bounded) while the pacer
    /// is out of budget. Returns true if the claim succeeded without
    /// waiting.
    pub fn claim_for_alloc(&self, words: usize) -> bool {
        let claimed = self.budget_words.fetch_sub(words as isize, Ordering::AcqRel);
        self.claimed_words.fetch_add(words, Ordering::Relaxed);
        self.cycle_claimed_words.fetch_add(words, Ordering::Relaxed);
        if claimed >= words as isize {
            return true;
        }

        self.waited.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock.lock();
        while self.budget_words.load(Ordering::Acquire) < 0 {
            let timed_out = self
                .cv
                .wait_for(&mut guard, Self::MAX_WAIT)
                .timed_out();
            if timed_out {
                // Degrade rather than stall the mutator forever.
                break;
            }
        }
        false
    }

    /// Collector-side replenishment as collection makes progress.
    pub fn add_budget(&self, words: usize) {
        self.budget_words.fetch_add(words as isize, Ordering::AcqRel);
        self.notify_waiters();
    }

    /// Periodically unblocks waiting mutators so a stalled pacer cannot
    /// wedge allocation.
    pub fn notify_waiters(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Idle iterations feed the allocation tally through so the pacer sees
    /// allocation progress even when no cycle runs.
    pub fn report_alloc(&self, words: usize) {
        debug!(words, "pacer observed allocations while idle");
        self.budget_words.fetch_sub(words as isize, Ordering::AcqRel);
    }

    pub fn setup_for_idle(&self) {
        self.budget_words.store(self.idle_budget_words, Ordering::Release);
        self.notify_waiters();
    }

    pub fn flush_stats_to_cycle(&self) {
        let claimed = self.cycle_claimed_words.swap(0, Ordering::AcqRel);
        let waited = self.waited.swap(0, Ordering::AcqRel);
        if claimed > 0 || waited > 0 {
            debug!(claimed_words = claimed, wait_episodes = waited, "pacer cycle stats");
        }
    }

    pub fn claimed_words(&self) -> usize {
        self.claimed_words.load(Ordering::Relaxed)
    }

    pub fn budget_words(&self) -> isize {
        self.budget_words.load(Ordering::Acquire)
    }
}
