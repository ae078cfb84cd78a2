use std::time::Instant;

use tracing::debug;

use crate::cause::GcCause;
use crate::heap::Heap;
use crate::phase_timings::TimedPhase;
use crate::signals::SignalFlag;

/// Resumes the old-generation concurrent work: the mark started by a
/// bootstrap young cycle, then preparation for mixed evacuation.
///
/// Marking is the only window in which the regulator may preempt the old
/// collection for a young cycle: the `allow_preemption` flag is armed for
/// the duration of the mark and consumed either by the preemptor or by
/// final mark.
pub struct OldGc<'a> {
    allow_preemption: &'a SignalFlag,
}

impl<'a> OldGc<'a> {
    /// Marking work drained per cancellation poll.
    const MARK_CHUNK: usize = 4;

    pub fn new(allow_preemption: &'a SignalFlag) -> Self {
        Self { allow_preemption }
    }

    pub fn collect(&mut self, heap: &Heap, cause: GcCause) -> bool {
        assert!(
            heap.is_concurrent_old_mark_in_progress() || heap.is_prep_for_mixed_evac_in_progress(),
            "old mark or mixed-evac prep should be in progress"
        );
        let old = heap.old_generation();
        let start = Instant::now();

        if heap.is_concurrent_old_mark_in_progress() {
            debug!(
                cause = %cause,
                tasks = old.task_queues().tasks(),
                "resuming old generation marking"
            );
            self.allow_preemption.set();
            loop {
                let taken = old.task_queues().take_tasks(Self::MARK_CHUNK);
                heap.stress_pause();
                if heap.cancelled_gc() {
                    // Close the preemption window; a pending preemptor has
                    // already consumed the flag through try_unset.
                    self.allow_preemption.try_unset();
                    heap.phase_timings()
                        .record_phase(TimedPhase::OldMark, start.elapsed());
                    return false;
                }
                if taken == 0 {
                    break;
                }
            }
            // Final mark: no preemption past this point.
            self.allow_preemption.try_unset();
            old.set_mark_complete();
            heap.set_concurrent_old_mark_in_progress(false);
            heap.set_prep_for_mixed_evac_in_progress(true);
        }

        if heap.is_prep_for_mixed_evac_in_progress() {
            heap.stress_pause();
            if heap.cancelled_gc() {
                heap.phase_timings()
                    .record_phase(TimedPhase::OldMark, start.elapsed());
                return false;
            }
            heap.set_prep_for_mixed_evac_in_progress(false);
        }

        old.set_used(heap.used());
        heap.phase_timings()
            .record_phase(TimedPhase::OldMark, start.elapsed());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::HeapOptions;

    fn old_marking_heap() -> std::sync::Arc<Heap> {
        let heap = Heap::new(HeapOptions::with_max_heap(64 * 1024 * 1024)).unwrap();
        heap.set_concurrent_old_mark_in_progress(true);
        heap.old_generation().task_queues().add_tasks(16);
        heap
    }

    #[test]
    fn drains_mark_queues_and_finishes_prep() {
        let heap = old_marking_heap();
        let flag = SignalFlag::new();
        let mut gc = OldGc::new(&flag);
        assert!(gc.collect(&heap, GcCause::ConcurrentCycle));
        assert!(heap.old_generation().task_queues().is_empty());
        assert!(!heap.is_concurrent_old_mark_in_progress());
        assert!(!heap.is_prep_for_mixed_evac_in_progress());
        assert!(heap.old_generation().is_mark_complete());
        // The window closed with final mark.
        assert!(flag.is_unset());
    }

    #[test]
    fn cancellation_during_mark_leaves_mark_in_progress() {
        let heap = old_marking_heap();
        heap.cancel_gc(GcCause::ConcurrentCycle);
        let flag = SignalFlag::new();
        let mut gc = OldGc::new(&flag);
        assert!(!gc.collect(&heap, GcCause::ConcurrentCycle));
        assert!(heap.is_concurrent_old_mark_in_progress());
    }
}
