use std::time::Instant;

use tracing::info;

use crate::cause::GcCause;
use crate::collect::{DegenPoint, FullGc};
use crate::generation::GenerationKind;
use crate::heap::Heap;
use crate::phase_timings::TimedPhase;

/// Stop-the-world completion of a cancelled concurrent cycle.
///
/// Resumes at the phase the concurrent cycle was cancelled in; the
/// already-completed concurrent phases are not redone. A degenerated
/// cycle that cannot make progress (or is itself cancelled by another
/// allocation failure) upgrades to a full collection in place.
pub struct DegenGc {
    point: DegenPoint,
    generation: GenerationKind,
    upgraded: bool,
}

impl DegenGc {
    pub fn new(point: DegenPoint, generation: GenerationKind) -> Self {
        assert!(point != DegenPoint::Unset, "degenerated point should be set");
        Self {
            point,
            generation,
            upgraded: false,
        }
    }

    pub fn upgraded_to_full(&self) -> bool {
        self.upgraded
    }

    pub fn collect(&mut self, heap: &Heap, cause: GcCause) {
        let start = Instant::now();

        // The pending cancellation is what brought us here; consume it.
        heap.clear_cancelled_gc(true);

        let generation = heap.generation(self.generation);

        // A degenerated cycle wipes whatever old marking the cancelled
        // cycle left behind; the queues must come out empty.
        heap.young_generation().set_old_gen_task_queues(None);
        heap.set_concurrent_old_mark_in_progress(false);
        heap.set_prep_for_mixed_evac_in_progress(false);

        if self.point == DegenPoint::OutsideCycle || self.point == DegenPoint::Mark {
            // Finish marking at a pause.
            generation.task_queues().clear();
            generation.set_mark_complete();
        }
        heap.old_generation().task_queues().clear();
        heap.young_generation().task_queues().clear();
        heap.global_generation().task_queues().clear();

        heap.stress_pause();
        let recycled = heap.recycle_trash();
        generation.set_used(heap.used());

        heap.phase_timings()
            .record_phase(TimedPhase::DegenStw, start.elapsed());
        info!(
            point = %self.point,
            generation = %self.generation,
            cause = %cause,
            recycled,
            "degenerated GC complete"
        );

        // Upgrade to full when this pass freed nothing, when another
        // allocation failure already cancelled us, or when the heuristics
        // have given up on degeneration.
        let no_progress = recycled == 0 && heap.locked().free_set().available() == 0;
        let heuristics_demand_full = !generation.heuristics().should_degenerate_cycle();
        if heap.cancelled_gc() || no_progress || heuristics_demand_full {
            info!(
                cancelled = heap.cancelled_gc(),
                no_progress,
                heuristics_demand_full,
                "degenerated GC upgrading to full GC"
            );
            self.upgraded = true;
            FullGc::new().collect(heap, cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::HeapOptions;

    fn heap() -> std::sync::Arc<Heap> {
        Heap::new(HeapOptions::with_max_heap(64 * 1024 * 1024)).unwrap()
    }

    #[test]
    fn consumes_cancellation_and_recycles() {
        let heap = heap();
        let idx = heap.acquire_region().unwrap();
        heap.retire_region(idx);
        heap.cancel_gc(GcCause::AllocationFailure);

        let mut gc = DegenGc::new(DegenPoint::Mark, GenerationKind::Young);
        gc.collect(&heap, GcCause::AllocationFailure);

        assert!(!heap.cancelled_gc());
        assert!(!gc.upgraded_to_full());
        assert_eq!(heap.used(), 0);
        assert!(heap.young_generation().task_queues().is_empty());
        assert!(heap.old_generation().task_queues().is_empty());
        assert!(heap.global_generation().task_queues().is_empty());
    }

    #[test]
    fn upgrades_when_nothing_reclaimable() {
        let heap = heap();
        // Exhaust the heap with live regions: degen cannot free anything.
        while heap.acquire_region().is_some() {}
        heap.cancel_gc(GcCause::AllocationFailure);

        let mut gc = DegenGc::new(DegenPoint::OutsideCycle, GenerationKind::Young);
        gc.collect(&heap, GcCause::AllocationFailure);
        assert!(gc.upgraded_to_full());
        assert!(!heap.cancelled_gc());
    }

    #[test]
    #[should_panic]
    fn rejects_unset_point() {
        DegenGc::new(DegenPoint::Unset, GenerationKind::Young);
    }
}
