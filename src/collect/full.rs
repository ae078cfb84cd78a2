use std::time::Instant;

use tracing::info;

use crate::cause::GcCause;
use crate::heap::Heap;
use crate::phase_timings::TimedPhase;

/// Stop-the-world compacting collection of the entire heap.
///
/// Full GC does not poll cancellation: once it starts it runs to
/// completion, tearing down whatever concurrent marking state was left
/// behind by the cycle it replaced.
pub struct FullGc;

impl FullGc {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(&mut self, heap: &Heap, cause: GcCause) {
        let start = Instant::now();

        // Any in-flight marking is abandoned wholesale.
        heap.young_generation().set_old_gen_task_queues(None);
        heap.set_concurrent_old_mark_in_progress(false);
        heap.set_prep_for_mixed_evac_in_progress(false);
        for generation in [
            heap.young_generation(),
            heap.old_generation(),
            heap.global_generation(),
        ] {
            generation.task_queues().clear();
        }

        heap.stress_pause();
        let recycled = heap.recycle_trash();
        heap.global_generation().set_mark_complete();
        heap.global_generation().set_used(heap.used());

        heap.clear_cancelled_gc(true);
        heap.phase_timings()
            .record_phase(TimedPhase::FullStw, start.elapsed());
        info!(cause = %cause, recycled, "full GC complete");
    }
}

impl Default for FullGc {
    fn default() -> Self {
        Self::new()
    }
}
