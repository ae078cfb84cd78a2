use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use crate::cause::GcCause;
use crate::control::{ControlThread, GcMode};
use crate::generation::GenerationKind;
use crate::heap::{AllocRequest, Heap};
use crate::options::HeapOptions;
use crate::signals::SignalFlag;

const MB: usize = 1024 * 1024;

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn started(configure: impl FnOnce(&mut HeapOptions)) -> (Arc<Heap>, Arc<ControlThread>) {
    let mut options = HeapOptions::with_max_heap(64 * MB);
    configure(&mut options);
    let heap = Heap::new(options).unwrap();
    let control = heap.start_control_thread();
    (heap, control)
}

#[test]
fn idle_explicit_user_gc_runs_concurrent_global() {
    let (heap, control) = started(|_| {});

    assert_eq!(control.gc_id(), 0);
    control.request_gc(GcCause::UserRequested);

    assert!(control.gc_id() >= 1);
    assert!(heap.policy().cycle_counts().explicit_to_concurrent >= 1);
    assert!(heap.policy().cycle_counts().success_concurrent >= 1);
    assert!(wait_until(Duration::from_secs(5), || {
        control.mode() == GcMode::Idle
    }));
    // The forceful soft-ref policy was retracted after the cycle.
    assert!(!heap.soft_ref_policy().should_clear_all_soft_refs());

    control.stop();
    assert!(control.is_terminated());
}

#[test]
fn explicit_gc_with_concurrent_disabled_goes_full() {
    let (heap, control) = started(|o| o.explicit_gc_invokes_concurrent = false);

    control.request_gc(GcCause::UserRequested);

    let counts = heap.policy().cycle_counts();
    assert!(counts.explicit_to_full >= 1);
    assert!(counts.success_full >= 1);
    assert_eq!(counts.explicit_to_concurrent, 0);
    assert!(!heap.soft_ref_policy().should_clear_all_soft_refs());

    control.stop();
}

#[test]
fn disabled_explicit_gc_is_dropped_entirely() {
    let (heap, control) = started(|o| o.disable_explicit_gc = true);

    control.request_gc(GcCause::UserRequested);
    // Returned without effect: no cycle may have run for it.
    assert_eq!(heap.policy().cycle_counts().explicit_to_concurrent, 0);
    assert_eq!(heap.policy().cycle_counts().explicit_to_full, 0);

    // Non-explicit causes still work.
    control.request_gc(GcCause::TestFullGc);
    assert!(control.gc_id() >= 1);

    control.stop();
}

#[test]
fn breakpoint_request_completes_without_cv_wait() {
    let (heap, control) = started(|_| {});

    control.request_gc(GcCause::Breakpoint);

    assert!(control.gc_id() >= 1);
    let counts = heap.policy().cycle_counts();
    assert!(counts.implicit_to_full + counts.implicit_to_concurrent >= 1);

    control.stop();
}

#[test]
fn alloc_failure_blocks_until_degenerated_cycle_completes() {
    let (heap, control) = started(|_| {});

    // Give the collector something reclaimable.
    let idx = heap.acquire_region().unwrap();
    heap.retire_region(idx);

    control.handle_alloc_failure(AllocRequest::for_mutator(1024));

    // The failure flag is consumed, its cycle ran, and the trash is gone.
    assert!(!control.is_alloc_failure_gc());
    assert!(control.gc_id() >= 1);
    assert!(heap.policy().cycle_counts().alloc_failure_to_degenerated >= 1);
    assert_eq!(heap.used(), 0);
    assert!(!heap.cancelled_gc());

    control.stop();
}

#[test]
fn alloc_failure_cancels_concurrent_cycle_into_degeneration() {
    let (heap, control) = started(|o| o.phase_pause_ms = 25);

    let idx = heap.acquire_region().unwrap();
    heap.retire_region(idx);
    let _live = heap.acquire_region().unwrap();

    assert!(control.request_concurrent_gc(GenerationKind::Young));
    assert!(wait_until(Duration::from_secs(5), || {
        control.mode() != GcMode::Idle
    }));

    control.handle_alloc_failure(AllocRequest::for_tlab(2048));

    assert!(!control.is_alloc_failure_gc());
    let counts = heap.policy().cycle_counts();
    assert!(counts.alloc_failure_to_degenerated + counts.alloc_failure_to_full >= 1);
    assert!(control.gc_id() >= 1);
    assert!(!heap.cancelled_gc());

    control.stop();
}

#[test]
fn evac_failure_does_not_block_and_degenerates_later() {
    let (heap, control) = started(|_| {});

    let idx = heap.acquire_region().unwrap();
    heap.retire_region(idx);

    control.handle_alloc_failure_evac(512);
    // Non-blocking: the flag is set now and consumed by the next cycle.
    assert!(wait_until(Duration::from_secs(5), || {
        !control.is_alloc_failure_gc()
    }));
    assert!(heap.policy().cycle_counts().alloc_failure_to_degenerated >= 1);
    assert!(!heap.cancelled_gc());
    assert!(!heap.is_oom_during_evac());

    control.stop();
}

#[test]
fn young_preempts_old_marking_and_old_resumes() {
    let (heap, control) = started(|o| o.phase_pause_ms = 25);

    // Enough live regions to keep the old mark busy for many chunks.
    for _ in 0..24 {
        let _ = heap.acquire_region().unwrap();
    }

    assert!(control.request_concurrent_gc(GenerationKind::Old));
    assert!(wait_until(Duration::from_secs(10), || {
        heap.is_concurrent_old_mark_in_progress()
    }));

    // Hammer the regulator entry point until the preemption lands.
    let mut preempted = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if control.request_concurrent_gc(GenerationKind::Young) {
            preempted = true;
            break;
        }
        if !heap.is_concurrent_old_mark_in_progress()
            && !heap.is_prep_for_mixed_evac_in_progress()
        {
            break;
        }
        std::thread::yield_now();
    }
    assert!(preempted, "young preemption of old marking never landed");

    // The preempted old mark stays in progress across the young cycle and
    // is resumed and finished by the idle loop afterwards.
    assert!(wait_until(Duration::from_secs(10), || {
        !heap.is_concurrent_old_mark_in_progress()
            && !heap.is_prep_for_mixed_evac_in_progress()
    }));
    assert!(heap.old_generation().is_mark_complete());
    assert!(heap.young_generation().old_gen_task_queues().is_none());
    assert!(heap.policy().cycle_counts().success_concurrent >= 3);
    assert!(!heap.cancelled_gc());

    control.stop();
}

#[test]
fn soft_max_change_triggers_clamped_shrink() {
    let (heap, control) = started(|o| {
        // Keep the periodic shrink far away so only the soft-max change
        // can trigger uncommit.
        o.uncommit_delay = Duration::from_secs(3600);
    });

    let max = heap.max_capacity();
    let min = heap.min_capacity();
    assert_eq!(heap.committed(), max);

    heap.set_soft_max_heap_size(max / 2);
    assert!(wait_until(Duration::from_secs(5), || {
        heap.soft_max_capacity() == max / 2
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        heap.committed() <= max / 2
    }));

    // A request below min clamps to min.
    heap.set_soft_max_heap_size(1);
    assert!(wait_until(Duration::from_secs(5), || {
        heap.soft_max_capacity() == min
    }));
    assert!(heap.soft_max_capacity() >= min);
    assert!(heap.soft_max_capacity() <= max);

    control.stop();
}

#[test]
fn graceful_shutdown_exits_loop() {
    let (_heap, control) = started(|_| {});

    control.prepare_for_graceful_shutdown();
    control.stop();
    assert!(control.is_terminated());
}

#[test]
fn gc_id_advances_per_blocking_request() {
    let (_heap, control) = started(|_| {});

    let before = control.gc_id();
    for _ in 0..4 {
        control.request_gc(GcCause::UserRequested);
    }
    // Each blocking request returns only after at least one new cycle.
    assert!(control.gc_id() >= before + 4);

    control.stop();
}

#[test]
fn concurrent_requesters_all_unblock_and_gc_id_stays_monotonic() {
    let (heap, control) = started(|_| {});

    let stop_sampling = Arc::new(AtomicBool::new(false));
    let sampler = {
        let control = control.clone();
        let stop = stop_sampling.clone();
        std::thread::spawn(move || {
            let mut last = 0;
            let mut max_step = 0;
            while !stop.load(Ordering::Relaxed) {
                let id = control.gc_id();
                assert!(id >= last, "gc_id went backwards: {last} -> {id}");
                if id > last {
                    max_step = max_step.max(id - last);
                }
                last = id;
                std::thread::yield_now();
            }
            max_step
        })
    };

    let done = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..4 {
        let control = control.clone();
        let done = done.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..3 {
                let cause = if i % 2 == 0 {
                    GcCause::UserRequested
                } else {
                    GcCause::TestFullGc
                };
                control.request_gc(cause);
            }
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }
    let regulator = {
        let control = control.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while done.load(Ordering::Relaxed) < 4 {
                let _ = control.request_concurrent_gc(GenerationKind::Young);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    regulator.join().unwrap();
    stop_sampling.store(true, Ordering::Relaxed);
    sampler.join().unwrap();

    // Four concurrent requesters can share one cycle, but each thread's
    // three sequential requests need three distinct cycles.
    assert!(control.gc_id() >= 3);
    assert!(heap.policy().cycle_counts().total_completed() >= 3);
    control.stop();
}

#[test]
fn regulator_requests_are_swallowed_while_pending() {
    let (heap, control) = started(|o| o.phase_pause_ms = 25);

    assert!(control.request_concurrent_gc(GenerationKind::Young));
    assert!(wait_until(Duration::from_secs(5), || {
        control.mode() != GcMode::Idle
    }));
    // Not old marking, so no preemption window: the request is swallowed.
    assert!(!control.request_concurrent_gc(GenerationKind::Young));

    // A cancelled heap swallows requests too.
    assert!(wait_until(Duration::from_secs(5), || {
        control.mode() == GcMode::Idle
    }));
    heap.cancel_gc(GcCause::AllocationFailure);
    assert!(!control.request_concurrent_gc(GenerationKind::Young));
    control.handle_alloc_failure(AllocRequest::for_mutator(64));
    control.stop();
}

#[test]
fn pacer_gets_idle_allocations_reported() {
    let (heap, control) = started(|o| o.pacing = true);

    let pacer_budget = heap.pacer().unwrap().budget_words();
    let idx = heap.acquire_region().unwrap();
    // The tally drains into the pacer on an idle iteration, debiting its
    // budget by the allocated words.
    assert!(wait_until(Duration::from_secs(5), || {
        heap.pacer().unwrap().budget_words() < pacer_budget
    }));
    heap.retire_region(idx);

    control.stop();
}

#[test]
fn counters_update_flag_is_consumed_by_periodic_task() {
    let (heap, control) = started(|_| {});

    let before = heap.monitoring().update_count();
    control.notify_heap_changed();
    assert!(wait_until(Duration::from_secs(5), || {
        heap.monitoring().update_count() > before
    }));

    control.stop();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The signal flag behaves like a boolean under any op sequence.
    #[test]
    fn signal_flag_matches_boolean_model(ops in proptest::collection::vec(0u8..6, 1..64)) {
        let flag = SignalFlag::new();
        let mut model = false;
        for op in ops {
            match op {
                0 => { flag.set(); model = true; }
                1 => { flag.unset(); model = false; }
                2 => {
                    let changed = flag.try_set();
                    prop_assert_eq!(changed, !model);
                    model = true;
                }
                3 => {
                    let changed = flag.try_unset();
                    prop_assert_eq!(changed, model);
                    model = false;
                }
                4 => { flag.set_cond(true); model = true; }
                _ => { flag.set_cond(false); model = false; }
            }
            prop_assert_eq!(flag.is_set(), model);
            prop_assert_eq!(flag.is_unset(), !model);
        }
    }

    /// Soft max observation always lands in [min_capacity, max_capacity].
    #[test]
    fn soft_max_is_always_clamped(request in 0usize..(256 * MB)) {
        let heap = Heap::new(HeapOptions::with_max_heap(64 * MB)).unwrap();
        let control = ControlThread::new(&heap);

        heap.set_soft_max_heap_size(request);
        let _ = control.check_soft_max_changed(&heap);

        prop_assert!(heap.soft_max_capacity() >= heap.min_capacity());
        prop_assert!(heap.soft_max_capacity() <= heap.max_capacity());
        // A second observation of the same request reports no change.
        prop_assert!(!control.check_soft_max_changed(&heap));
    }
}
