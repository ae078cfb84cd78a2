use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use atomic::{Atomic, Ordering};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::cause::GcCause;
use crate::collect::{ConcurrentGc, DegenGc, DegenPoint, FullGc, OldGc};
use crate::generation::GenerationKind;
use crate::heap::{AllocRequest, Heap};
use crate::monitoring::MetaspaceStats;
use crate::periodic::PeriodicTask;
use crate::signals::SignalFlag;
use crate::utils::formatted_size;

/// Which collection the control loop is driving. `Idle` outside the
/// cycle-driver region; exactly one non-idle mode per driven cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Idle,
    ConcurrentNormal,
    StwDegenerated,
    StwFull,
    MarkingOld,
}

impl GcMode {
    pub fn name(self) -> &'static str {
        match self {
            GcMode::Idle => "idle",
            GcMode::ConcurrentNormal => "normal",
            GcMode::StwDegenerated => "degenerated",
            GcMode::StwFull => "full",
            GcMode::MarkingOld => "old mark",
        }
    }
}

/// A condition variable with its companion lock.
struct Monitor {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Monitor {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }
}

/// How often the counter-refresher subtask ticks.
const COUNTERS_UPDATE_PERIOD: Duration = Duration::from_millis(100);
/// How often the pacer notifier unblocks waiting allocators.
const PACER_NOTIFY_PERIOD: Duration = Duration::from_millis(50);

/// The collector control thread.
///
/// One dedicated thread arbitrates between allocation failures, explicit
/// and implicit requests, heuristic-driven cycles and in-progress
/// old-generation marking, picks one collection mode per iteration, and
/// drives it to completion. External threads interact exclusively through
/// the public request surface: signal flags plus the request inbox, with
/// condition variables for blocking until a cycle completes.
///
/// Young and old concurrent cycles are initiated by the regulator.
/// Implicit and explicit requests are handled here and always run a
/// global cycle (concurrent by default, overridable by options). Old
/// cycles degenerate to global, young cycles degenerate to young, and
/// both degenerated forms may upgrade to full:
///
/// ```text
///      +-----+ Idle +-----+-----------+---------------------+
///      |         +        |           |                     |
///      |         |        v           |                     |
///      |         |  Bootstrap Old +-- | ------------+       |
///      |         |   +                |             |       |
///      |         v   v                v             v       |
///      |    Resume Old <----------+ Young +--> Young Degen  |
///      |     +  +                                   +       |
///      v     |  |                                   |       |
///   Global <-+  |                                   |       |
///      +        |                                   |       |
///      |        v                                   v       |
///      +--->  Global Degen +--------------------> Full <----+
/// ```
pub struct ControlThread {
    heap: Weak<Heap>,

    alloc_failure_waiters: Monitor,
    gc_waiters: Monitor,
    control: Monitor,

    alloc_failure_gc: SignalFlag,
    gc_requested: SignalFlag,
    preemption_requested: SignalFlag,
    graceful_shutdown: SignalFlag,
    do_counters_update: SignalFlag,
    force_counters_update: SignalFlag,
    /// Armed by the old collector while marking; consumed by a young
    /// preemptor.
    allow_old_preemption: SignalFlag,

    requested_gc_cause: Atomic<GcCause>,
    requested_generation: Atomic<GenerationKind>,
    degen_point: Atomic<DegenPoint>,
    degen_generation: Atomic<Option<GenerationKind>>,

    mode: Atomic<GcMode>,
    gc_id: AtomicUsize,
    allocs_seen: CachePadded<AtomicUsize>,

    should_terminate: AtomicBool,
    terminated: AtomicBool,

    handle: Mutex<Option<JoinHandle<()>>>,
    periodic_tasks: Mutex<Vec<PeriodicTask>>,
}

impl ControlThread {
    pub(crate) fn start(heap: &Arc<Heap>) -> Arc<Self> {
        let control = Arc::new(Self::new(heap));

        let thread_control = control.clone();
        let thread_heap = heap.clone();
        let handle = std::thread::Builder::new()
            .name("gc-control".to_string())
            .spawn(move || thread_control.run_service(&thread_heap))
            .expect("failed to spawn the control thread");
        *control.handle.lock() = Some(handle);

        let mut tasks = Vec::new();
        let weak = Arc::downgrade(&control);
        tasks.push(PeriodicTask::enroll(
            "gc-periodic-counters",
            COUNTERS_UPDATE_PERIOD,
            move || {
                if let Some(control) = weak.upgrade() {
                    control.handle_force_counters_update();
                    control.handle_counters_update();
                }
            },
        ));
        if heap.options().pacing {
            let weak_heap = Arc::downgrade(heap);
            tasks.push(PeriodicTask::enroll(
                "gc-pacer-notify",
                PACER_NOTIFY_PERIOD,
                move || {
                    if let Some(heap) = weak_heap.upgrade() {
                        if let Some(pacer) = heap.pacer() {
                            pacer.notify_waiters();
                        }
                    }
                },
            ));
        }
        *control.periodic_tasks.lock() = tasks;

        control
    }

    pub(crate) fn new(heap: &Arc<Heap>) -> Self {
        Self {
            heap: Arc::downgrade(heap),
            alloc_failure_waiters: Monitor::new(),
            gc_waiters: Monitor::new(),
            control: Monitor::new(),
            alloc_failure_gc: SignalFlag::new(),
            gc_requested: SignalFlag::new(),
            preemption_requested: SignalFlag::new(),
            graceful_shutdown: SignalFlag::new(),
            do_counters_update: SignalFlag::new(),
            force_counters_update: SignalFlag::new(),
            allow_old_preemption: SignalFlag::new(),
            requested_gc_cause: Atomic::new(GcCause::NoCause),
            requested_generation: Atomic::new(GenerationKind::Global),
            degen_point: Atomic::new(DegenPoint::OutsideCycle),
            degen_generation: Atomic::new(None),
            mode: Atomic::new(GcMode::Idle),
            gc_id: AtomicUsize::new(0),
            allocs_seen: CachePadded::new(AtomicUsize::new(0)),
            should_terminate: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            handle: Mutex::new(None),
            periodic_tasks: Mutex::new(Vec::new()),
        }
    }

    fn heap(&self) -> Arc<Heap> {
        self.heap.upgrade().expect("heap outlives the control thread")
    }

    fn run_service(&self, heap: &Heap) {
        let default_mode = GcMode::ConcurrentNormal;

        let mut generation = GenerationKind::Global;
        let mut last_shrink_time = heap.elapsed();
        let mut age_period: usize = 0;

        // Shrink period avoids constantly polling regions for shrinking.
        // A period ten times lower than the delay keeps the observed lag
        // under a tenth of the true delay.
        let shrink_period = heap.options().shrink_period();

        let policy = heap.policy();

        while !self.in_graceful_shutdown() && !self.should_terminate() {
            // Figure out if we have pending requests.
            let alloc_failure_pending = self.alloc_failure_gc.is_set();
            let is_gc_requested = self.gc_requested.is_set();
            let requested_gc_cause = self.requested_gc_cause.load(Ordering::Acquire);
            let explicit_gc_requested = is_gc_requested && requested_gc_cause.is_explicit();
            let implicit_gc_requested = is_gc_requested && requested_gc_cause.is_implicit();

            // This control loop iteration has seen this much allocation.
            let allocs_seen = self.allocs_seen.swap(0, Ordering::Relaxed);

            // Check if we have seen a new target for soft max heap size.
            let soft_max_changed = self.check_soft_max_changed(heap);

            // Choose which GC mode to run in. The block below must select
            // a single mode. `None` here means no cycle was chosen; an
            // erased inbox cause (`GcCause::NoCause`) with the request
            // flag still up is a real trigger, so the two are distinct.
            self.set_gc_mode(GcMode::Idle);
            let mut cause: Option<GcCause> = None;
            let mut degen_point = DegenPoint::Unset;

            if alloc_failure_pending {
                // Allocation failure takes precedence: deal with it first.
                info!("trigger: handle allocation failure");
                cause = Some(GcCause::AllocationFailure);

                // Consume the degen point, and seed it with default value.
                degen_point = self
                    .degen_point
                    .swap(DegenPoint::OutsideCycle, Ordering::AcqRel);

                if degen_point == DegenPoint::OutsideCycle {
                    let fresh = if heap.is_generational() {
                        GenerationKind::Young
                    } else {
                        GenerationKind::Global
                    };
                    self.degen_generation.store(Some(fresh), Ordering::Release);
                }
                let degen_generation = self
                    .degen_generation
                    .load(Ordering::Acquire)
                    .expect("need to know which generation to resume");
                generation = degen_generation;
                let old_gen_evacuation_failed = heap.clear_old_evacuation_failure();

                let gen = heap.generation(generation);
                let should_degenerate = gen.heuristics().should_degenerate_cycle();

                // Do not bother with a degenerated cycle if old generation
                // evacuation failed.
                if heap.options().degenerated_gc && should_degenerate && !old_gen_evacuation_failed
                {
                    gen.heuristics().record_allocation_failure_gc();
                    policy.record_alloc_failure_to_degenerated(degen_point);
                    self.set_gc_mode(GcMode::StwDegenerated);
                } else {
                    gen.heuristics().record_allocation_failure_gc();
                    policy.record_alloc_failure_to_full();
                    generation = GenerationKind::Global;
                    self.set_gc_mode(GcMode::StwFull);
                }
            } else if explicit_gc_requested {
                cause = Some(requested_gc_cause);
                generation = GenerationKind::Global;
                info!(cause = %requested_gc_cause, "trigger: explicit GC request");

                heap.global_generation().heuristics().record_requested_gc();

                if heap.options().explicit_gc_invokes_concurrent {
                    policy.record_explicit_to_concurrent();
                    self.set_gc_mode(default_mode);
                    // Unload and clean up everything.
                    heap.set_unload_classes(
                        heap.global_generation().heuristics().can_unload_classes(),
                    );
                } else {
                    policy.record_explicit_to_full();
                    self.set_gc_mode(GcMode::StwFull);
                }
            } else if implicit_gc_requested {
                cause = Some(requested_gc_cause);
                generation = GenerationKind::Global;
                info!(cause = %requested_gc_cause, "trigger: implicit GC request");

                heap.global_generation().heuristics().record_requested_gc();

                if heap.options().implicit_gc_invokes_concurrent {
                    policy.record_implicit_to_concurrent();
                    self.set_gc_mode(default_mode);
                    // Unload and clean up everything.
                    heap.set_unload_classes(
                        heap.global_generation().heuristics().can_unload_classes(),
                    );
                } else {
                    policy.record_implicit_to_full();
                    self.set_gc_mode(GcMode::StwFull);
                }
            } else {
                // We only get here if the regulator requested a cycle or
                // an old-generation mark is in progress.
                if requested_gc_cause == GcCause::ConcurrentCycle {
                    // Preemption was requested or this is a regular cycle.
                    cause = Some(GcCause::ConcurrentCycle);
                    generation = self.requested_generation.load(Ordering::Acquire);
                    self.set_gc_mode(default_mode);

                    // Don't start a new old marking if one is already in
                    // progress.
                    if generation == GenerationKind::Old
                        && heap.is_concurrent_old_mark_in_progress()
                    {
                        self.set_gc_mode(GcMode::MarkingOld);
                    }

                    if generation == GenerationKind::Global {
                        heap.set_unload_classes(
                            heap.global_generation().heuristics().should_unload_classes(),
                        );
                    } else {
                        heap.set_unload_classes(false);
                    }
                } else if heap.is_concurrent_old_mark_in_progress()
                    || heap.is_prep_for_mixed_evac_in_progress()
                {
                    // Nobody asked us to do anything, but old-generation
                    // marking or preparation for mixed evacuation is in
                    // progress: resume working on it. Resumed old cycles
                    // never unload classes.
                    cause = Some(GcCause::ConcurrentCycle);
                    generation = GenerationKind::Old;
                    heap.set_unload_classes(false);
                    self.set_gc_mode(GcMode::MarkingOld);
                }

                // Don't spin here starting a cycle every time: clear the
                // requested cause. This races with blocking `request_gc`
                // callers, but they loop re-asserting the cause until a
                // full cycle completes.
                self.requested_gc_cause
                    .store(GcCause::NoCause, Ordering::Release);
            }

            // Blow all soft references on this cycle, if handling an
            // allocation failure, either kind of requested GC, or when
            // configured to do so unconditionally.
            if generation == GenerationKind::Global
                && (alloc_failure_pending
                    || implicit_gc_requested
                    || explicit_gc_requested
                    || heap.options().always_clear_soft_refs)
            {
                heap.soft_ref_policy().set_should_clear_all_soft_refs(true);
            }

            let gc_requested = self.mode() != GcMode::Idle;
            assert!(!gc_requested || cause.is_some(), "GC cause should be set");

            if gc_requested {
                let cause = cause.expect("GC cause should be set");

                // GC is starting, bump the internal ID.
                self.update_gc_id();

                heap.generation(generation).heuristics().record_cycle_start(cause);
                heap.reset_bytes_allocated_since_gc_start();

                let meta_sizes = MetaspaceStats::capture(heap.metaspace_used());

                // Sample the counters even without triggers from the
                // allocation machinery; this captures GC phases more
                // accurately.
                self.set_forced_counters_update(true);

                // Dump free set data for performance debugging.
                {
                    let inner = heap.locked();
                    inner.free_set().log_status();
                }

                heap.set_aging_cycle(false);
                match self.mode() {
                    GcMode::ConcurrentNormal => {
                        if generation == GenerationKind::Young {
                            if age_period == 0 {
                                heap.set_aging_cycle(true);
                                age_period = heap.options().aging_cycle_period - 1;
                            } else {
                                age_period -= 1;
                            }
                        }
                        self.service_concurrent_normal_cycle(heap, generation, cause);
                    }
                    GcMode::StwDegenerated => {
                        if !self.service_stw_degenerated_cycle(heap, cause, degen_point) {
                            // The degenerated GC upgraded to a full GC.
                            generation = GenerationKind::Global;
                        }
                    }
                    GcMode::StwFull => {
                        self.service_stw_full_cycle(heap, cause);
                    }
                    GcMode::MarkingOld => {
                        assert_eq!(
                            generation,
                            GenerationKind::Old,
                            "expected old generation here"
                        );
                        self.resume_concurrent_old_cycle(heap, cause);
                    }
                    GcMode::Idle => {
                        unreachable!("cycle driver entered without a mode")
                    }
                }

                // If this was the requested GC cycle, notify its waiters.
                if explicit_gc_requested || implicit_gc_requested {
                    self.notify_gc_waiters();
                }

                // If this was the allocation failure GC cycle, notify its
                // waiters.
                if alloc_failure_pending {
                    self.notify_alloc_failure_waiters();
                }

                // Report the free set state at the end of the cycle,
                // whether it completed or aborted.
                {
                    let inner = heap.locked();
                    inner.free_set().log_status();
                }

                // New heap usage feeds the global soft-ref policy; report
                // every time usage goes down, and stamp the completed
                // visit to all live objects.
                heap.update_capacity_and_used_at_gc();
                heap.record_whole_heap_examined_timestamp();

                // Disable forced counter updates, with one more refresh to
                // capture the state at the end of the GC session.
                self.handle_force_counters_update();
                self.set_forced_counters_update(false);

                // Retract forceful part of the soft refs policy.
                heap.soft_ref_policy().set_should_clear_all_soft_refs(false);

                // Clear metaspace oom flag, if the cycle unloaded classes.
                // Unloading is armed per cycle by the selector; retract it
                // so it cannot leak into the next cycle's bookkeeping.
                if heap.unload_classes() {
                    assert_eq!(
                        generation,
                        GenerationKind::Global,
                        "only unload classes during global cycles"
                    );
                    heap.global_generation().heuristics().clear_metaspace_oom();
                }
                heap.set_unload_classes(false);

                // Commit worker statistics to cycle data, print the cycle,
                // then commit it to the global totals.
                heap.phase_timings().flush_par_workers_to_cycle();
                if let Some(pacer) = heap.pacer() {
                    pacer.flush_stats_to_cycle();
                }
                heap.phase_timings().report_cycle();
                heap.phase_timings().flush_cycle_to_global();

                meta_sizes.print_change(heap.metaspace_used());

                // GC is over, we are at idle now.
                if let Some(pacer) = heap.pacer() {
                    pacer.setup_for_idle();
                }
            } else {
                // Allow allocators to know how much we have allocated.
                if heap.options().pacing && allocs_seen > 0 {
                    if let Some(pacer) = heap.pacer() {
                        pacer.report_alloc(allocs_seen);
                    }
                }
            }

            let current = heap.elapsed();
            if heap.options().uncommit
                && (explicit_gc_requested
                    || soft_max_changed
                    || current - last_shrink_time > shrink_period)
            {
                // Explicit GC tries to uncommit everything down to min
                // capacity. A soft-max change uncommits down to the target
                // capacity. Periodic uncommit takes suitable regions down
                // to min capacity.
                let shrink_before = if explicit_gc_requested || soft_max_changed {
                    current
                } else {
                    current - heap.options().uncommit_delay.as_secs_f64()
                };
                let shrink_until = if soft_max_changed {
                    heap.soft_max_capacity()
                } else {
                    heap.min_capacity()
                };

                self.service_uncommit(heap, shrink_before, shrink_until);
                heap.phase_timings().flush_cycle_to_global();
                last_shrink_time = current;
            }

            // Don't wait around if there was an allocation failure: start
            // the next cycle immediately. The timed wait is needed because
            // this thread must keep feeding alloc words to the pacer when
            // it does not perform a GC.
            if !self.is_alloc_failure_gc() {
                let mut guard = self.control.lock.lock();
                let _ = self
                    .control
                    .cv
                    .wait_for(&mut guard, heap.options().control_interval_max);
            }
        }

        // Wait for the actual stop(); cannot leave the service earlier.
        while !self.should_terminate() {
            std::thread::sleep(heap.options().control_interval_min);
        }
        self.terminated.store(true, Ordering::Release);
    }

    fn service_concurrent_normal_cycle(
        &self,
        heap: &Heap,
        generation: GenerationKind,
        cause: GcCause,
    ) {
        match generation {
            GenerationKind::Young => {
                // This might have interrupted an ongoing concurrent mark in
                // the old generation; promoted objects are the concern of
                // the collaborators, not of this loop.
                info!(gc_id = self.gc_id(), "start GC cycle (young)");
                self.service_concurrent_cycle(heap, GenerationKind::Young, cause, false);
                heap.young_generation().log_status();
            }
            GenerationKind::Global => {
                info!(gc_id = self.gc_id(), "start GC cycle (global)");
                self.service_concurrent_cycle(heap, GenerationKind::Global, cause, false);
                heap.global_generation().log_status();
            }
            GenerationKind::Old => {
                info!(gc_id = self.gc_id(), "start GC cycle (old)");
                self.service_concurrent_old_cycle(heap, cause);
                heap.old_generation().log_status();
            }
        }
    }

    /// A young cycle in bootstrap mode seeds the old generation's mark
    /// queues, then the loop transitions to resumed old marking without
    /// going back through the selector.
    fn service_concurrent_old_cycle(&self, heap: &Heap, cause: GcCause) {
        self.service_concurrent_cycle(heap, GenerationKind::Young, cause, true);
        if !heap.cancelled_gc() {
            // Reset the degenerated point. Normally that happens at the
            // top of the control loop, but here we have just completed a
            // young cycle that bootstrapped the old concurrent marking.
            self.degen_point
                .store(DegenPoint::OutsideCycle, Ordering::Release);

            heap.phase_timings().flush_par_workers_to_cycle();
            heap.phase_timings().flush_cycle_to_global();

            // From here we 'resume' the old concurrent mark. Reset and
            // init mark are skipped: the bootstrapping young cycle already
            // did that work.
            self.set_gc_mode(GcMode::MarkingOld);
            self.resume_concurrent_old_cycle(heap, cause);
        }
    }

    fn service_concurrent_cycle(
        &self,
        heap: &Heap,
        generation: GenerationKind,
        cause: GcCause,
        do_old_bootstrap: bool,
    ) {
        // A normal cycle goes through all concurrent phases. An allocation
        // failure during any of them degrades the cycle to degenerated GC,
        // which completes the collection at a pause; a second failure
        // during the degenerated cycle upgrades it to full GC.
        if self.check_cancellation_or_degen(heap, DegenPoint::OutsideCycle) {
            return;
        }

        let mut gc = ConcurrentGc::new(generation, do_old_bootstrap);
        if gc.collect(heap, cause) {
            // Cycle is complete.
            heap.generation(generation)
                .heuristics()
                .record_success_concurrent();
            heap.policy().record_success_concurrent();
        } else {
            assert!(heap.cancelled_gc(), "must have been cancelled");
            self.check_cancellation_or_degen(heap, gc.degen_point());
            assert!(
                generation != GenerationKind::Old,
                "old GC takes a different control path"
            );
            // Concurrent young collection degenerates to young, global to
            // global.
            self.degen_generation
                .store(Some(generation), Ordering::Release);
        }
    }

    fn resume_concurrent_old_cycle(&self, heap: &Heap, cause: GcCause) {
        assert!(
            heap.is_concurrent_old_mark_in_progress()
                || heap.is_prep_for_mixed_evac_in_progress(),
            "old mark or mixed-evac prep should be in progress"
        );
        debug!(
            tasks = heap.old_generation().task_queues().tasks(),
            "resuming old generation with queued marking tasks"
        );

        let mut gc = OldGc::new(&self.allow_old_preemption);
        if gc.collect(heap, cause) {
            // Old collection is complete; the young generation no longer
            // needs its reference to the old mark queues.
            heap.young_generation().set_old_gen_task_queues(None);
            heap.old_generation()
                .heuristics()
                .record_success_concurrent();
            heap.policy().record_success_concurrent();
        }

        if heap.cancelled_gc() {
            // The cycle may have been cancelled after the collection's
            // last cancellation check; the old cycle is still complete and
            // the cancellation must be consumed here. The degen point is
            // outside-cycle because there is no degenerated old cycle; a
            // preemption-driven cancellation ignores the point anyway.
            self.check_cancellation_or_degen(heap, DegenPoint::OutsideCycle);
        }
    }

    /// Consumes a pending cancellation into one of its three legal
    /// outcomes: an allocation-failure degeneration, a young preemption of
    /// old marking, or graceful shutdown. Anything else is a bug in the
    /// caller of `cancel_gc`.
    fn check_cancellation_or_degen(&self, heap: &Heap, point: DegenPoint) -> bool {
        if !heap.cancelled_gc() {
            return false;
        }

        if self.in_graceful_shutdown() {
            return true;
        }

        assert_eq!(
            self.degen_point.load(Ordering::Acquire),
            DegenPoint::OutsideCycle,
            "degen point should not be set yet"
        );

        if self.is_alloc_failure_gc() {
            self.degen_point.store(point, Ordering::Release);
            return true;
        }

        if self.preemption_requested.is_set() {
            assert_eq!(
                self.requested_generation.load(Ordering::Acquire),
                GenerationKind::Young,
                "only young GCs may preempt old"
            );
            self.preemption_requested.unset();

            // Old generation marking is only cancellable during concurrent
            // mark; an allocation-failure cancellation never reaches this
            // branch.
            self.degen_point.store(point, Ordering::Release);
            heap.clear_cancelled_gc(false);
            return true;
        }

        panic!("cancel GC either for alloc failure GC, or graceful exit, or to pause old marking");
    }

    fn service_stw_full_cycle(&self, heap: &Heap, cause: GcCause) {
        FullGc::new().collect(heap, cause);
        heap.global_generation().heuristics().record_success_full();
        heap.policy().record_success_full();
    }

    /// Returns false when the degenerated cycle upgraded to full.
    fn service_stw_degenerated_cycle(
        &self,
        heap: &Heap,
        cause: GcCause,
        point: DegenPoint,
    ) -> bool {
        assert!(point != DegenPoint::Unset, "degenerated point should be set");
        let degen_generation = self
            .degen_generation
            .load(Ordering::Acquire)
            .expect("degenerating generation should be set");

        // In case the degenerated cycle preempted old-gen marking, clear
        // the old-gen queue wiring.
        heap.young_generation().set_old_gen_task_queues(None);

        let mut gc = DegenGc::new(point, degen_generation);
        gc.collect(heap, cause);

        assert!(
            heap.young_generation().task_queues().is_empty(),
            "unexpected young generation marking tasks"
        );
        assert!(
            heap.old_generation().task_queues().is_empty(),
            "unexpected old generation marking tasks"
        );
        assert!(
            heap.global_generation().task_queues().is_empty(),
            "unexpected global generation marking tasks"
        );

        heap.generation(degen_generation)
            .heuristics()
            .record_success_degenerated();
        heap.policy().record_success_degenerated();
        !gc.upgraded_to_full()
    }

    fn service_uncommit(&self, heap: &Heap, shrink_before: f64, shrink_until: usize) {
        // Determine if there is work to do before taking the heap lock, to
        // avoid superfluous log lines and wasted lock traffic.
        if heap.has_uncommit_work(shrink_before, shrink_until) {
            heap.uncommit(shrink_before, shrink_until);
        }
    }

    pub(crate) fn check_soft_max_changed(&self, heap: &Heap) -> bool {
        let new_soft_max = heap.requested_soft_max();
        let old_soft_max = heap.soft_max_capacity();
        if new_soft_max != old_soft_max {
            let clamped = new_soft_max.clamp(heap.min_capacity(), heap.max_capacity());
            if clamped != old_soft_max {
                info!(
                    from = %formatted_size(old_soft_max),
                    to = %formatted_size(clamped),
                    "soft max heap size"
                );
                heap.set_soft_max_capacity(clamped);
                return true;
            }
        }
        false
    }

    // Public request surface.

    /// Requests a collection for `cause`. Blocks, through
    /// `handle_requested_gc`, until a full cycle has run after the request
    /// was observed. Explicit causes are dropped entirely when explicit GC
    /// is disabled by options.
    pub fn request_gc(&self, cause: GcCause) {
        assert!(cause.is_requestable(), "only requested GCs here: {cause}");

        if cause.is_explicit() {
            if !self.heap().options().disable_explicit_gc {
                self.handle_requested_gc(cause);
            }
        } else {
            self.handle_requested_gc(cause);
        }
    }

    /// Makes sure at least one complete GC cycle runs before unblocking.
    ///
    /// This matters for weak reference and native resource cleanup: a
    /// request arriving late in an already-running cycle would miss
    /// cleanup opportunities that appeared before the caller asked.
    ///
    /// The selector erases the inbox cause after reading it, so a request
    /// that raced the clear is re-asserted here until `gc_id` advances
    /// past the value captured at entry. The `Breakpoint` cause does not
    /// wait on the condition variable at all: it re-arms the request and
    /// returns to the check, preserving its non-blocking contract.
    fn handle_requested_gc(&self, cause: GcCause) {
        let mut ml = self.gc_waiters.lock.lock();
        let current_gc_id = self.gc_id();
        let required_gc_id = current_gc_id + 1;
        let mut current_gc_id = current_gc_id;
        while current_gc_id < required_gc_id {
            // The control loop reads the cause without taking the waiters
            // lock; store the cause before raising the flag so the loop
            // observes the latest value.
            self.requested_gc_cause.store(cause, Ordering::Release);
            self.gc_requested.set();
            self.notify_control_thread();
            if cause != GcCause::Breakpoint {
                self.gc_waiters.cv.wait(&mut ml);
            } else {
                std::thread::yield_now();
            }
            current_gc_id = self.gc_id();
        }
    }

    /// Regulator entry point: start a concurrent cycle on `generation`, or
    /// preempt an in-flight old mark for a young cycle. Returns false when
    /// the request is swallowed (a preemption or request is already
    /// pending, or the heap is already cancelled).
    pub fn request_concurrent_gc(&self, generation: GenerationKind) -> bool {
        let heap = self.heap();
        if self.preemption_requested.is_set()
            || self.gc_requested.is_set()
            || heap.cancelled_gc()
        {
            // Ignore subsequent requests from the heuristics.
            return false;
        }

        if self.mode() == GcMode::Idle {
            self.requested_gc_cause
                .store(GcCause::ConcurrentCycle, Ordering::Release);
            self.requested_generation.store(generation, Ordering::Release);
            self.notify_control_thread();
            return true;
        }

        if self.preempt_old_marking(generation) {
            info!("preempting old generation mark to allow young GC");
            self.requested_gc_cause
                .store(GcCause::ConcurrentCycle, Ordering::Release);
            self.requested_generation.store(generation, Ordering::Release);
            self.preemption_requested.set();
            heap.cancel_gc(GcCause::ConcurrentCycle);
            self.notify_control_thread();
            return true;
        }

        false
    }

    /// Old marking may be preempted only for a young cycle, and only while
    /// the old collector has the preemption window armed.
    fn preempt_old_marking(&self, generation: GenerationKind) -> bool {
        generation == GenerationKind::Young && self.allow_old_preemption.try_unset()
    }

    pub fn notify_control_thread(&self) {
        let _guard = self.control.lock.lock();
        self.control.cv.notify_one();
    }

    /// Invoked from allocating threads when allocation cannot proceed.
    /// Schedules the allocation-failure collection, cancels the in-flight
    /// cycle, and blocks until the failure cycle completes.
    pub fn handle_alloc_failure(&self, req: AllocRequest) {
        let heap = self.heap();

        if self.try_set_alloc_failure_gc() {
            // Only report the first allocation failure.
            info!(
                kind = req.type_string(),
                size = %formatted_size(req.words() * 8),
                "failed to allocate"
            );

            // Now that the alloc failure GC is scheduled, abort everything
            // else.
            heap.cancel_gc(GcCause::AllocationFailure);
        }

        let mut ml = self.alloc_failure_waiters.lock.lock();
        while self.is_alloc_failure_gc() {
            self.alloc_failure_waiters.cv.wait(&mut ml);
        }
    }

    /// Evacuation-failure flavor: forces the cancellation with its own
    /// cause and does not block.
    pub fn handle_alloc_failure_evac(&self, words: usize) {
        let heap = self.heap();

        if self.try_set_alloc_failure_gc() {
            // Only report the first allocation failure.
            info!(
                size = %formatted_size(words * 8),
                "failed to allocate for evacuation"
            );
        }

        // Forcefully report the allocation failure.
        heap.cancel_gc(GcCause::AllocFailureEvac);
    }

    fn notify_alloc_failure_waiters(&self) {
        self.alloc_failure_gc.unset();
        let _guard = self.alloc_failure_waiters.lock.lock();
        self.alloc_failure_waiters.cv.notify_all();
    }

    fn try_set_alloc_failure_gc(&self) -> bool {
        self.alloc_failure_gc.try_set()
    }

    pub fn is_alloc_failure_gc(&self) -> bool {
        self.alloc_failure_gc.is_set()
    }

    fn notify_gc_waiters(&self) {
        self.gc_requested.unset();
        let _guard = self.gc_waiters.lock.lock();
        self.gc_waiters.cv.notify_all();
    }

    pub(crate) fn handle_counters_update(&self) {
        if self.do_counters_update.is_set() {
            self.do_counters_update.unset();
            if let Some(heap) = self.heap.upgrade() {
                heap.update_counters();
            }
        }
    }

    pub(crate) fn handle_force_counters_update(&self) {
        if self.force_counters_update.is_set() {
            self.do_counters_update.unset(); // reset these too, we do update now
            if let Some(heap) = self.heap.upgrade() {
                heap.update_counters();
            }
        }
    }

    fn set_forced_counters_update(&self, value: bool) {
        self.force_counters_update.set_cond(value);
    }

    /// Called from the allocation path; must stay fast. Monitoring
    /// updates are amortized onto the periodic task.
    pub fn notify_heap_changed(&self) {
        if self.do_counters_update.is_unset() {
            self.do_counters_update.set();
        }
    }

    /// Atomic add to the allocation tally; drained once per control loop
    /// iteration.
    pub fn pacing_notify_alloc(&self, words: usize) {
        self.allocs_seen.fetch_add(words, Ordering::Relaxed);
    }

    pub fn prepare_for_graceful_shutdown(&self) {
        self.graceful_shutdown.set();
    }

    pub fn in_graceful_shutdown(&self) -> bool {
        self.graceful_shutdown.is_set()
    }

    fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Orderly shutdown: the loop observes the graceful-shutdown flag,
    /// exits, sits in its short-sleep tail until the terminate flag, and
    /// is then joined. Periodic subtasks are disenrolled afterwards.
    pub fn stop(&self) {
        self.prepare_for_graceful_shutdown();
        self.notify_control_thread();
        self.should_terminate.store(true, Ordering::Release);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.periodic_tasks.lock().clear();
    }

    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Acquire)
    }

    fn update_gc_id(&self) {
        self.gc_id.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mode(&self) -> GcMode {
        self.mode.load(Ordering::Acquire)
    }

    fn set_gc_mode(&self, new_mode: GcMode) {
        let old_mode = self.mode.load(Ordering::Acquire);
        if old_mode != new_mode {
            info!(from = old_mode.name(), to = new_mode.name(), "GC mode transition");
            self.mode.store(new_mode, Ordering::Release);
        }
    }
}
