use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use atomic::{Atomic, Ordering};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cause::GcCause;
use crate::control::ControlThread;
use crate::free_set::FreeSet;
use crate::generation::{Generation, GenerationKind};
use crate::heuristics::AdaptiveHeuristics;
use crate::monitoring::MonitoringSupport;
use crate::options::{HeapOptions, OptionsError};
use crate::pacer::Pacer;
use crate::phase_timings::{PhaseTimings, TimedPhase};
use crate::policy::CollectorPolicy;
use crate::region::{HeapRegion, RegionGeometry};
use crate::signals::SignalFlag;
use crate::utils::formatted_size;

/// What an allocating thread was trying to do when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Mutator,
    Tlab,
    Gclab,
    SharedGc,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    kind: AllocKind,
    words: usize,
}

impl AllocRequest {
    pub fn for_mutator(words: usize) -> Self {
        Self {
            kind: AllocKind::Mutator,
            words,
        }
    }

    pub fn for_tlab(words: usize) -> Self {
        Self {
            kind: AllocKind::Tlab,
            words,
        }
    }

    pub fn for_gclab(words: usize) -> Self {
        Self {
            kind: AllocKind::Gclab,
            words,
        }
    }

    pub fn words(self) -> usize {
        self.words
    }

    pub fn kind(self) -> AllocKind {
        self.kind
    }

    pub fn type_string(self) -> &'static str {
        match self.kind {
            AllocKind::Mutator => "shared allocation",
            AllocKind::Tlab => "TLAB",
            AllocKind::Gclab => "GCLAB",
            AllocKind::SharedGc => "shared GC allocation",
        }
    }
}

/// Soft-reference clearing policy for the cycle in flight. Forced on for
/// global cycles servicing memory pressure, retracted afterwards.
pub struct SoftRefPolicy {
    clear_all: AtomicBool,
}

impl SoftRefPolicy {
    fn new() -> Self {
        Self {
            clear_all: AtomicBool::new(false),
        }
    }

    pub fn set_should_clear_all_soft_refs(&self, value: bool) {
        self.clear_all.store(value, Ordering::Release);
    }

    pub fn should_clear_all_soft_refs(&self) -> bool {
        self.clear_all.load(Ordering::Acquire)
    }
}

/// Region table and free set, guarded together by the heap lock so region
/// state and its accounting change atomically.
pub struct HeapInner {
    pub(crate) regions: Vec<HeapRegion>,
    pub(crate) free_set: FreeSet,
}

impl HeapInner {
    pub fn free_set(&self) -> &FreeSet {
        &self.free_set
    }

    pub fn region(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }
}

/// The shared heap context.
///
/// The heap owns the control thread; the control thread and the
/// collaborators treat their heap reference as a non-owning handle that
/// stays valid for as long as the thread runs.
pub struct Heap {
    options: HeapOptions,
    geometry: RegionGeometry,
    epoch: Instant,

    inner: Mutex<HeapInner>,

    young: Generation,
    old: Generation,
    global: Generation,

    policy: CollectorPolicy,
    pacer: Option<Pacer>,
    monitoring: MonitoringSupport,
    phase_timings: PhaseTimings,
    soft_ref_policy: SoftRefPolicy,

    committed: AtomicUsize,
    soft_max_capacity: AtomicUsize,
    soft_max_request: AtomicUsize,
    bytes_allocated_since_gc_start: AtomicUsize,
    metaspace_used: AtomicUsize,

    /// `NoCause` means no cancellation pending. First setter wins.
    cancelled: Atomic<GcCause>,
    oom_during_evac: SignalFlag,
    old_evacuation_failed: SignalFlag,

    concurrent_old_mark_in_progress: AtomicBool,
    prep_for_mixed_evac_in_progress: AtomicBool,
    aging_cycle: AtomicBool,
    unload_classes: AtomicBool,

    whole_heap_examined: Atomic<f64>,

    control: OnceLock<Arc<ControlThread>>,
}

impl Heap {
    pub fn new(options: HeapOptions) -> Result<Arc<Self>, OptionsError> {
        options.validate()?;
        let geometry = RegionGeometry::setup(options.max_heap_size, options.region_size_target);

        let regions: Vec<_> = (0..geometry.region_count)
            .map(|i| HeapRegion::new(i, 0.0))
            .collect();
        let mut free_set = FreeSet::new(geometry);
        free_set.rebuild(&regions);
        let committed = geometry.region_count * geometry.region_size_bytes;

        let soft_max = options
            .soft_max_heap_size
            .clamp(options.min_heap_size, geometry.max_heap_size);

        let heap = Arc::new(Self {
            young: Generation::new(
                GenerationKind::Young,
                Box::new(AdaptiveHeuristics::new(options.full_gc_threshold, false)),
            ),
            old: Generation::new(
                GenerationKind::Old,
                Box::new(AdaptiveHeuristics::new(options.full_gc_threshold, false)),
            ),
            global: Generation::new(
                GenerationKind::Global,
                Box::new(AdaptiveHeuristics::new(options.full_gc_threshold, true)),
            ),
            policy: CollectorPolicy::new(),
            pacer: options
                .pacing
                .then(|| Pacer::new(geometry.region_size_words * 4)),
            monitoring: MonitoringSupport::new(),
            phase_timings: PhaseTimings::new(),
            soft_ref_policy: SoftRefPolicy::new(),
            inner: Mutex::new(HeapInner { regions, free_set }),
            committed: AtomicUsize::new(committed),
            soft_max_capacity: AtomicUsize::new(soft_max),
            soft_max_request: AtomicUsize::new(soft_max),
            bytes_allocated_since_gc_start: AtomicUsize::new(0),
            metaspace_used: AtomicUsize::new(0),
            cancelled: Atomic::new(GcCause::NoCause),
            oom_during_evac: SignalFlag::new(),
            old_evacuation_failed: SignalFlag::new(),
            concurrent_old_mark_in_progress: AtomicBool::new(false),
            prep_for_mixed_evac_in_progress: AtomicBool::new(false),
            aging_cycle: AtomicBool::new(false),
            unload_classes: AtomicBool::new(false),
            whole_heap_examined: Atomic::new(0.0),
            epoch: Instant::now(),
            options,
            geometry,
            control: OnceLock::new(),
        });
        Ok(heap)
    }

    /// Spawns the control thread and its periodic subtasks. Call once.
    pub fn start_control_thread(self: &Arc<Self>) -> Arc<ControlThread> {
        let control = ControlThread::start(self);
        self.control
            .set(control.clone())
            .unwrap_or_else(|_| panic!("control thread already started"));
        control
    }

    pub fn control_thread(&self) -> &Arc<ControlThread> {
        self.control.get().expect("control thread not started")
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn geometry(&self) -> &RegionGeometry {
        &self.geometry
    }

    pub fn is_generational(&self) -> bool {
        self.options.generational
    }

    /// Seconds since the heap came up; the time base for region empty
    /// stamps and the shrink schedule.
    pub fn elapsed(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// The heap lock. Must not be held across collaborator phase
    /// execution.
    pub fn locked(&self) -> MutexGuard<'_, HeapInner> {
        self.inner.lock()
    }

    // Capacity accounting.

    pub fn max_capacity(&self) -> usize {
        self.geometry.region_count * self.geometry.region_size_bytes
    }

    pub fn min_capacity(&self) -> usize {
        self.options.min_heap_size
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.locked().free_set.used()
    }

    pub fn soft_max_capacity(&self) -> usize {
        self.soft_max_capacity.load(Ordering::Acquire)
    }

    pub(crate) fn set_soft_max_capacity(&self, bytes: usize) {
        self.soft_max_capacity.store(bytes, Ordering::Release);
    }

    /// Runtime-mutable soft capacity target; observed (and clamped) by the
    /// control loop on its next iteration.
    pub fn set_soft_max_heap_size(&self, bytes: usize) {
        self.soft_max_request.store(bytes, Ordering::Release);
        if let Some(control) = self.control.get() {
            control.notify_control_thread();
        }
    }

    pub(crate) fn requested_soft_max(&self) -> usize {
        self.soft_max_request.load(Ordering::Acquire)
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.bytes_allocated_since_gc_start.load(Ordering::Relaxed)
    }

    pub fn reset_bytes_allocated_since_gc_start(&self) {
        self.bytes_allocated_since_gc_start
            .store(0, Ordering::Relaxed);
    }

    // Generations.

    pub fn young_generation(&self) -> &Generation {
        &self.young
    }

    pub fn old_generation(&self) -> &Generation {
        &self.old
    }

    pub fn global_generation(&self) -> &Generation {
        &self.global
    }

    pub fn generation(&self, kind: GenerationKind) -> &Generation {
        match kind {
            GenerationKind::Young => &self.young,
            GenerationKind::Old => &self.old,
            GenerationKind::Global => &self.global,
        }
    }

    pub fn policy(&self) -> &CollectorPolicy {
        &self.policy
    }

    pub fn pacer(&self) -> Option<&Pacer> {
        self.pacer.as_ref()
    }

    pub fn monitoring(&self) -> &MonitoringSupport {
        &self.monitoring
    }

    pub fn phase_timings(&self) -> &PhaseTimings {
        &self.phase_timings
    }

    pub fn soft_ref_policy(&self) -> &SoftRefPolicy {
        &self.soft_ref_policy
    }

    pub fn metaspace_used(&self) -> usize {
        self.metaspace_used.load(Ordering::Acquire)
    }

    /// Embedder-maintained metadata usage; reported around cycles.
    pub fn set_metaspace_used(&self, bytes: usize) {
        self.metaspace_used.store(bytes, Ordering::Release);
    }

    // Cancellation.

    /// Requests cancellation of the cycle in flight. The first caller
    /// wins; collaborators observe the flag at their next polling point
    /// and return without unwinding.
    pub fn cancel_gc(&self, cause: GcCause) -> bool {
        let cancelled = self
            .cancelled
            .compare_exchange(GcCause::NoCause, cause, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            info!(cause = %cause, "cancelling GC");
        }
        if cause == GcCause::AllocFailureEvac {
            self.oom_during_evac.set();
        }
        cancelled
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancellation_cause() != GcCause::NoCause
    }

    pub fn cancellation_cause(&self) -> GcCause {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Consumes the cancellation. Preemption keeps the evacuation OOM
    /// indicator; everything else clears it.
    pub fn clear_cancelled_gc(&self, clear_oom_handler: bool) {
        self.cancelled.store(GcCause::NoCause, Ordering::Release);
        if clear_oom_handler {
            self.oom_during_evac.unset();
        }
    }

    pub fn is_oom_during_evac(&self) -> bool {
        self.oom_during_evac.is_set()
    }

    pub fn report_old_evacuation_failure(&self) {
        self.old_evacuation_failed.set();
    }

    /// Reads and clears the old-evacuation-failure indicator.
    pub fn clear_old_evacuation_failure(&self) -> bool {
        self.old_evacuation_failed.try_unset()
    }

    // In-progress flags.

    pub fn is_concurrent_old_mark_in_progress(&self) -> bool {
        self.concurrent_old_mark_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_concurrent_old_mark_in_progress(&self, value: bool) {
        self.concurrent_old_mark_in_progress
            .store(value, Ordering::Release);
    }

    pub fn is_prep_for_mixed_evac_in_progress(&self) -> bool {
        self.prep_for_mixed_evac_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn set_prep_for_mixed_evac_in_progress(&self, value: bool) {
        self.prep_for_mixed_evac_in_progress
            .store(value, Ordering::Release);
    }

    pub fn is_aging_cycle(&self) -> bool {
        self.aging_cycle.load(Ordering::Acquire)
    }

    pub(crate) fn set_aging_cycle(&self, value: bool) {
        self.aging_cycle.store(value, Ordering::Release);
    }

    pub fn unload_classes(&self) -> bool {
        self.unload_classes.load(Ordering::Acquire)
    }

    pub(crate) fn set_unload_classes(&self, value: bool) {
        self.unload_classes.store(value, Ordering::Release);
    }

    // Allocation surface. The object-level allocator is out of scope; the
    // control plane hands out and takes back whole regions.

    /// Takes an empty region for allocation, committing one if necessary.
    /// Returns its index, or None when the heap is exhausted (the caller
    /// is expected to go through `ControlThread::handle_alloc_failure`).
    pub fn acquire_region(&self) -> Option<usize> {
        let now = self.elapsed();
        let mut guard = self.locked();
        let inner = &mut *guard;
        let geometry = self.geometry;

        let mut candidate = inner.regions.iter().position(|r| r.is_empty_committed());
        if candidate.is_none() {
            if let Some(idx) = inner.regions.iter().position(|r| !r.is_committed()) {
                inner.regions[idx].make_committed(now);
                self.committed
                    .fetch_add(geometry.region_size_bytes, Ordering::AcqRel);
                candidate = Some(idx);
            }
        }

        let idx = candidate?;
        inner.regions[idx].make_regular(geometry.region_size_words);
        inner.free_set.rebuild(&inner.regions);
        drop(guard);

        self.bytes_allocated_since_gc_start
            .fetch_add(geometry.region_size_bytes, Ordering::Relaxed);
        if let Some(control) = self.control.get() {
            control.notify_heap_changed();
            if self.options.pacing {
                control.pacing_notify_alloc(geometry.region_size_words);
            }
        }
        Some(idx)
    }

    /// Returns a fully-garbage region to the collector: it becomes trash
    /// and is reclaimed by the next cycle.
    pub fn retire_region(&self, index: usize) {
        let mut guard = self.locked();
        let inner = &mut *guard;
        inner.regions[index].make_trash();
        inner.free_set.rebuild(&inner.regions);
    }

    /// Trash -> empty committed, stamping the empty time. Returns how many
    /// regions were recycled.
    pub(crate) fn recycle_trash(&self) -> usize {
        let now = self.elapsed();
        let mut guard = self.locked();
        let inner = &mut *guard;
        let mut recycled = 0;
        for region in inner.regions.iter_mut() {
            if region.is_trash() {
                region.recycle(now);
                recycled += 1;
            }
        }
        if recycled > 0 {
            inner.free_set.rebuild(&inner.regions);
        }
        recycled
    }

    // Shrinking.

    /// Any empty committed region idle since before `shrink_before`?
    pub(crate) fn has_uncommit_work(&self, shrink_before: f64, shrink_until: usize) -> bool {
        if self.committed() <= shrink_until {
            return false;
        }
        let inner = self.locked();
        inner
            .regions
            .iter()
            .any(|r| r.is_empty_committed() && r.empty_time() < shrink_before)
    }

    /// Uncommits idle empty regions until `shrink_until` committed bytes
    /// remain.
    pub(crate) fn uncommit(&self, shrink_before: f64, shrink_until: usize) {
        let start = Instant::now();
        let mut count = 0;
        {
            let mut guard = self.locked();
            let inner = &mut *guard;
            for region in inner.regions.iter_mut() {
                if self.committed.load(Ordering::Acquire) <= shrink_until {
                    break;
                }
                if region.is_empty_committed() && region.empty_time() < shrink_before {
                    region.make_uncommitted();
                    self.committed
                        .fetch_sub(self.geometry.region_size_bytes, Ordering::AcqRel);
                    count += 1;
                }
            }
            if count > 0 {
                inner.free_set.rebuild(&inner.regions);
            }
        }
        if count > 0 {
            info!(
                regions = count,
                freed = %formatted_size(count * self.geometry.region_size_bytes),
                committed = %formatted_size(self.committed()),
                "uncommitted empty regions"
            );
        }
        self.phase_timings
            .record_phase(TimedPhase::Uncommit, start.elapsed());
    }

    // Monitoring hooks.

    /// Refreshes the published monitoring counters.
    pub fn update_counters(&self) {
        let used = self.used();
        self.monitoring.update_counters(
            used,
            self.committed(),
            self.max_capacity(),
            self.policy.cycle_counts().total_completed(),
        );
    }

    pub fn update_capacity_and_used_at_gc(&self) {
        self.update_counters();
    }

    pub fn record_whole_heap_examined_timestamp(&self) {
        let now = self.elapsed();
        self.whole_heap_examined.store(now, Ordering::Release);
        debug!(at = now, "whole heap examined");
    }

    pub fn whole_heap_examined_timestamp(&self) -> f64 {
        self.whole_heap_examined.load(Ordering::Acquire)
    }

    /// Test/stress pacing: stalls a collaborator phase so cancellation
    /// windows stay open long enough to observe.
    pub(crate) fn stress_pause(&self) {
        let ms = self.options.phase_pause_ms;
        if ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(ms));
        }
    }
}
