use aya_ebpf::{
    bindings::{bpf_perf_event_data, BPF_NOEXIST},
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_get_smp_processor_id,
        bpf_ktime_get_ns, bpf_probe_read_kernel,
    },
    macros::{kprobe, map, perf_event, raw_tracepoint, tracepoint, uprobe, uretprobe},
    maps::{HashMap, RingBuf},
    programs::{
        PerfEventContext, ProbeContext, RawTracePointContext, RetProbeContext, TracePointContext,
    },
    EbpfContext,
};
use aya_log_ebpf::debug;
use scopeprobe_common::{
    cache_key, migration_key, tgid_of, CacheAccess, CacheOp, CacheOutcome, CacheStats,
    CounterKind, FunctionEvent, LifecycleEvent, MigrationEvent, PerfStats, ProcessSpan,
    ScopeId, ScopeOffsets, CACHE_ALLOW_CAPACITY, CACHE_TABLE_CAPACITY, COUNTER_TABLE_CAPACITY,
    FUNCTION_CHANNEL_BYTES, FUNCTION_SPAN_CAPACITY, LIFECYCLE_ALLOW_CAPACITY,
    LIFECYCLE_CHANNEL_BYTES, LIFECYCLE_SPAN_CAPACITY, MIGRATION_ALLOW_CAPACITY,
    MIGRATION_CHANNEL_BYTES, MIGRATION_SPAN_CAPACITY,
};

// =============================================================================
// MAPS
// =============================================================================
//
// Allow-lists are written only by the loader; presence of a scope id means
// "monitor". Capacities are the loader defaults and may be overridden at load.

#[map(name = "FUNCTION_SPANS")]
static mut FUNCTION_SPANS: HashMap<u64, u64> =
    HashMap::with_max_entries(FUNCTION_SPAN_CAPACITY, 0);

#[map(name = "FUNCTION_EVENTS")]
static mut FUNCTION_EVENTS: RingBuf = RingBuf::with_byte_size(FUNCTION_CHANNEL_BYTES, 0);

/// Per-scope hardware counters, shared with the lifecycle tracer and pinned
/// under a stable name so other processes can find it.
#[map(name = "proc_stats_map")]
static mut HW_STATS: HashMap<ScopeId, PerfStats> = HashMap::pinned(COUNTER_TABLE_CAPACITY, 0);

#[map(name = "LLC_SCOPES")]
static mut LLC_SCOPES: HashMap<ScopeId, u8> = HashMap::with_max_entries(CACHE_ALLOW_CAPACITY, 0);

#[map(name = "LLC_STATS")]
static mut LLC_STATS: HashMap<u64, CacheStats> =
    HashMap::with_max_entries(CACHE_TABLE_CAPACITY, 0);

#[map(name = "MIGRATION_SCOPES")]
static mut MIGRATION_SCOPES: HashMap<ScopeId, u8> =
    HashMap::with_max_entries(MIGRATION_ALLOW_CAPACITY, 0);

#[map(name = "MIGRATION_SPANS")]
static mut MIGRATION_SPANS: HashMap<u64, MigrationEvent> =
    HashMap::with_max_entries(MIGRATION_SPAN_CAPACITY, 0);

#[map(name = "MIGRATION_EVENTS")]
static mut MIGRATION_EVENTS: RingBuf = RingBuf::with_byte_size(MIGRATION_CHANNEL_BYTES, 0);

#[map(name = "PROCESS_SCOPES")]
static mut PROCESS_SCOPES: HashMap<ScopeId, u8> =
    HashMap::with_max_entries(LIFECYCLE_ALLOW_CAPACITY, 0);

#[map(name = "PROCESS_SPANS")]
static mut PROCESS_SPANS: HashMap<u32, ProcessSpan> =
    HashMap::with_max_entries(LIFECYCLE_SPAN_CAPACITY, 0);

#[map(name = "PROCESS_EVENTS")]
static mut PROCESS_EVENTS: RingBuf = RingBuf::with_byte_size(LIFECYCLE_CHANNEL_BYTES, 0);

// =============================================================================
// LOADER-WRITTEN GLOBALS
// =============================================================================

/// task_struct -> css_set -> cgroup -> kernfs_node offsets, discovered from
/// BTF by the loader. Left zeroed, no scope ever resolves.
#[no_mangle]
static mut SCOPE_OFFSETS: ScopeOffsets = ScopeOffsets::zeroed();

/// Non-zero: exit events carry a copy of the scope's hardware counters.
#[no_mangle]
static mut LIFECYCLE_MERGE_COUNTERS: u32 = 0;

fn load_offsets() -> ScopeOffsets {
    unsafe { core::ptr::read_volatile(&SCOPE_OFFSETS) }
}

fn merge_counters() -> bool {
    unsafe { core::ptr::read_volatile(&LIFECYCLE_MERGE_COUNTERS) != 0 }
}

// =============================================================================
// SCOPE RESOLUTION
// =============================================================================

fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read_kernel(ptr).ok() }
}

fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

/// Fixed-depth walk to the task's default-hierarchy cgroup id. Every hop is
/// null-checked; a broken chain is "unresolved", never scope 0.
#[inline(always)]
fn resolve_scope(task: *const u8) -> Option<ScopeId> {
    let offsets = load_offsets();
    if !offsets.chain_configured() {
        return None;
    }
    let css_set = read_ptr(task, offsets.task_cgroups)?;
    let cgroup = read_ptr(css_set, offsets.css_set_dfl_cgrp)?;
    let kn = read_ptr(cgroup, offsets.cgroup_kn)?;
    let id: u64 = read_field(kn, offsets.kernfs_node_id)?;
    Some(id as ScopeId)
}

#[inline(always)]
fn current_scope() -> Option<ScopeId> {
    let task = unsafe { bpf_get_current_task() } as *const u8;
    resolve_scope(task)
}

fn task_pid(task: *const u8) -> Option<u32> {
    let offset = load_offsets().task_pid;
    if offset == 0 {
        return None;
    }
    let pid: i32 = read_field(task, offset)?;
    Some(pid as u32)
}

fn task_cpu(task: *const u8) -> Option<u32> {
    let offset = load_offsets().task_cpu;
    if offset == 0 {
        return None;
    }
    read_field(task, offset)
}

/// Atomic fetch-and-add on a map value field; lowers to BPF_ATOMIC_ADD.
#[inline(always)]
unsafe fn atomic_fetch_add_u64(ptr: *mut u64, val: u64) -> u64 {
    core::intrinsics::atomic_xadd_acqrel(ptr, val)
}

#[inline(always)]
unsafe fn field_ptr<T>(base: *mut T, offset: usize) -> *mut u64 {
    (base as *mut u8).add(offset) as *mut u64
}

#[inline(always)]
fn raw_arg(ctx: &RawTracePointContext, n: usize) -> u64 {
    let args = ctx.as_ptr() as *const u64;
    unsafe { *args.add(n) }
}

// =============================================================================
// FUNCTION LATENCY
// =============================================================================

#[uprobe]
pub fn function_entry(_ctx: ProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let start = unsafe { bpf_ktime_get_ns() };
    let _ = unsafe { FUNCTION_SPANS.insert(&id, &start, 0) };
    0
}

#[uretprobe]
pub fn function_exit(_ctx: RetProbeContext) -> u32 {
    let id = bpf_get_current_pid_tgid();
    let start = match unsafe { FUNCTION_SPANS.get(&id) } {
        Some(start) => *start,
        // Entry missed or the span table was full.
        None => return 0,
    };
    let now = unsafe { bpf_ktime_get_ns() };

    if let Some(mut slot) = unsafe { FUNCTION_EVENTS.reserve::<FunctionEvent>(0) } {
        slot.write(FunctionEvent {
            pid: tgid_of(id),
            _pad: 0,
            duration_ns: now.saturating_sub(start),
        });
        slot.submit(0);
    }

    let _ = unsafe { FUNCTION_SPANS.remove(&id) };
    0
}

// =============================================================================
// HARDWARE COUNTERS
// =============================================================================
//
// One perf_event program per counter kind, all sharing `on_counter`. The
// accumulator must already exist: overflow handlers never create entries.

#[inline(always)]
fn on_counter(ctx: &PerfEventContext, kind: CounterKind) -> u32 {
    let Some(scope) = current_scope() else {
        return 0;
    };
    let Some(stats) = (unsafe { HW_STATS.get_ptr_mut(&scope) }) else {
        return 0;
    };
    let data = ctx.as_ptr() as *const bpf_perf_event_data;
    let period = unsafe { (*data).sample_period };
    unsafe { atomic_fetch_add_u64(field_ptr(stats, kind.field_offset()), period) };
    0
}

macro_rules! counter_programs {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            #[perf_event]
            pub fn $name(ctx: PerfEventContext) -> u32 {
                on_counter(&ctx, CounterKind::$kind)
            }
        )*
    };
}

counter_programs! {
    hw_cycles => Cycles,
    hw_instructions => Instructions,
    hw_ref_cycles => RefCycles,
    hw_cache_references => CacheReferences,
    hw_cache_misses => CacheMisses,
    hw_branches => Branches,
    hw_branch_misses => BranchMisses,
    hw_l1d_loads => L1dLoads,
    hw_l1d_load_misses => L1dLoadMisses,
    hw_l1d_stores => L1dStores,
    hw_l1d_store_misses => L1dStoreMisses,
    hw_l1d_prefetches => L1dPrefetches,
    hw_l1d_prefetch_misses => L1dPrefetchMisses,
    hw_l1i_loads => L1iLoads,
    hw_l1i_load_misses => L1iLoadMisses,
    hw_l1i_prefetches => L1iPrefetches,
    hw_llc_loads => LlcLoads,
    hw_llc_load_misses => LlcLoadMisses,
    hw_llc_stores => LlcStores,
    hw_llc_store_misses => LlcStoreMisses,
    hw_llc_prefetches => LlcPrefetches,
    hw_llc_prefetch_misses => LlcPrefetchMisses,
    hw_dtlb_loads => DtlbLoads,
    hw_dtlb_load_misses => DtlbLoadMisses,
    hw_dtlb_stores => DtlbStores,
    hw_dtlb_store_misses => DtlbStoreMisses,
    hw_dtlb_prefetches => DtlbPrefetches,
    hw_dtlb_prefetch_misses => DtlbPrefetchMisses,
    hw_tlb_loads => TlbLoads,
    hw_tlb_load_misses => TlbLoadMisses,
    hw_bpu_loads => BpuLoads,
    hw_bpu_load_misses => BpuLoadMisses,
}

// =============================================================================
// CACHE ACCESS CLASSIFIER
// =============================================================================

#[inline(always)]
fn on_cache_access(access: CacheAccess) -> u32 {
    let Some(scope) = current_scope() else {
        return 0;
    };
    if unsafe { LLC_SCOPES.get(&scope) }.is_none() {
        return 0;
    }

    let pid = tgid_of(bpf_get_current_pid_tgid());
    let cpu = unsafe { bpf_get_smp_processor_id() };
    let key = cache_key(pid, cpu);

    let stats = match unsafe { LLC_STATS.get_ptr_mut(&key) } {
        Some(stats) => stats,
        None => {
            // Losing the NOEXIST race is fine; re-fetch the winner's entry.
            let fresh = CacheStats::new(pid, cpu, scope);
            let _ = unsafe { LLC_STATS.insert(&key, &fresh, BPF_NOEXIST as u64) };
            match unsafe { LLC_STATS.get_ptr_mut(&key) } {
                Some(stats) => stats,
                None => return 0,
            }
        }
    };

    unsafe {
        atomic_fetch_add_u64(field_ptr(stats, access.references_offset()), 1);
        atomic_fetch_add_u64(field_ptr(stats, access.outcome_offset()), 1);
        atomic_fetch_add_u64(field_ptr(stats, access.total_offset()), 1);
        atomic_fetch_add_u64(field_ptr(stats, CacheAccess::TOTAL_REFERENCES_OFFSET), 1);
    }
    0
}

macro_rules! cache_programs {
    ($($name:ident => ($op:ident, $outcome:ident)),* $(,)?) => {
        $(
            #[perf_event]
            pub fn $name(_ctx: PerfEventContext) -> u32 {
                on_cache_access(CacheAccess::new(CacheOp::$op, CacheOutcome::$outcome))
            }
        )*
    };
}

cache_programs! {
    llc_read_hit => (Read, Hit),
    llc_read_miss => (Read, Miss),
    llc_write_hit => (Write, Hit),
    llc_write_miss => (Write, Miss),
    llc_prefetch_hit => (Prefetch, Hit),
    llc_prefetch_miss => (Prefetch, Miss),
}

// =============================================================================
// MIGRATION LATENCY
// =============================================================================

/// sched_migrate_task(struct task_struct *p, int dest_cpu)
#[raw_tracepoint(tracepoint = "sched_migrate_task")]
pub fn sched_migrate_task(ctx: RawTracePointContext) -> i32 {
    let task = raw_arg(&ctx, 0) as *const u8;
    let dest_cpu = raw_arg(&ctx, 1) as u32;

    let Some(scope) = resolve_scope(task) else {
        return 0;
    };
    if unsafe { MIGRATION_SCOPES.get(&scope) }.is_none() {
        return 0;
    }
    let (Some(pid), Some(source_cpu)) = (task_pid(task), task_cpu(task)) else {
        return 0;
    };

    let span = MigrationEvent {
        timestamp_start: unsafe { bpf_ktime_get_ns() },
        timestamp_end: 0,
        latency: 0,
        pid,
        source_cpu,
        target_cpu: dest_cpu,
        scope_id: scope,
    };
    let _ = unsafe { MIGRATION_SPANS.insert(&migration_key(scope, pid), &span, 0) };
    0
}

/// sched_switch(bool preempt, struct task_struct *prev, struct task_struct *next, ...)
#[raw_tracepoint(tracepoint = "sched_switch")]
pub fn sched_switch(ctx: RawTracePointContext) -> i32 {
    let next = raw_arg(&ctx, 2) as *const u8;
    let (Some(scope), Some(pid)) = (resolve_scope(next), task_pid(next)) else {
        return 0;
    };
    let key = migration_key(scope, pid);
    let mut event = match unsafe { MIGRATION_SPANS.get(&key) } {
        Some(span) => *span,
        None => return 0,
    };

    event.timestamp_end = unsafe { bpf_ktime_get_ns() };
    event.latency = event.timestamp_end.saturating_sub(event.timestamp_start);
    debug!(
        &ctx,
        "migration latency {} ns pid {} scope {} cpu {} -> {}",
        event.latency,
        event.pid,
        event.scope_id,
        event.source_cpu,
        event.target_cpu
    );

    if let Some(mut slot) = unsafe { MIGRATION_EVENTS.reserve::<MigrationEvent>(0) } {
        slot.write(event);
        slot.submit(0);
    }
    let _ = unsafe { MIGRATION_SPANS.remove(&key) };
    0
}

// =============================================================================
// PROCESS LIFECYCLE
// =============================================================================

#[tracepoint(category = "syscalls", name = "sys_enter_execve")]
pub fn process_exec(_ctx: TracePointContext) -> u32 {
    let Some(scope) = current_scope() else {
        return 0;
    };
    if unsafe { PROCESS_SCOPES.get(&scope) }.is_none() {
        return 0;
    }

    let pid = tgid_of(bpf_get_current_pid_tgid());
    let span = ProcessSpan {
        start_timestamp: unsafe { bpf_ktime_get_ns() },
        pid,
        scope_id: scope,
    };
    // A leftover span from an unclean exit blocks this one.
    let _ = unsafe { PROCESS_SPANS.insert(&pid, &span, BPF_NOEXIST as u64) };
    0
}

#[kprobe(function = "do_exit")]
pub fn process_exit(_ctx: ProbeContext) -> u32 {
    let pid = tgid_of(bpf_get_current_pid_tgid());
    let span = match unsafe { PROCESS_SPANS.get(&pid) } {
        Some(span) => *span,
        None => return 0,
    };
    let end_timestamp = unsafe { bpf_ktime_get_ns() };

    // The event is too large for the stack; fill the ring slot in place.
    if let Some(mut slot) = unsafe { PROCESS_EVENTS.reserve::<LifecycleEvent>(0) } {
        let event = slot.as_mut_ptr();
        unsafe {
            (*event).pid = span.pid;
            (*event).scope_id = span.scope_id;
            (*event).start_timestamp = span.start_timestamp;
            (*event).end_timestamp = end_timestamp;
            (*event).latency = end_timestamp.saturating_sub(span.start_timestamp);
            match HW_STATS.get(&span.scope_id) {
                Some(stats) if merge_counters() => (*event).hw_stats = *stats,
                _ => (*event).hw_stats = PerfStats::default(),
            }
        }
        slot.submit(0);
    }

    let _ = unsafe { PROCESS_SPANS.remove(&pid) };
    0
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
