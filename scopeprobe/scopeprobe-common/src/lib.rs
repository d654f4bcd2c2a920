#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

use core::mem::offset_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// CAPACITIES - Fixed at creation by the loader
// =============================================================================

/// In-flight function calls, keyed by pid_tgid.
pub const FUNCTION_SPAN_CAPACITY: u32 = 10_240;

/// Migration allow-list entries and in-flight migrations.
pub const MIGRATION_ALLOW_CAPACITY: u32 = 10_240;
pub const MIGRATION_SPAN_CAPACITY: u32 = 10_240;

/// Hardware, cache and lifecycle tables are deliberately tiny: one workload
/// is monitored at a time.
pub const COUNTER_TABLE_CAPACITY: u32 = 16;
pub const CACHE_ALLOW_CAPACITY: u32 = 16;
pub const CACHE_TABLE_CAPACITY: u32 = 16;
pub const LIFECYCLE_ALLOW_CAPACITY: u32 = 16;
pub const LIFECYCLE_SPAN_CAPACITY: u32 = 16;

/// Channel sizes in bytes.
pub const FUNCTION_CHANNEL_BYTES: u32 = 1024 * 1024;
pub const MIGRATION_CHANNEL_BYTES: u32 = 1024 * 1024;
pub const LIFECYCLE_CHANNEL_BYTES: u32 = 256 * 1024;

/// Per-record header a BPF ring buffer charges against its byte size.
pub const RINGBUF_HEADER_BYTES: usize = 8;

/// Stable, process-independent name of the hardware-stats table shared by
/// the counter aggregator and the lifecycle tracer.
pub const HW_STATS_PIN_NAME: &str = "proc_stats_map";

/// Opaque identifier of a monitored workload (the low 32 bits of the cgroup
/// id). Used purely as a filter and aggregation key.
pub type ScopeId = u32;

// =============================================================================
// KEY PACKING
// =============================================================================

/// Migration spans are keyed by scope id (high half) and pid (low half) so
/// that the same pid in two scopes never collides.
#[inline(always)]
pub const fn migration_key(scope_id: ScopeId, pid: u32) -> u64 {
    ((scope_id as u64) << 32) | pid as u64
}

/// Cache accumulators are keyed by pid (high half) and cpu (low half).
#[inline(always)]
pub const fn cache_key(pid: u32, cpu: u32) -> u64 {
    ((pid as u64) << 32) | cpu as u64
}

/// Process id (tgid) half of a `bpf_get_current_pid_tgid` value.
#[inline(always)]
pub const fn tgid_of(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}

// =============================================================================
// RECORDS
// =============================================================================

/// Emitted once per completed function call.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionEvent {
    pub pid: u32,
    pub _pad: u32,
    pub duration_ns: u64,
}

/// Both the pending span of a migrating task and the record emitted when
/// the task resumes on its new CPU.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct MigrationEvent {
    pub timestamp_start: u64,
    pub timestamp_end: u64,
    pub latency: u64,
    pub pid: u32,
    pub source_cpu: u32,
    pub target_cpu: u32,
    pub scope_id: u32,
}

/// Pending span of a process between exec and exit.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessSpan {
    pub start_timestamp: u64,
    pub pid: u32,
    pub scope_id: u32,
}

/// Per-scope hardware counter accumulator. Every field is owned by exactly
/// one [`CounterKind`] and only ever grows.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PerfStats {
    pub cycles: u64,
    pub instructions: u64,
    pub ref_cycles: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub branches: u64,
    pub branch_misses: u64,
    pub l1d_loads: u64,
    pub l1d_load_misses: u64,
    pub l1d_stores: u64,
    pub l1d_store_misses: u64,
    pub l1d_prefetches: u64,
    pub l1d_prefetch_misses: u64,
    pub l1i_loads: u64,
    pub l1i_load_misses: u64,
    pub l1i_prefetches: u64,
    pub llc_loads: u64,
    pub llc_load_misses: u64,
    pub llc_stores: u64,
    pub llc_store_misses: u64,
    pub llc_prefetches: u64,
    pub llc_prefetch_misses: u64,
    pub dtlb_loads: u64,
    pub dtlb_load_misses: u64,
    pub dtlb_stores: u64,
    pub dtlb_store_misses: u64,
    pub dtlb_prefetches: u64,
    pub dtlb_prefetch_misses: u64,
    pub tlb_loads: u64,
    pub tlb_load_misses: u64,
    pub bpu_loads: u64,
    pub bpu_load_misses: u64,
}

/// Emitted when a monitored process exits. `hw_stats` is a best-effort copy
/// of the scope's [`PerfStats`] at exit time (zeroed when unavailable).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct LifecycleEvent {
    pub pid: u32,
    pub scope_id: u32,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub latency: u64,
    pub hw_stats: PerfStats,
}

/// Per-(pid, cpu) last-level cache access classification.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub pid: u32,
    pub cpu: u32,
    pub scope_id: u32,
    pub _pad: u32,

    pub read_references: u64,
    pub read_misses: u64,
    pub read_hits: u64,

    pub write_references: u64,
    pub write_misses: u64,
    pub write_hits: u64,

    pub prefetch_references: u64,
    pub prefetch_misses: u64,
    pub prefetch_hits: u64,

    pub total_references: u64,
    pub total_misses: u64,
    pub total_hits: u64,
}

impl CacheStats {
    pub const fn new(pid: u32, cpu: u32, scope_id: ScopeId) -> Self {
        Self {
            pid,
            cpu,
            scope_id,
            _pad: 0,
            read_references: 0,
            read_misses: 0,
            read_hits: 0,
            write_references: 0,
            write_misses: 0,
            write_hits: 0,
            prefetch_references: 0,
            prefetch_misses: 0,
            prefetch_hits: 0,
            total_references: 0,
            total_misses: 0,
            total_hits: 0,
        }
    }
}

// =============================================================================
// SCOPE RESOLUTION OFFSETS (discovered via BTF by the loader)
// =============================================================================
//
// task_struct -> cgroups (css_set *) -> dfl_cgrp (cgroup *) -> kn (kernfs_node *) -> id
//
// The kernel program walks this chain with bpf_probe_read_kernel. A zero
// offset in the pointer chain means "not configured" and resolution fails.

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ScopeOffsets {
    pub task_pid: u32,
    pub task_tgid: u32,
    /// Offset of `thread_info.cpu` from the start of task_struct.
    pub task_cpu: u32,
    pub task_cgroups: u32,
    pub css_set_dfl_cgrp: u32,
    pub cgroup_kn: u32,
    pub kernfs_node_id: u32,
    pub _pad: u32,
}

impl ScopeOffsets {
    pub const fn zeroed() -> Self {
        Self {
            task_pid: 0,
            task_tgid: 0,
            task_cpu: 0,
            task_cgroups: 0,
            css_set_dfl_cgrp: 0,
            cgroup_kn: 0,
            kernfs_node_id: 0,
            _pad: 0,
        }
    }

    /// `kernfs_node.id` may legitimately sit at offset 0; the pointer hops
    /// may not.
    pub const fn chain_configured(&self) -> bool {
        self.task_cgroups != 0 && self.css_set_dfl_cgrp != 0 && self.cgroup_kn != 0
    }
}

// =============================================================================
// COUNTER DISPATCH TABLE
// =============================================================================

macro_rules! counter_kinds {
    ($($variant:ident => $field:ident),* $(,)?) => {
        /// One hardware counter kind per [`PerfStats`] field.
        #[repr(u32)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
        pub enum CounterKind {
            $($variant,)*
        }

        impl CounterKind {
            pub const ALL: [CounterKind; PERF_STATS_FIELDS] = [$(CounterKind::$variant,)*];

            /// Byte offset of the field this kind owns inside [`PerfStats`].
            pub const fn field_offset(self) -> usize {
                match self {
                    $(CounterKind::$variant => offset_of!(PerfStats, $field),)*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(CounterKind::$variant => stringify!($field),)*
                }
            }
        }
    };
}

pub const PERF_STATS_FIELDS: usize = core::mem::size_of::<PerfStats>() / 8;

counter_kinds! {
    Cycles => cycles,
    Instructions => instructions,
    RefCycles => ref_cycles,
    CacheReferences => cache_references,
    CacheMisses => cache_misses,
    Branches => branches,
    BranchMisses => branch_misses,
    L1dLoads => l1d_loads,
    L1dLoadMisses => l1d_load_misses,
    L1dStores => l1d_stores,
    L1dStoreMisses => l1d_store_misses,
    L1dPrefetches => l1d_prefetches,
    L1dPrefetchMisses => l1d_prefetch_misses,
    L1iLoads => l1i_loads,
    L1iLoadMisses => l1i_load_misses,
    L1iPrefetches => l1i_prefetches,
    LlcLoads => llc_loads,
    LlcLoadMisses => llc_load_misses,
    LlcStores => llc_stores,
    LlcStoreMisses => llc_store_misses,
    LlcPrefetches => llc_prefetches,
    LlcPrefetchMisses => llc_prefetch_misses,
    DtlbLoads => dtlb_loads,
    DtlbLoadMisses => dtlb_load_misses,
    DtlbStores => dtlb_stores,
    DtlbStoreMisses => dtlb_store_misses,
    DtlbPrefetches => dtlb_prefetches,
    DtlbPrefetchMisses => dtlb_prefetch_misses,
    TlbLoads => tlb_loads,
    TlbLoadMisses => tlb_load_misses,
    BpuLoads => bpu_loads,
    BpuLoadMisses => bpu_load_misses,
}

// =============================================================================
// CACHE ACCESS CLASSIFICATION
// =============================================================================

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum CacheOp {
    Read = 0,
    Write = 1,
    Prefetch = 2,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum CacheOutcome {
    Hit = 0,
    Miss = 1,
}

/// One of the six cache event kinds (op x outcome).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheAccess {
    pub op: CacheOp,
    pub outcome: CacheOutcome,
}

impl CacheAccess {
    pub const ALL: [CacheAccess; 6] = [
        CacheAccess::new(CacheOp::Read, CacheOutcome::Hit),
        CacheAccess::new(CacheOp::Read, CacheOutcome::Miss),
        CacheAccess::new(CacheOp::Write, CacheOutcome::Hit),
        CacheAccess::new(CacheOp::Write, CacheOutcome::Miss),
        CacheAccess::new(CacheOp::Prefetch, CacheOutcome::Hit),
        CacheAccess::new(CacheOp::Prefetch, CacheOutcome::Miss),
    ];

    pub const fn new(op: CacheOp, outcome: CacheOutcome) -> Self {
        Self { op, outcome }
    }

    pub const fn references_offset(self) -> usize {
        match self.op {
            CacheOp::Read => offset_of!(CacheStats, read_references),
            CacheOp::Write => offset_of!(CacheStats, write_references),
            CacheOp::Prefetch => offset_of!(CacheStats, prefetch_references),
        }
    }

    pub const fn outcome_offset(self) -> usize {
        match (self.op, self.outcome) {
            (CacheOp::Read, CacheOutcome::Hit) => offset_of!(CacheStats, read_hits),
            (CacheOp::Read, CacheOutcome::Miss) => offset_of!(CacheStats, read_misses),
            (CacheOp::Write, CacheOutcome::Hit) => offset_of!(CacheStats, write_hits),
            (CacheOp::Write, CacheOutcome::Miss) => offset_of!(CacheStats, write_misses),
            (CacheOp::Prefetch, CacheOutcome::Hit) => offset_of!(CacheStats, prefetch_hits),
            (CacheOp::Prefetch, CacheOutcome::Miss) => offset_of!(CacheStats, prefetch_misses),
        }
    }

    pub const fn total_offset(self) -> usize {
        match self.outcome {
            CacheOutcome::Hit => offset_of!(CacheStats, total_hits),
            CacheOutcome::Miss => offset_of!(CacheStats, total_misses),
        }
    }

    pub const TOTAL_REFERENCES_OFFSET: usize = offset_of!(CacheStats, total_references);
}
