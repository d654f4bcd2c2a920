//! Deterministic in-memory host for tests and dry runs.
//!
//! All views created from one [`SimHost`] share a clock and a task registry;
//! each view has its own current task and CPU, standing in for one
//! execution unit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use scopeprobe_common::ScopeId;

use crate::host::{Host, TaskRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimTask {
    /// Thread id.
    pub pid: u32,
    /// Process id.
    pub tgid: u32,
    pub cpu: u32,
    /// `None` models a broken task -> group link.
    pub scope: Option<ScopeId>,
}

impl SimTask {
    /// Single-threaded process whose thread id equals its process id.
    pub fn process(pid: u32, scope: Option<ScopeId>) -> Self {
        Self {
            pid,
            tgid: pid,
            cpu: 0,
            scope,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimHost {
    clock: Arc<AtomicU64>,
    tasks: Arc<RwLock<HashMap<TaskRef, SimTask>>>,
    current: TaskRef,
    cpu: u32,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(0)),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            current: TaskRef(0),
            cpu: 0,
        }
    }

    /// Register a task; its handle is its thread id.
    pub fn spawn(&self, task: SimTask) -> TaskRef {
        let handle = TaskRef(u64::from(task.pid));
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, task);
        handle
    }

    pub fn exit(&self, task: TaskRef) -> Option<SimTask> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task)
    }

    pub fn task(&self, task: TaskRef) -> Option<SimTask> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task)
            .copied()
    }

    pub fn update(&self, task: TaskRef, f: impl FnOnce(&mut SimTask)) {
        if let Some(entry) = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&task)
        {
            f(entry);
        }
    }

    /// A view of the same world executing `task` on `cpu`.
    pub fn running(&self, task: TaskRef, cpu: u32) -> Self {
        self.update(task, |t| t.cpu = cpu);
        Self {
            clock: Arc::clone(&self.clock),
            tasks: Arc::clone(&self.tasks),
            current: task,
            cpu,
        }
    }

    pub fn set_time(&self, ns: u64) {
        self.clock.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: u64) -> u64 {
        self.clock.fetch_add(ns, Ordering::SeqCst) + ns
    }
}

impl Host for SimHost {
    fn now_ns(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn current_pid_tgid(&self) -> u64 {
        match self.task(self.current) {
            Some(task) => (u64::from(task.tgid) << 32) | u64::from(task.pid),
            None => self.current.0,
        }
    }

    fn current_cpu(&self) -> u32 {
        self.cpu
    }

    fn current_task(&self) -> TaskRef {
        self.current
    }

    fn task_pid(&self, task: TaskRef) -> Option<u32> {
        self.task(task).map(|t| t.pid)
    }

    fn task_cpu(&self, task: TaskRef) -> Option<u32> {
        self.task(task).map(|t| t.cpu)
    }

    fn resolve_scope(&self, task: TaskRef) -> Option<ScopeId> {
        self.task(task).and_then(|t| t.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_share_clock_and_tasks() {
        let host = SimHost::new();
        let task = host.spawn(SimTask {
            pid: 101,
            tgid: 100,
            cpu: 0,
            scope: Some(7),
        });
        let cpu3 = host.running(task, 3);

        host.set_time(1_000);
        assert_eq!(cpu3.now_ns(), 1_000);
        assert_eq!(cpu3.advance(500), 1_500);
        assert_eq!(host.now_ns(), 1_500);

        assert_eq!(cpu3.current_pid_tgid(), (100u64 << 32) | 101);
        assert_eq!(cpu3.current_tgid(), 100);
        assert_eq!(cpu3.current_cpu(), 3);
        assert_eq!(host.task_cpu(task), Some(3));
        assert_eq!(cpu3.current_scope(), Some(7));
    }

    #[test]
    fn broken_links_do_not_resolve() {
        let host = SimHost::new();
        let orphan = host.spawn(SimTask::process(5, None));
        assert_eq!(host.resolve_scope(orphan), None);

        host.update(orphan, |t| t.scope = Some(9));
        assert_eq!(host.resolve_scope(orphan), Some(9));

        host.exit(orphan);
        assert_eq!(host.resolve_scope(orphan), None);
        assert_eq!(host.task_pid(orphan), None);
    }
}
