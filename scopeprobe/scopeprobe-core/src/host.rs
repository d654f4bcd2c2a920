//! The execution environment hooks observe.
//!
//! In the kernel these are BPF helpers and a read of `task_struct` fields; on
//! the host they are whatever the [`Host`] implementation says. Every
//! subsystem handler takes its host as a parameter so one set of tables can
//! be driven from several simulated CPUs at once.

use scopeprobe_common::{tgid_of, ScopeId};

/// Opaque handle to a schedulable task (a thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef(pub u64);

pub trait Host {
    /// Monotonic clock, nanoseconds.
    fn now_ns(&self) -> u64;

    /// Process id in the high half, thread id in the low half.
    fn current_pid_tgid(&self) -> u64;

    fn current_cpu(&self) -> u32;

    fn current_task(&self) -> TaskRef;

    /// Thread id of `task`, if it can still be read.
    fn task_pid(&self, task: TaskRef) -> Option<u32>;

    /// CPU `task` last ran on.
    fn task_cpu(&self, task: TaskRef) -> Option<u32>;

    /// Walk task -> group membership -> group identifier. Any missing link
    /// yields `None`; there is no default scope.
    fn resolve_scope(&self, task: TaskRef) -> Option<ScopeId>;

    fn current_scope(&self) -> Option<ScopeId> {
        self.resolve_scope(self.current_task())
    }

    fn current_tgid(&self) -> u32 {
        tgid_of(self.current_pid_tgid())
    }
}

impl<H: Host + ?Sized> Host for &H {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }

    fn current_pid_tgid(&self) -> u64 {
        (**self).current_pid_tgid()
    }

    fn current_cpu(&self) -> u32 {
        (**self).current_cpu()
    }

    fn current_task(&self) -> TaskRef {
        (**self).current_task()
    }

    fn task_pid(&self, task: TaskRef) -> Option<u32> {
        (**self).task_pid(task)
    }

    fn task_cpu(&self, task: TaskRef) -> Option<u32> {
        (**self).task_cpu(task)
    }

    fn resolve_scope(&self, task: TaskRef) -> Option<ScopeId> {
        (**self).resolve_scope(task)
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxHost;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};

    use log::trace;
    use nix::time::{clock_gettime, ClockId};
    use nix::unistd::{getpid, gettid};
    use procfs::process::Process;
    use scopeprobe_common::ScopeId;

    use super::{Host, TaskRef};
    use crate::config::HostConfig;

    /// Host backed by the calling process: tasks are Linux thread ids and a
    /// scope is the cgroup v2 directory a thread belongs to.
    #[derive(Debug, Clone)]
    pub struct LinuxHost {
        cgroup_root: PathBuf,
    }

    impl LinuxHost {
        pub fn new(config: &HostConfig) -> Self {
            Self {
                cgroup_root: config.cgroup_root.clone(),
            }
        }

        pub fn cgroup_root(&self) -> &Path {
            &self.cgroup_root
        }

        /// Scope id of a cgroup directory: its inode (the kernfs node id),
        /// truncated to 32 bits.
        pub fn scope_of_path(&self, cgroup_path: &str) -> Option<ScopeId> {
            let dir = self.cgroup_root.join(cgroup_path.trim_start_matches('/'));
            match std::fs::metadata(&dir) {
                Ok(meta) => Some(meta.ino() as ScopeId),
                Err(err) => {
                    trace!("cgroup {} unreadable: {}", dir.display(), err);
                    None
                }
            }
        }

        fn process(task: TaskRef) -> Option<Process> {
            let tid = i32::try_from(task.0).ok()?;
            Process::new(tid).ok()
        }
    }

    impl Default for LinuxHost {
        fn default() -> Self {
            Self::new(&HostConfig::default())
        }
    }

    impl Host for LinuxHost {
        fn now_ns(&self) -> u64 {
            match clock_gettime(ClockId::CLOCK_MONOTONIC) {
                Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
                Err(_) => 0,
            }
        }

        fn current_pid_tgid(&self) -> u64 {
            let tgid = getpid().as_raw() as u32;
            let tid = gettid().as_raw() as u32;
            (u64::from(tgid) << 32) | u64::from(tid)
        }

        fn current_cpu(&self) -> u32 {
            // SAFETY: sched_getcpu takes no arguments and only reads the vDSO.
            let cpu = unsafe { libc::sched_getcpu() };
            u32::try_from(cpu).unwrap_or(0)
        }

        fn current_task(&self) -> TaskRef {
            TaskRef(gettid().as_raw() as u64)
        }

        fn task_pid(&self, task: TaskRef) -> Option<u32> {
            Self::process(task).map(|proc| proc.pid() as u32)
        }

        fn task_cpu(&self, task: TaskRef) -> Option<u32> {
            let stat = Self::process(task)?.stat().ok()?;
            stat.processor.and_then(|cpu| u32::try_from(cpu).ok())
        }

        fn resolve_scope(&self, task: TaskRef) -> Option<ScopeId> {
            let cgroups = Self::process(task)?.cgroups().ok()?;
            let unified = cgroups.0.into_iter().find(|cg| cg.hierarchy == 0)?;
            self.scope_of_path(&unified.pathname)
        }
    }

}
