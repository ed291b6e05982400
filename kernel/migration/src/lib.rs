//! Manages task migration on a per-task basis.
//!
//! Disabling migration pins a task to the CPU it is currently running on,
//! without disabling preemption: the pinned task may still be preempted,
//! block, or sleep, but the scheduler will only ever resume it on that same CPU.
//! This lets a task hold a CPU's local state (e.g., a per-CPU slab behind a
//! local lock) across code that is allowed to be preempted.
//!
//! Disabling nests. Each task carries a nesting depth; the task is pinned
//! when the depth goes from `0` to `1` and unpinned when it returns to `0`.
//!
//! The scheduler's processor-selection path must consult [`MigrationControl::can_migrate()`]
//! (or use [`MigrationControl::migrate()`], which enforces it), and the CPU hot-unplug path
//! must call [`MigrationControl::take_offline()`], which waits until every task
//! pinned to that CPU has re-enabled migration.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod task;

pub use task::*;

use alloc::boxed::Box;
use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use cpu::CpuId;
use kernel_config::memory::MAX_CPUS;
use log::{debug, error, info};

/// Receives notifications when a task becomes pinned to or unpinned from a CPU.
///
/// Both methods are invoked after the task's placement has been updated,
/// with no locks held, so an implementation may query the task.
pub trait SchedulerHook: Send + Sync {
    fn migration_pinned(&self, _task: TaskId, _cpu: CpuId) {}
    fn migration_unpinned(&self, _task: TaskId, _cpu: CpuId) {}
}

/// Possible errors from migration control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationError {
    /// Migration was enabled more times than it was disabled.
    Underflow(TaskId),
    /// The task is pinned to the given CPU and cannot be moved.
    Pinned { task: TaskId, cpu: CpuId },
    /// The destination CPU is offline.
    CpuOffline(CpuId),
    /// The CPU is outside the range tracked by this `MigrationControl`.
    InvalidCpu(CpuId),
}

impl From<MigrationError> for &'static str {
    fn from(err: MigrationError) -> &'static str {
        match err {
            MigrationError::Underflow(_)   => "migration was enabled without a matching disable",
            MigrationError::Pinned { .. }  => "task has migration disabled",
            MigrationError::CpuOffline(_)  => "CPU is offline",
            MigrationError::InvalidCpu(_)  => "CPU ID is out of range",
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Underflow(task) => write!(f, "task {}: {}", task, <&'static str>::from(*self)),
            MigrationError::Pinned { task, cpu } => write!(f, "task {} is pinned to CPU {}", task, cpu),
            MigrationError::CpuOffline(cpu) | MigrationError::InvalidCpu(cpu) => {
                write!(f, "CPU {}: {}", cpu, <&'static str>::from(*self))
            }
        }
    }
}

#[derive(Debug)]
struct CpuState {
    online: AtomicBool,
    /// The number of tasks currently pinned to this CPU.
    pinned: AtomicUsize,
}

/// The system-wide migration state: one entry per CPU,
/// created once at startup and owned by whoever owns the scheduler.
pub struct MigrationControl {
    cpus: Box<[CpuState]>,
    hook: Option<Box<dyn SchedulerHook>>,
}

impl MigrationControl {
    /// Creates migration control for `nr_cpus` CPUs, all of them online.
    pub fn new(nr_cpus: usize) -> Result<MigrationControl, &'static str> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err("MigrationControl: number of CPUs must be between 1 and MAX_CPUS");
        }
        let cpus = (0..nr_cpus)
            .map(|_| CpuState {
                online: AtomicBool::new(true),
                pinned: AtomicUsize::new(0),
            })
            .collect();
        Ok(MigrationControl { cpus, hook: None })
    }

    /// Same as [`MigrationControl::new()`], but notifies the given scheduler
    /// hook of every pin and unpin.
    pub fn with_hook(nr_cpus: usize, hook: Box<dyn SchedulerHook>) -> Result<MigrationControl, &'static str> {
        let mut control = Self::new(nr_cpus)?;
        control.hook = Some(hook);
        Ok(control)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    fn cpu_state(&self, cpu: CpuId) -> Result<&CpuState, MigrationError> {
        self.cpus.get(cpu.index()).ok_or(MigrationError::InvalidCpu(cpu))
    }

    /// Prevents the given task from being migrated off of its current CPU
    /// until the returned guard is dropped.
    ///
    /// The task remains preemptible.
    pub fn disable<'a>(&'a self, task: &'a Task) -> MigrationGuard<'a> {
        let cpu = self.disable_migration(task);
        MigrationGuard {
            control: self,
            task,
            cpu,
            _not_send: PhantomData,
        }
    }

    /// Increments the task's migration-disable depth and returns the CPU
    /// that the task is now pinned to.
    ///
    /// Callers should prefer [`MigrationControl::disable()`]; every call to this
    /// must be balanced by a call to [`MigrationControl::enable_migration()`]
    /// before the calling function returns.
    pub fn disable_migration(&self, task: &Task) -> CpuId {
        let (cpu, newly_pinned) = {
            let mut placement = task.placement.lock();
            let prev = placement.migration_depth;
            placement.migration_depth = match prev.checked_add(1) {
                Some(depth) => depth,
                None => panic!("BUG: Overflow occurred in the migration counter for task {}", task.id()),
            };
            let mut cpu = placement.cpu;
            if prev == 0 {
                cpu = self.pin_online(task, cpu);
                placement.cpu = cpu;
            }
            (cpu, prev == 0)
        };

        if newly_pinned {
            if let Some(hook) = &self.hook {
                hook.migration_pinned(task.id(), cpu);
            }
        }
        cpu
    }

    /// Registers a pin of `task` on `cpu`, or on the first online CPU if `cpu`
    /// has gone offline, and returns the CPU it was pinned to.
    ///
    /// The task's placement must be locked by the caller.
    fn pin_online(&self, task: &Task, mut cpu: CpuId) -> CpuId {
        loop {
            let state = match self.cpus.get(cpu.index()) {
                Some(state) => state,
                None => panic!("BUG: task {} is running on untracked CPU {}", task.id(), cpu),
            };
            // Pin first, then check: a concurrent `take_offline()` either waits
            // for this pin or its offline store is observed here.
            state.pinned.fetch_add(1, Ordering::SeqCst);
            if state.online.load(Ordering::SeqCst) {
                return cpu;
            }
            state.pinned.fetch_sub(1, Ordering::SeqCst);
            let dest = match self.online_cpus().next() {
                Some(dest) => dest,
                None => panic!("BUG: task {} disabled migration but no CPU is online", task.id()),
            };
            debug!("task {} was left on offline CPU {}, moving it to CPU {}", task.id(), cpu, dest);
            cpu = dest;
        }
    }

    /// Decrements the task's migration-disable depth,
    /// unpinning the task if the depth reaches zero.
    ///
    /// Enabling migration without a matching prior disable is a bug:
    /// it panics in debug builds and returns [`MigrationError::Underflow`] otherwise,
    /// leaving the depth at zero.
    pub fn enable_migration(&self, task: &Task) -> Result<(), MigrationError> {
        let cpu = {
            let mut placement = task.placement.lock();
            if placement.migration_depth == 0 {
                drop(placement);
                error!("BUG: migration counter underflow for task {}", task.id());
                if cfg!(debug_assertions) {
                    panic!("BUG: migration counter underflow for task {}", task.id());
                }
                return Err(MigrationError::Underflow(task.id()));
            }
            placement.migration_depth -= 1;
            if placement.migration_depth != 0 {
                return Ok(());
            }
            let cpu = placement.cpu;
            if let Some(state) = self.cpus.get(cpu.index()) {
                state.pinned.fetch_sub(1, Ordering::AcqRel);
            }
            cpu
        };

        if let Some(hook) = &self.hook {
            hook.migration_unpinned(task.id(), cpu);
        }
        Ok(())
    }

    /// Returns `true` if the scheduler may currently move the given task to another CPU.
    ///
    /// This is only a snapshot; use [`MigrationControl::migrate()`] to actually move a task.
    pub fn can_migrate(&self, task: &Task) -> bool {
        !task.is_migration_disabled()
    }

    /// Moves the given task to the `dest` CPU.
    ///
    /// This is the scheduler's relocation path. It fails if the task has
    /// migration disabled, or if `dest` is invalid or offline.
    pub fn migrate(&self, task: &Task, dest: CpuId) -> Result<(), MigrationError> {
        let dest_state = self.cpu_state(dest)?;
        let mut placement = task.placement.lock();
        if placement.migration_depth > 0 {
            return Err(MigrationError::Pinned { task: task.id(), cpu: placement.cpu });
        }
        // Checked under the placement lock. If `dest` goes offline right after this,
        // the task's next `disable_migration()` moves it to an online CPU.
        if !dest_state.online.load(Ordering::SeqCst) {
            return Err(MigrationError::CpuOffline(dest));
        }
        placement.cpu = dest;
        Ok(())
    }

    /// Chooses the CPU that the given task should run on next.
    ///
    /// A pinned task always stays on its current CPU.
    /// Otherwise, `preferred` is chosen if it is valid and online.
    pub fn select_cpu(&self, task: &Task, preferred: CpuId) -> CpuId {
        let placement = task.placement.lock();
        if placement.migration_depth > 0 {
            return placement.cpu;
        }
        match self.cpu_state(preferred) {
            Ok(state) if state.online.load(Ordering::Acquire) => preferred,
            _ => placement.cpu,
        }
    }

    /// Returns `true` if at least one task is currently pinned to the given CPU.
    ///
    /// This is the signal the hot-unplug path waits on.
    pub fn is_pinned_busy(&self, cpu: CpuId) -> bool {
        self.pinned_count(cpu) > 0
    }

    /// Returns the number of tasks currently pinned to the given CPU.
    pub fn pinned_count(&self, cpu: CpuId) -> usize {
        self.cpu_state(cpu)
            .map(|state| state.pinned.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.cpu_state(cpu)
            .map(|state| state.online.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Returns an iterator over all CPUs that are currently online.
    pub fn online_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.cpus.iter()
            .enumerate()
            .filter(|(_, state)| state.online.load(Ordering::Acquire))
            .map(|(i, _)| CpuId::new(i as u32))
    }

    /// Marks the given CPU as offline and waits until no task is pinned to it.
    ///
    /// Once this begins, no task can be migrated onto `cpu`, and a task still
    /// placed on `cpu` is moved to another online CPU when it next disables migration.
    /// This blocks (spins) until every task that was pinned to `cpu`
    /// has re-enabled migration; it must not be called by a task
    /// that itself has migration disabled on `cpu`.
    pub fn take_offline(&self, cpu: CpuId) -> Result<(), MigrationError> {
        let state = self.cpu_state(cpu)?;
        state.online.store(false, Ordering::SeqCst);
        info!("CPU {}: going offline, waiting for {} pinned task(s)", cpu, state.pinned.load(Ordering::Acquire));

        while state.pinned.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
        info!("CPU {}: offline, no pinned tasks remain", cpu);
        Ok(())
    }

    /// Marks the given CPU as online, allowing tasks to be migrated onto it again.
    pub fn bring_online(&self, cpu: CpuId) -> Result<(), MigrationError> {
        let state = self.cpu_state(cpu)?;
        state.online.store(true, Ordering::SeqCst);
        info!("CPU {}: online", cpu);
        Ok(())
    }
}

impl fmt::Debug for MigrationControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationControl")
            .field("cpus", &self.cpus)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}


/// A guard type that ensures migration is disabled for a task as long as it is held.
///
/// Call [`MigrationControl::disable()`] to obtain a `MigrationGuard`.
///
/// The task *may* become migratable again when this guard is dropped,
/// but not necessarily so, because other previous functions
/// in the call stack may have already acquired a `MigrationGuard`.
///
/// This type does not implement `Send` because it is invalid
/// to move it across a "thread" boundary (into a different task).
pub struct MigrationGuard<'a> {
    control: &'a MigrationControl,
    task: &'a Task,
    /// The CPU the task was pinned to when this guard was created.
    cpu: CpuId,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MigrationGuard<'a> {
    /// Returns the CPU that the task is pinned to.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn task(&self) -> &'a Task {
        self.task
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        let cpu = self.task.current_cpu();
        assert!(
            self.cpu == cpu,
            "MigrationGuard::drop(): BUG: CPU IDs did not match! \
            This indicates an unexpected task migration across CPUs."
        );
        // An underflow here has already been reported by `enable_migration()`.
        let _ = self.control.enable_migration(self.task);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn cpu(id: u32) -> CpuId {
        CpuId::new(id)
    }

    #[test]
    fn nesting_restores_depth() {
        let control = MigrationControl::new(2).unwrap();
        let task = Task::new(TaskId::new(1), cpu(1));
        {
            let outer = control.disable(&task);
            assert_eq!(outer.cpu(), cpu(1));
            assert_eq!(task.migration_depth(), 1);
            assert_eq!(control.pinned_count(cpu(1)), 1);
            {
                let _inner = control.disable(&task);
                assert_eq!(task.migration_depth(), 2);
                // Nested disables do not pin the task twice.
                assert_eq!(control.pinned_count(cpu(1)), 1);
            }
            assert_eq!(task.migration_depth(), 1);
        }
        assert_eq!(task.migration_depth(), 0);
        assert_eq!(control.pinned_count(cpu(1)), 0);
        assert!(!control.is_pinned_busy(cpu(1)));
    }

    proptest! {
        /// `true` disables migration, `false` re-enables it if the task is pinned.
        #[test]
        fn nesting_depth_follows_any_disable_enable_sequence(ops in prop::collection::vec(any::<bool>(), 0..512)) {
            let control = MigrationControl::new(1).unwrap();
            let task = Task::new(TaskId::new(2), cpu(0));
            let mut expected: u32 = 0;
            for disable in ops {
                if disable || expected == 0 {
                    control.disable_migration(&task);
                    expected += 1;
                } else {
                    control.enable_migration(&task).unwrap();
                    expected -= 1;
                }
                prop_assert_eq!(task.migration_depth(), expected);
                prop_assert_eq!(control.is_pinned_busy(cpu(0)), expected > 0);
                prop_assert_eq!(control.can_migrate(&task), expected == 0);
            }
            while expected > 0 {
                control.enable_migration(&task).unwrap();
                expected -= 1;
            }
            prop_assert_eq!(task.migration_depth(), 0);
            prop_assert_eq!(control.pinned_count(cpu(0)), 0);
        }
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "underflow"))]
    fn enable_without_disable_underflows() {
        let control = MigrationControl::new(1).unwrap();
        let task = Task::new(TaskId::new(3), cpu(0));
        let result = control.enable_migration(&task);
        assert_eq!(result, Err(MigrationError::Underflow(TaskId::new(3))));
        assert_eq!(task.migration_depth(), 0);
    }

    #[test]
    fn pinned_task_cannot_migrate() {
        let control = MigrationControl::new(4).unwrap();
        let task = Task::new(TaskId::new(4), cpu(0));

        let guard = control.disable(&task);
        assert!(!control.can_migrate(&task));
        assert_eq!(
            control.migrate(&task, cpu(2)),
            Err(MigrationError::Pinned { task: TaskId::new(4), cpu: cpu(0) }),
        );
        assert_eq!(control.select_cpu(&task, cpu(3)), cpu(0));
        drop(guard);

        assert!(control.can_migrate(&task));
        assert_eq!(control.select_cpu(&task, cpu(3)), cpu(3));
        control.migrate(&task, cpu(2)).unwrap();
        assert_eq!(task.current_cpu(), cpu(2));
        assert_eq!(control.migrate(&task, cpu(9)), Err(MigrationError::InvalidCpu(cpu(9))));
    }

    #[test]
    fn offline_cpu_rejects_migration() {
        let control = MigrationControl::new(2).unwrap();
        let task = Task::new(TaskId::new(5), cpu(0));
        control.take_offline(cpu(1)).unwrap();
        assert!(!control.is_online(cpu(1)));
        assert_eq!(control.migrate(&task, cpu(1)), Err(MigrationError::CpuOffline(cpu(1))));
        assert_eq!(control.select_cpu(&task, cpu(1)), cpu(0));
        assert_eq!(control.online_cpus().collect::<Vec<_>>(), vec![cpu(0)]);

        control.bring_online(cpu(1)).unwrap();
        control.migrate(&task, cpu(1)).unwrap();
        assert_eq!(task.current_cpu(), cpu(1));
    }

    #[test]
    fn task_left_on_offline_cpu_is_moved_when_it_pins() {
        let control = MigrationControl::new(3).unwrap();
        let task = Task::new(TaskId::new(6), cpu(0));
        control.migrate(&task, cpu(2)).unwrap();
        control.take_offline(cpu(2)).unwrap();
        // The scheduler has not evacuated the task yet.
        assert_eq!(task.current_cpu(), cpu(2));
        assert_eq!(control.migrate(&task, cpu(2)), Err(MigrationError::CpuOffline(cpu(2))));

        {
            let guard = control.disable(&task);
            assert_eq!(guard.cpu(), cpu(0));
            assert_eq!(task.current_cpu(), cpu(0));
            assert_eq!(control.pinned_count(cpu(0)), 1);
            assert_eq!(control.pinned_count(cpu(2)), 0);
            // Pinned tasks report the migration error before the offline one.
            assert_eq!(
                control.migrate(&task, cpu(2)),
                Err(MigrationError::Pinned { task: TaskId::new(6), cpu: cpu(0) }),
            );
        }
        assert!(!control.is_pinned_busy(cpu(0)));
        assert!(!control.is_online(cpu(2)));
    }

    #[test]
    fn hook_sees_each_pin_transition_once() {
        struct CountingHook {
            pinned: Arc<AtomicUsize>,
            unpinned: Arc<AtomicUsize>,
        }
        impl SchedulerHook for CountingHook {
            fn migration_pinned(&self, _task: TaskId, cpu: CpuId) {
                assert_eq!(cpu, CpuId::new(1));
                self.pinned.fetch_add(1, Ordering::SeqCst);
            }
            fn migration_unpinned(&self, _task: TaskId, _cpu: CpuId) {
                self.unpinned.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pinned = Arc::new(AtomicUsize::new(0));
        let unpinned = Arc::new(AtomicUsize::new(0));
        let control = MigrationControl::with_hook(2, Box::new(CountingHook {
            pinned: pinned.clone(),
            unpinned: unpinned.clone(),
        })).unwrap();
        let task = Task::new(TaskId::new(6), cpu(1));

        for _ in 0..3 {
            let _a = control.disable(&task);
            let _b = control.disable(&task);
        }
        assert_eq!(pinned.load(Ordering::SeqCst), 3);
        assert_eq!(unpinned.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn hot_unplug_waits_for_pinned_task() {
        let control = Arc::new(MigrationControl::new(2).unwrap());
        let task = Task::new(TaskId::new(7), cpu(1));
        let done = Arc::new(AtomicBool::new(false));

        control.disable_migration(&task);

        let unplug = {
            let control = control.clone();
            let done = done.clone();
            thread::spawn(move || {
                control.take_offline(CpuId::new(1)).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "unplug finished while a task was still pinned");
        assert!(control.is_pinned_busy(cpu(1)));

        control.enable_migration(&task).unwrap();
        unplug.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(!control.is_online(cpu(1)));
    }

    #[test]
    fn pinned_task_is_never_moved_by_concurrent_scheduler() {
        const ROUNDS: usize = 20_000;
        let control = Arc::new(MigrationControl::new(4).unwrap());
        let task = Arc::new(Task::new(TaskId::new(8), cpu(0)));
        let stop = Arc::new(AtomicBool::new(false));

        let scheduler = {
            let control = control.clone();
            let task = task.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut moves = 0usize;
                let mut next = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    next = (next + 1) % 4;
                    if control.migrate(&task, CpuId::new(next)).is_ok() {
                        moves += 1;
                    }
                }
                moves
            })
        };

        for _ in 0..ROUNDS {
            let guard = control.disable(&task);
            let pinned_cpu = guard.cpu();
            for _ in 0..4 {
                assert_eq!(task.current_cpu(), pinned_cpu);
                core::hint::spin_loop();
            }
            drop(guard);
        }
        stop.store(true, Ordering::Relaxed);
        scheduler.join().unwrap();
        assert_eq!(task.migration_depth(), 0);
        for id in 0..4 {
            assert_eq!(control.pinned_count(cpu(id)), 0);
        }
    }

    #[test]
    fn atomic_sections_nest() {
        let control = MigrationControl::new(1).unwrap();
        let task = Task::new(TaskId::new(9), cpu(0));
        let _pin = control.disable(&task);
        assert!(!task.in_atomic());
        {
            let outer = task.enter_atomic();
            let _inner = outer.task().enter_atomic();
            assert_eq!(task.atomic_depth(), 2);
        }
        assert!(!task.in_atomic());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without disabling migration")]
    fn atomic_section_requires_pinning() {
        let task = Task::new(TaskId::new(10), cpu(0));
        let _section = task.enter_atomic();
    }
}
