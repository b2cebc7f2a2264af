use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Mutex, MutexGuard,
};

use nix::unistd::Pid;

pub mod buffer;
pub mod child;
pub mod harvest;
pub mod jobs;
pub mod launch;
pub mod monitor;
pub mod redirect;
pub mod status;

/// A process observed through a process-creation debug event while
/// harvesting. Removed again on its exit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebuggedChild {
    pub pid: Pid,
    pub initial_thread: Pid,
}

/// The part of a stage that outlives the driver's borrow of it: worker
/// threads hold a strong reference to this, never to the plan.
#[derive(Debug, Default)]
pub struct StageRuntime {
    capture_environment: AtomicBool,
    process_id: AtomicI32,
    debugged_children: Mutex<Vec<DebuggedChild>>,
    debug_pump_finished: AtomicBool,
    suppress_task_completion: AtomicBool,
    task_completion_displayed: AtomicBool,
}

impl StageRuntime {
    pub fn capture_environment_on_exit(&self) -> bool {
        self.capture_environment.load(Ordering::SeqCst)
    }

    pub fn set_capture_environment_on_exit(&self, capture: bool) {
        self.capture_environment.store(capture, Ordering::SeqCst);
    }

    pub fn process_id(&self) -> Option<i32> {
        match self.process_id.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_process_id(&self, pid: Option<i32>) {
        self.process_id.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn debugged_children(&self) -> MutexGuard<'_, Vec<DebuggedChild>> {
        self.debugged_children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn debug_pump_finished(&self) -> bool {
        self.debug_pump_finished.load(Ordering::SeqCst)
    }

    pub fn mark_debug_pump_finished(&self) {
        self.debug_pump_finished.store(true, Ordering::SeqCst);
    }

    pub fn suppress_task_completion(&self) -> bool {
        self.suppress_task_completion.load(Ordering::SeqCst)
    }

    pub fn set_suppress_task_completion(&self) {
        self.suppress_task_completion.store(true, Ordering::SeqCst);
    }

    /// Marks the indicator as shown; returns whether it already was.
    pub fn display_task_completion(&self) -> bool {
        self.task_completion_displayed.swap(true, Ordering::SeqCst)
    }

    pub fn task_completion_displayed(&self) -> bool {
        self.task_completion_displayed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_tracks_the_debug_pump() {
        let runtime = StageRuntime::default();
        assert!(!runtime.debug_pump_finished());
        assert_eq!(runtime.process_id(), None);

        runtime.set_process_id(Some(42));
        runtime.debugged_children().push(DebuggedChild {
            pid: Pid::from_raw(43),
            initial_thread: Pid::from_raw(43),
        });
        runtime.mark_debug_pump_finished();

        assert!(runtime.debug_pump_finished());
        assert_eq!(runtime.process_id(), Some(42));
        assert_eq!(runtime.debugged_children().len(), 1);
        assert!(!runtime.display_task_completion());
        assert!(runtime.task_completion_displayed());
    }
}
