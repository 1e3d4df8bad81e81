//! Background task executor
//!
//! A single dedicated worker serializes garbage collection and timestamp
//! resets off the request path. Actions are deduplicated on append: queueing
//! a GC while one is already pending is a no-op.

use crate::manager::Manager;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Work items the background worker understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Terminate the worker
    Shutdown,
    /// Rewrite every access time in the cache to a common base
    ResetTimestamps,
    /// Run a garbage collection pass
    Gc,
}

#[derive(Debug, Default)]
struct State {
    actions: VecDeque<Action>,
    busy: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    have_work: Condvar,
    all_work_done: Condvar,
}

/// Single-worker executor for deferred cache maintenance
#[derive(Debug, Default)]
pub struct BackgroundTask {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn the worker thread
    ///
    /// Must be called exactly once before actions are expected to execute;
    /// actions appended earlier are picked up when the worker starts.
    pub(crate) fn start(&self, manager: Arc<Manager>) {
        let mut worker = self.worker.lock().expect("background worker poisoned");
        if worker.is_some() {
            error!("BUG: background worker started twice");
            return;
        }

        let shared = Arc::clone(&self.shared);
        *worker = Some(std::thread::spawn(move || worker_main(&shared, &manager)));
    }

    /// Append an action unless the same action is already pending
    ///
    /// Returns true if the action was appended.
    pub(crate) fn append_action(&self, action: Action) -> bool {
        let mut state = self.shared.state.lock().expect("background state poisoned");

        if state.actions.contains(&action) {
            debug!("background action {action:?} already pending");
            return false;
        }

        state.actions.push_back(action);
        drop(state);
        self.shared.have_work.notify_one();

        true
    }

    /// Block until the deque is empty and no action is executing
    pub fn sync(&self) {
        let state = self.shared.state.lock().expect("background state poisoned");
        drop(
            self.shared
                .all_work_done
                .wait_while(state, |s| !s.actions.is_empty() || s.busy)
                .expect("background state poisoned"),
        );
    }

    /// Stop the worker and join it
    ///
    /// A high-priority shutdown discards all pending work; otherwise the
    /// worker drains the deque first.
    pub(crate) fn shutdown(&self, high_priority: bool) {
        let Some(handle) = self.worker.lock().expect("background worker poisoned").take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock().expect("background state poisoned");
            if high_priority {
                state.actions.clear();
                state.actions.push_front(Action::Shutdown);
            } else if !state.actions.contains(&Action::Shutdown) {
                state.actions.push_back(Action::Shutdown);
            }
        }
        self.shared.have_work.notify_one();

        if handle.join().is_err() {
            error!("BUG: background worker panicked");
        }
    }
}

fn worker_main(shared: &Shared, manager: &Manager) {
    loop {
        let mut state = shared.state.lock().expect("background state poisoned");

        if state.actions.is_empty() {
            state.busy = false;
            shared.all_work_done.notify_all();
            state = shared
                .have_work
                .wait_while(state, |s| s.actions.is_empty())
                .expect("background state poisoned");
        }

        let action = state.actions.pop_front().expect("non-empty deque");
        state.busy = true;
        drop(state);

        match action {
            Action::Shutdown => {
                let mut state = shared.state.lock().expect("background state poisoned");
                state.busy = false;
                drop(state);
                shared.all_work_done.notify_all();
                return;
            }
            Action::ResetTimestamps => {
                debug!("background: resetting all timestamps");
                manager.do_reset_all_timestamps();
            }
            Action::Gc => {
                let outcome = manager.do_gc();
                info!("background: gc finished: {outcome:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_action_deduplicates() {
        let task = BackgroundTask::new();
        assert!(task.append_action(Action::Gc));
        assert!(!task.append_action(Action::Gc));
        assert!(task.append_action(Action::ResetTimestamps));

        let state = task.shared.state.lock().unwrap();
        assert_eq!(
            state.actions.iter().copied().collect::<Vec<_>>(),
            [Action::Gc, Action::ResetTimestamps]
        );
    }

    #[test]
    fn test_high_priority_shutdown_clears_deque() {
        let task = BackgroundTask::new();
        task.append_action(Action::Gc);
        task.append_action(Action::ResetTimestamps);

        // no worker was started; only the deque manipulation is observable
        {
            let mut state = task.shared.state.lock().unwrap();
            state.actions.clear();
            state.actions.push_front(Action::Shutdown);
        }

        let state = task.shared.state.lock().unwrap();
        assert_eq!(
            state.actions.iter().copied().collect::<Vec<_>>(),
            [Action::Shutdown]
        );
    }

    #[test]
    fn test_sync_returns_when_idle() {
        let task = BackgroundTask::new();
        // nothing pending, no worker: sync must not block
        task.sync();
    }
}
