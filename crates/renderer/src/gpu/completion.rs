use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct CompletionState {
    done: Mutex<bool>,
    changed: Condvar,
}

/// Resolves when the device has finished every use of the work it was
/// handed out for. Cloning shares the same underlying signal.
#[derive(Debug, Clone)]
pub struct CompletionToken {
    state: Arc<CompletionState>,
}

/// Producer half of a [`CompletionToken`], held by whoever observes the
/// device finishing the work.
#[derive(Debug)]
pub struct CompletionSignal {
    state: Arc<CompletionState>,
}

pub fn completion_pair() -> (CompletionSignal, CompletionToken) {
    let state = Arc::new(CompletionState::default());
    (
        CompletionSignal {
            state: state.clone(),
        },
        CompletionToken { state },
    )
}

impl CompletionToken {
    /// A token for work that finished synchronously.
    pub fn completed() -> Self {
        let (signal, token) = completion_pair();
        signal.complete();
        token
    }

    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }

    /// Blocks until completion or `timeout`; returns whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.done.lock();
        while !*done {
            if self.state.changed.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

impl CompletionSignal {
    pub fn complete(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.changed.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }
}
