//! Debounced save timer
//!
//! One armed timer per store: every mutation re-arms it, and the save
//! callback fires only after a full quiet period. The worker thread is
//! parked on a condvar between deadlines and exits when the debouncer is
//! dropped, so a pending timer can never outlive its store.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::error;

struct DebounceState {
    deadline: Option<Instant>,
    shutdown: bool,
}

struct DebounceInner {
    state: Mutex<DebounceState>,
    timer_changed: Condvar,
    delay: Duration,
}

/// Re-armable single-deadline timer driving debounced snapshot saves.
pub struct SaveDebouncer {
    inner: Arc<DebounceInner>,
    handle: Option<JoinHandle<()>>,
}

impl SaveDebouncer {
    /// Spawn the timer thread.
    ///
    /// `on_fire` runs on the timer thread after each quiet period. It
    /// should hold only a weak reference to the store; the debouncer is
    /// dropped (and the thread joined) before the store's data goes away.
    pub fn spawn(
        name: impl Into<String>,
        delay: Duration,
        on_fire: impl Fn() + Send + 'static,
    ) -> Self {
        let inner = Arc::new(DebounceInner {
            state: Mutex::new(DebounceState {
                deadline: None,
                shutdown: false,
            }),
            timer_changed: Condvar::new(),
            delay,
        });

        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || timer_loop(&thread_inner, on_fire))
            .expect("failed to spawn debounce timer thread");

        SaveDebouncer {
            inner,
            handle: Some(handle),
        }
    }

    /// (Re)arm the timer: the callback fires `delay` from now unless
    /// re-armed again first.
    pub fn arm(&self) {
        let mut state = self.inner.state.lock();
        state.deadline = Some(Instant::now() + self.inner.delay);
        self.inner.timer_changed.notify_one();
    }

    /// Cancel a pending deadline without firing.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.deadline = None;
        self.inner.timer_changed.notify_one();
    }

    /// Whether a deadline is currently pending.
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }
}

impl Drop for SaveDebouncer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.deadline = None;
            self.inner.timer_changed.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            // The owning store can be dropped from the timer thread
            // itself (the callback held the last strong reference); the
            // loop exits on the shutdown flag, and a self-join would
            // never return.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("debounce timer thread panicked");
            }
        }
    }
}

fn timer_loop(inner: &DebounceInner, on_fire: impl Fn()) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                inner.timer_changed.wait(&mut state);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    inner.timer_changed.wait_until(&mut state, deadline);
                    // Re-check: the deadline may have moved or been
                    // cancelled while we slept.
                    continue;
                }
                state.deadline = None;
                drop(state);
                on_fire();
                state = inner.state.lock();
            }
        }
    }
}
