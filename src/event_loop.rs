//! Single-threaded cooperative scheduler for user continuations, cleanly
//! separated from the worker thread pool performing blocking I/O.
//!
//! Grounded in the original library's `EventLoop` sample: a condvar-guarded
//! queue woken by `onEventAdded`, drained by `processEvents` on the host's
//! own loop thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// The contract any event loop implementation must satisfy: post a
/// continuation from any thread, and drain posted continuations on the
/// loop's own thread.
pub trait EventLoop: Send + Sync {
    /// Enqueues `continuation` and wakes the loop. Safe to call from any
    /// thread, including the loop thread itself.
    fn post(&self, continuation: Continuation);

    /// Drains all continuations queued as of the call, running each in
    /// FIFO order. Must only be called from the loop's own thread.
    fn process_events(&self);

    /// Blocks until either a continuation is posted or `timeout` elapses.
    fn wait(&self, timeout: Duration);
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Continuation>>,
    condvar: Condvar,
}

/// Default `EventLoop`: an `mpsc`-like queue guarded by a mutex, with a
/// condvar standing in for `onEventAdded`'s wake.
pub struct ThreadEventLoop {
    shared: Shared,
}

impl ThreadEventLoop {
    pub fn new() -> Self {
        ThreadEventLoop {
            shared: Shared::default(),
        }
    }
}

impl Default for ThreadEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for ThreadEventLoop {
    fn post(&self, continuation: Continuation) {
        self.shared.queue.lock().unwrap().push_back(continuation);
        self.shared.condvar.notify_one();
    }

    fn process_events(&self) {
        let pending: Vec<Continuation> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for continuation in pending {
            continuation();
        }
    }

    fn wait(&self, timeout: Duration) {
        let queue = self.shared.queue.lock().unwrap();
        if queue.is_empty() {
            let _ = self.shared.condvar.wait_timeout(queue, timeout).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn process_events_runs_queued_continuations_in_fifo_order() {
        let loop_ = ThreadEventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            loop_.post(Box::new(move || order.lock().unwrap().push(i)));
        }
        loop_.process_events();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn wait_returns_once_a_continuation_is_posted_from_another_thread() {
        let loop_ = Arc::new(ThreadEventLoop::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let poster = {
            let loop_ = Arc::clone(&loop_);
            let ran = Arc::clone(&ran);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let ran = Arc::clone(&ran);
                loop_.post(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            })
        };

        loop_.wait(Duration::from_secs(5));
        loop_.process_events();
        poster.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_events_is_a_no_op_on_an_empty_queue() {
        let loop_ = ThreadEventLoop::new();
        loop_.process_events();
    }
}
