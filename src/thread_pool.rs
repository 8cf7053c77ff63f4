//! Bounded worker pool for blocking HTTP I/O, kept deliberately separate
//! from the cooperative event loop (`event_loop.rs`) where user
//! continuations run.
//!
//! Jobs submitted here are plain blocking closures, not `Future`s — a job
//! calls `futures::executor::block_on` internally to drive `HttpCapability`
//! (see `request.rs`). `ReqwestHttp` relies on a live Tokio reactor/timer
//! (`tokio::time::sleep`, `reqwest`'s own I/O), so the pool keeps a small
//! multi-threaded Tokio [`Runtime`] running purely as that reactor/timer
//! backend and `enter()`s it on every worker thread; the runtime's own
//! worker threads drive it independently of whatever a job blocks on.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::runtime::{Builder, Runtime};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of OS threads accepting `FnOnce` work items.
///
/// Dropping the pool joins every worker after the job channel closes, so
/// queued-but-unstarted work still runs before teardown completes.
pub struct ThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    // Kept alive only to back the reactor/timer `enter()`d by each worker;
    // no job is ever spawned onto this runtime directly.
    _io_runtime: Runtime,
}

impl ThreadPool {
    /// Spawns `thread_count` workers sharing one job queue.
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0, "thread pool needs at least one worker");
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(thread_count.max(1))
            .thread_name("cloudaccess-io")
            .enable_all()
            .build()
            .expect("failed to start the tokio reactor backing the thread pool");
        let handle = io_runtime.handle().clone();

        let workers = (0..thread_count)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let handle = handle.clone();
                std::thread::Builder::new()
                    .name(format!("cloudaccess-worker-{id}"))
                    .spawn(move || {
                        let _guard = handle.enter();
                        loop {
                            let job = {
                                let receiver = receiver.lock().unwrap();
                                receiver.recv()
                            };
                            match job {
                                Ok(job) => job(),
                                Err(_) => break,
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        ThreadPool {
            sender: Some(sender),
            workers,
            _io_runtime: io_runtime,
        }
    }

    /// Submits a job to the pool. Panics if called after the pool has begun
    /// shutting down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.sender
            .as_ref()
            .expect("pool is not shutting down")
            .send(Box::new(job))
            .expect("at least one worker is alive while sender is held");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
