//! The promise-like `Request<T>` engine: the core abstraction every
//! provider verb returns.
//!
//! A `Request<T>` is produced pending, transitions to running once work is
//! submitted, and terminates exactly once — either `Completed` or
//! `Cancelled` — at which point its final continuation (attached via
//! [`Request::then`]) runs on the event loop. This is deliberately not
//! Rust's native `Future`: it mirrors the original library's
//! continuation-passing promise so `.then()` chains read the same way the
//! reference implementation's samples do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::http::{HttpCapability, HttpRequest, HttpResponse};
use crate::thread_pool::ThreadPool;

type Continuation<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

/// The request's single mutable slot. Exactly one of "a continuation is
/// waiting" or "a result is waiting" can be true at once; `Done` means both
/// have been consumed.
enum Slot<T> {
    /// Neither a continuation nor a result has arrived yet.
    Empty,
    /// A consumer called `.then()` before the work finished.
    WaitingForResult(Continuation<T>),
    /// The work finished before any consumer called `.then()`.
    Buffered(Result<T, Error>),
    /// Terminal: delivered.
    Done,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cancelled: Arc<AtomicBool>,
    fired: AtomicBool,
    event_loop: Arc<dyn EventLoop>,
}

/// A pending computation producing `Result<T, Error>`, delivered to at most
/// one consumer continuation, exactly once.
pub struct Request<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for Request<T> {
    fn clone(&self) -> Self {
        Request {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The producer side of a [`Request`], held by whoever performs the actual
/// work (typically a thread-pool job dispatched by [`RequestContext`]).
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Request<T> {
    /// Creates a fresh pending request and its matching completer, with its
    /// own independent cancellation flag.
    pub fn pending(event_loop: Arc<dyn EventLoop>) -> (Request<T>, Completer<T>) {
        Request::pending_linked(event_loop, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`Request::pending`], but sharing an existing cancellation flag
    /// rather than minting a fresh one — used by [`Request::then`] so a
    /// chained request and the hop it was derived from are, as far as
    /// cancellation is concerned, the same logical operation: cancelling
    /// either end flips the one flag both sides observe.
    fn pending_linked(event_loop: Arc<dyn EventLoop>, cancelled: Arc<AtomicBool>) -> (Request<T>, Completer<T>) {
        let inner = Arc::new(Inner {
            slot: Mutex::new(Slot::Empty),
            cancelled,
            fired: AtomicBool::new(false),
            event_loop,
        });
        let request = Request {
            inner: Arc::clone(&inner),
        };
        let completer = Completer { inner };
        (request, completer)
    }

    /// An already-resolved request, useful for providers whose hook can
    /// answer synchronously (e.g. a cached item lookup).
    pub fn ready(event_loop: Arc<dyn EventLoop>, result: Result<T, Error>) -> Self {
        let (request, completer) = Request::pending(event_loop);
        completer.complete(result);
        request
    }

    /// Registers the consumer continuation, returning a new `Request<U>`
    /// resolving to whatever the continuation produces. Continuations
    /// always run on the event loop, whether the result is already
    /// buffered or arrives later — so callers never observe inline
    /// execution on an arbitrary thread.
    pub fn then<U, F>(self, f: F) -> Request<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, Error>) -> Result<U, Error> + Send + 'static,
    {
        let (next, completer) =
            Request::<U>::pending_linked(Arc::clone(&self.inner.event_loop), Arc::clone(&self.inner.cancelled));
        let continuation: Continuation<T> = Box::new(move |result| {
            // Checked here, immediately before the continuation would run any
            // of its side effects (e.g. a download sink's callbacks) — a
            // cancel that lands between completion and scheduling must still
            // suppress them, not just the final reported value.
            if completer.is_cancelled() {
                completer.complete(Err(Error::Aborted));
            } else {
                completer.complete(f(result));
            }
        });

        let mut slot = self.inner.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Empty => {
                *slot = Slot::WaitingForResult(continuation);
            }
            Slot::Buffered(result) => {
                drop(slot);
                self.inner.event_loop.post(Box::new(move || continuation(result)));
            }
            Slot::WaitingForResult(_) | Slot::Done => {
                unreachable!("at most one continuation is ever attached to a Request")
            }
        }

        next
    }

    /// Like [`Request::then`], but the continuation itself produces a
    /// `Request<U>` rather than an immediate `Result<U, Error>` — used to
    /// chain dependent asynchronous steps (the Box provider's
    /// `getItemData` trying `/files/{id}` then falling back to
    /// `/folders/{id}` is the motivating case).
    pub fn and_then<U, F>(self, f: F) -> Request<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, Error>) -> Request<U> + Send + 'static,
    {
        let (next, completer) = Request::<U>::pending(Arc::clone(&self.inner.event_loop));
        let continuation: Continuation<T> = Box::new(move |result| {
            if completer.is_cancelled() {
                completer.complete(Err(Error::Aborted));
                return;
            }
            let inner = f(result);
            // A cancel arriving between `f(result)` returning and the inner
            // request settling must still reach the freshly created child —
            // otherwise a cancelled `and_then` chain would leave the inner
            // hop running to completion with nothing to stop it.
            if completer.is_cancelled() {
                inner.cancel();
            }
            let _disposed: Request<()> = inner.then(move |inner_result| {
                completer.complete(inner_result);
                Ok(())
            });
        });

        let mut slot = self.inner.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Empty => {
                *slot = Slot::WaitingForResult(continuation);
            }
            Slot::Buffered(result) => {
                drop(slot);
                self.inner.event_loop.post(Box::new(move || continuation(result)));
            }
            Slot::WaitingForResult(_) | Slot::Done => {
                unreachable!("at most one continuation is ever attached to a Request")
            }
        }

        next
    }

    /// Cooperative cancellation. If the request has not yet reached a
    /// terminal state, its continuation fires with `Error::Aborted`
    /// exactly once; if it already completed, this is a no-op.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> Completer<T> {
    /// Delivers the terminal result. Idempotent: only the first call has
    /// any effect, satisfying the "exactly one terminal transition" rule
    /// even under a cancel/complete race.
    pub fn complete(self, result: Result<T, Error>) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = if self.inner.cancelled.load(Ordering::SeqCst) {
            Err(Error::Aborted)
        } else {
            result
        };

        let mut slot = self.inner.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Empty => {
                *slot = Slot::Buffered(result);
            }
            Slot::WaitingForResult(continuation) => {
                drop(slot);
                self.inner.event_loop.post(Box::new(move || continuation(result)));
            }
            Slot::Buffered(_) | Slot::Done => {
                unreachable!("Completer::complete guarded by fired flag")
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The flag backing this completer's request, shareable with whatever
    /// performs the underlying work so it can poll for cancellation mid-flight
    /// (e.g. an in-flight HTTP hop checking it between read chunks).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.cancelled)
    }
}

/// Shared capabilities every provider needs to build and dispatch
/// `Request<T>` instances: the HTTP transport, the worker pool executing
/// it, and the event loop scheduling continuations.
#[derive(Clone)]
pub struct RequestContext {
    pub http: Arc<dyn HttpCapability>,
    pub thread_pool: Arc<ThreadPool>,
    pub event_loop: Arc<dyn EventLoop>,
}

/// Retry/backoff tuning for 5xx responses, mirrored from the teacher's
/// `http_retry` module.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.10..0.30);
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

impl RequestContext {
    /// Issues one HTTP exchange: `build` runs on the thread pool (mirroring
    /// the original `factory(outputStream) -> HttpRequest` step), its
    /// result is handed back on the event loop.
    pub fn send_request<F>(&self, build: F) -> Request<HttpResponse>
    where
        F: FnOnce() -> HttpRequest + Send + 'static,
    {
        let (request, completer) = Request::pending(Arc::clone(&self.event_loop));
        let http = Arc::clone(&self.http);
        let cancel_flag = completer.cancel_flag();
        self.thread_pool.submit(move || {
            if completer.is_cancelled() {
                completer.complete(Err(Error::Aborted));
                return;
            }
            let http_request = build();
            let result = futures::executor::block_on(http.execute(http_request, cancel_flag));
            completer.complete(result);
        });
        request
    }

    /// Same as [`RequestContext::send_request`] but retries with exponential
    /// backoff on a retryable HTTP status (honoring `Retry-After` when
    /// present) or a recoverable transport error (`Error::is_recoverable`).
    /// Non-retryable statuses and unrecoverable errors surface immediately.
    /// This is what `ProviderContext::send_authorized` uses for both the
    /// initial attempt and the post-reauthorization replay.
    pub fn send_request_with_retry<F>(&self, build: F, retry: RetryConfig) -> Request<HttpResponse>
    where
        F: Fn() -> HttpRequest + Send + Sync + 'static,
    {
        let (request, completer) = Request::pending(Arc::clone(&self.event_loop));
        let http = Arc::clone(&self.http);
        let cancel_flag = completer.cancel_flag();
        self.thread_pool.submit(move || {
            let mut attempt = 0u32;
            loop {
                if completer.is_cancelled() {
                    completer.complete(Err(Error::Aborted));
                    return;
                }
                let http_request = build();
                let result = futures::executor::block_on(http.execute(http_request, Arc::clone(&cancel_flag)));
                match &result {
                    Ok(response)
                        if !response.is_success()
                            && attempt < retry.max_retries
                            && RetryConfig::is_retryable_status(response.status) =>
                    {
                        let retry_after = response
                            .header("Retry-After")
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(|secs| Duration::from_secs(secs.min(300)))
                            .unwrap_or_else(|| retry.delay_for_attempt(attempt));
                        tracing::debug!(attempt, status = response.status, "retrying request");
                        std::thread::sleep(retry_after);
                        attempt += 1;
                        continue;
                    }
                    Err(e) if attempt < retry.max_retries && e.is_recoverable() => {
                        tracing::debug!(attempt, error = %e, "retrying request after transport error");
                        std::thread::sleep(retry.delay_for_attempt(attempt));
                        attempt += 1;
                        continue;
                    }
                    _ => {}
                }
                completer.complete(result);
                return;
            }
        });
        request
    }
}

/// Streaming callback contract for downloads. The engine guarantees
/// `progress` is called with a monotonic `now` within one send, and `done`
/// xor `error` fires exactly once, terminally.
pub trait DownloadCallback: Send {
    fn received_data(&mut self, chunk: &[u8]);
    fn progress(&mut self, total: Option<u64>, now: u64);
    fn done(&mut self);
    fn error(&mut self, description: &str);
}

/// Upload source callback: `put_data` fills `buf` and returns the number of
/// bytes written (0 signals end of stream). `reset` is called before the
/// first byte of any (re)send, including retries.
pub trait UploadCallback: Send {
    fn reset(&mut self);
    fn size(&self) -> Option<u64>;
    fn put_data(&mut self, buf: &mut [u8]) -> usize;
    fn progress(&mut self, total: Option<u64>, now: u64);
    fn done(&mut self);
    fn error(&mut self, description: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::ThreadEventLoop;
    use std::sync::Mutex as StdMutex;

    fn test_loop() -> Arc<dyn EventLoop> {
        Arc::new(ThreadEventLoop::new())
    }

    #[test]
    fn then_fires_exactly_once_after_complete() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        let calls = Arc::new(StdMutex::new(0));
        let calls2 = Arc::clone(&calls);
        let _final: Request<i32> = request.then(move |result| {
            *calls2.lock().unwrap() += 1;
            result
        });
        completer.complete(Ok(42));
        event_loop.process_events();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn then_attached_after_complete_still_fires_once() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        completer.complete(Ok(7));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let calls2 = Arc::clone(&calls);
        let _final: Request<i32> = request.then(move |result| {
            calls2.lock().unwrap().push(result.unwrap());
            Ok(())
        });
        event_loop.process_events();
        assert_eq!(*calls.lock().unwrap(), vec![7]);
    }

    #[test]
    fn cancel_before_complete_yields_aborted() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        request.cancel();
        let observed = Arc::new(StdMutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _final: Request<i32> = request.then(move |result| {
            *observed2.lock().unwrap() = Some(result);
            Ok(())
        });
        completer.complete(Ok(1));
        event_loop.process_events();
        assert!(matches!(
            observed.lock().unwrap().take(),
            Some(Err(Error::Aborted))
        ));
    }

    #[test]
    fn cancel_after_complete_is_a_no_op() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        completer.complete(Ok(5));
        request.cancel();
        let observed = Arc::new(StdMutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _final: Request<i32> = request.then(move |result| {
            *observed2.lock().unwrap() = Some(result);
            Ok(())
        });
        event_loop.process_events();
        assert!(matches!(observed.lock().unwrap().take(), Some(Ok(5))));
    }

    #[test]
    fn chained_then_propagates_transformed_values() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        let observed = Arc::new(StdMutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _final: Request<String> = request
            .then(|result| result.map(|n| n * 2))
            .then(move |result| {
                let value = result.map(|n| n.to_string());
                *observed2.lock().unwrap() = Some(value.clone());
                value
            });
        completer.complete(Ok(21));
        event_loop.process_events();
        assert_eq!(observed.lock().unwrap().take(), Some(Ok("42".to_string())));
    }

    #[test]
    fn and_then_flattens_a_dependent_request() {
        let event_loop = test_loop();
        let (request, completer) = Request::<i32>::pending(Arc::clone(&event_loop));
        let observed = Arc::new(StdMutex::new(None));
        let observed2 = Arc::clone(&observed);
        let loop_for_inner = Arc::clone(&event_loop);
        let _final: Request<i32> = request
            .and_then(move |result| {
                let n = result.unwrap();
                Request::ready(Arc::clone(&loop_for_inner), Ok(n + 1))
            })
            .then(move |result| {
                *observed2.lock().unwrap() = Some(result);
                Ok(())
            });
        completer.complete(Ok(10));
        event_loop.process_events();
        event_loop.process_events();
        assert_eq!(observed.lock().unwrap().take(), Some(Ok(11)));
    }

    #[test]
    fn retry_config_backs_off_exponentially_with_jitter() {
        let retry = RetryConfig::default();
        let d0 = retry.delay_for_attempt(0);
        let d1 = retry.delay_for_attempt(1);
        assert!(d1 > d0);
        assert!(d0.as_millis() >= retry.base_delay_ms as u128);
    }

    #[test]
    fn is_retryable_status_matches_known_codes() {
        assert!(RetryConfig::is_retryable_status(503));
        assert!(RetryConfig::is_retryable_status(429));
        assert!(!RetryConfig::is_retryable_status(404));
        assert!(!RetryConfig::is_retryable_status(200));
    }
}
