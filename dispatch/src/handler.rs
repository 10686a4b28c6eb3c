//! `WorkItem` / `Handler` (distilled spec §2.1, §9).
//!
//! A `Handler` is the application-level request processor: it owns the
//! request and the in-progress response, and is handed between a `Job`
//! (while running) and a `CommTask` (once a response is ready). Generalized
//! from the teacher's `Connection` trait (`read`/`write`/`parse`/
//! `is_closed`), which plays the same "drives one unit of work to
//! completion" role but at the transport layer rather than the
//! application layer.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use wire::h1::request::Request;
use wire::h1::response::Response;

use crate::error::DispatchError;

/// Where a `Job` wrapping this handler should run (distilled §9: "mixed
/// direct vs queued execution... model as a policy enum returned by the
/// Handler").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Run inline on the event-loop thread. Must not block or suspend.
    Direct,
    /// Submit to the named `DispatcherQueue` and run on a worker thread.
    Queued {
        /// Name of the target queue, matched against
        /// [`crate::config::ServerConfig::dispatcher_queues`].
        queue: &'static str,
    },
}

/// The destination a chunked `Handler` streams its body into, once
/// registered as a chunked producer (distilled §4.3: "the Handler may
/// register the task with HttpServer as a chunked producer; subsequent
/// sendChunk(taskId, bytes) calls from any thread enqueue chunks"). Backed
/// by `HttpServer`'s scheduler handle, so calls are safe from the worker
/// thread running `execute_chunked`.
pub trait ChunkSink: Send + Sync + Debug {
    /// Flushes the response's status line and headers. Must be called
    /// exactly once, before the first [`Self::send_chunk`].
    fn start(&self, response: Response) -> Result<(), DispatchError>;

    /// Enqueues one chunk of body data, delivered to the client in the
    /// order `send_chunk` is called (distilled §5: "chunks produced on
    /// any thread are delivered in enqueue order").
    fn send_chunk(&self, data: Vec<u8>) -> Result<(), DispatchError>;

    /// Enqueues the terminating zero-length chunk and applies the
    /// connection's post-response keep-alive decision.
    fn finish(&self, keep_alive: bool) -> Result<(), DispatchError>;
}

/// Shared flag a `Handler` must consult at cancellation points during
/// long-running work (distilled §4.9, §5).
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// A fresh, not-yet-cancelled flag.
    pub fn new() -> Self {
        CancelFlag(AtomicBool::new(false))
    }

    /// Marks the flag cancelled. Safe to call from any thread.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The application-level unit of work bound to a single request.
///
/// Lifecycle: `prepare` runs once, synchronously, before a `Job` is
/// built (so the queue selector and execution policy can be read);
/// `execute` does the (possibly long) work; `finalize` always runs
/// afterward, win or lose, so scoped resources release deterministically
/// (distilled §4.9: "Handler exception inside execute: finalizeExecute
/// still runs").
pub trait Handler: Send + Debug {
    /// Validates the request and readies any resources needed by
    /// `execute`. Runs on whichever thread will call `execute` (the
    /// event-loop thread for `Direct`, a worker thread otherwise).
    fn prepare(&mut self, request: &Request) -> Result<(), DispatchError>;

    /// Performs the unit of work and produces a response. Must
    /// periodically consult `cancel_flag` for handlers that can run
    /// long (distilled §5: "Handlers must not suspend; long operations
    /// poll a cancellation flag").
    fn execute(&mut self, cancel_flag: &CancelFlag) -> Result<Response, DispatchError>;

    /// Always invoked after `execute`, regardless of outcome, to release
    /// any scoped resources acquired in `prepare`.
    fn finalize(&mut self);

    /// Cooperative cancellation entry point; must be callable from any
    /// thread (distilled §5).
    fn cancel(&mut self, cancel_flag: &CancelFlag) {
        cancel_flag.cancel();
    }

    /// Which queue (or direct execution) this handler targets.
    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Queued { queue: "standard" }
    }

    /// Whether this handler registers as a chunked-streaming producer
    /// instead of returning a single `Response` from `execute`
    /// (distilled §4.3 "chunked streaming"). A `true` handler must
    /// override [`Self::execute_chunked`] instead of (or in addition to)
    /// `execute` — `Job::work` calls `execute_chunked` when this is set.
    fn is_chunked(&self) -> bool {
        false
    }

    /// Performs the unit of work by streaming the response body through
    /// `sink` instead of returning a single `Response`. Only called when
    /// [`Self::is_chunked`] returns `true`; `sink` has already flushed the
    /// response's headers by the time this is invoked. Must periodically
    /// consult `cancel_flag`, same as `execute`.
    fn execute_chunked(
        &mut self,
        cancel_flag: &CancelFlag,
        sink: &dyn ChunkSink,
    ) -> Result<(), DispatchError> {
        let _ = (cancel_flag, sink);
        Err(DispatchError::Internal(
            "handler declared is_chunked() but does not override execute_chunked".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_starts_clear() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn default_policy_is_standard_queue() {
        #[derive(Debug)]
        struct Noop;
        impl Handler for Noop {
            fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
                Ok(())
            }
            fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
                Ok(Response::new_with_status_line(
                    wire::Version::H1_1,
                    wire::Status::NoContent,
                ))
            }
            fn finalize(&mut self) {}
        }

        assert_eq!(
            ExecutionPolicy::Queued { queue: "standard" },
            Noop.policy()
        );
    }
}
