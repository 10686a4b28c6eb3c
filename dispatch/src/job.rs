//! `Job`: a schedulable wrapper around a [`Handler`] (distilled spec §3,
//! §4.4, §9).
//!
//! The teacher's `Connection` had no notion of a cross-thread handoff at
//! all — a worker held a `Mutex<Connection>` for the duration of a request.
//! The distilled spec's source material instead refcounted a raw Handler
//! pointer between a Job and a CommTask (`refcount ∈ {1, 2}`). Per §9's
//! redesign flag, that is re-expressed here as a two-owner handoff: the
//! `Job` exclusively owns the `Handler` while `work()` runs; once finished,
//! ownership moves either to the `AsyncJobManager` (detached) or to the
//! originating `CommTask` (sync path), gated by a single atomic
//! "handoff completed" flag rather than a refcount.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::DispatchError;
use crate::event_loop::GlobalTaskId;
use crate::handler::{CancelFlag, ChunkSink, Handler};
use wire::h1::request::Request;
use wire::h1::response::Response;

/// Outcome of a completed `Job`, produced by `Job::work` and consumed by
/// `cleanup` (distilled §4.4).
#[derive(Debug)]
pub enum JobOutcome {
    /// The handler produced a response.
    Completed(Response),
    /// The handler (or the dispatcher) failed.
    Failed(DispatchError),
    /// The job was cancelled before or during execution.
    Cancelled,
    /// The handler streamed its response through a [`ChunkSink`] instead
    /// of returning one; headers, chunks, and the terminating chunk were
    /// already delivered as `execute_chunked` ran (distilled §4.3).
    Streamed,
}

/// A schedulable unit wrapping a [`Handler`] for dispatcher execution.
///
/// `detached` is fixed at construction (distilled open-question
/// resolution: `Job::detached` never changes after `new`/`new_detached`).
#[derive(Debug)]
pub struct Job {
    handler: Mutex<Box<dyn Handler>>,
    request: Request,
    cancel_flag: CancelFlag,
    /// The originating `CommTask`'s global (loop-qualified) id, or `None`
    /// once [`Self::begin_shutdown`] has observed the task is gone. Behind
    /// a `Mutex` (rather than a plain field) so the CommTask destruction
    /// path can clear it through a shared `Arc<Job>` without needing
    /// exclusive ownership.
    task: Mutex<Option<GlobalTaskId>>,
    /// Whether the originating request asked to be kept alive, captured
    /// at construction so `cleanup` can decide the post-response
    /// connection state without re-parsing the request.
    keep_alive: bool,
    detached: bool,
    async_id: Option<u64>,
    /// Set by `cleanup` once the Handler (or error) has been handed off
    /// to its destination (CommTask or AsyncJobManager). Idempotency
    /// guard for the Job -> CommTask signal (distilled §4.8: "signal is
    /// idempotent").
    handoff_completed: AtomicBool,
    /// Guards the window during which `cleanup` is deciding the handoff
    /// destination against a concurrent `CommTask` destruction path
    /// (distilled §4.4's "cleanup-in-progress flag").
    cleanup_in_progress: AtomicBool,
    /// Set by `HttpServerInner::route_request` before submission when the
    /// handler is chunked, so `work` can flush headers/chunks as it runs
    /// instead of returning a single `Response` at the end. `None` for
    /// every non-chunked job, and for detached jobs (which have no
    /// `CommTask` to stream into).
    chunk_sink: Mutex<Option<Arc<dyn ChunkSink>>>,
}

impl Job {
    /// Builds a Job bound to a live `CommTask` (the "sync path": on
    /// completion, the handler hands back to `task`).
    pub fn new(handler: Box<dyn Handler>, request: Request, task: GlobalTaskId) -> Self {
        let keep_alive = request.keep_alive();
        Job {
            handler: Mutex::new(handler),
            request,
            cancel_flag: CancelFlag::new(),
            task: Mutex::new(Some(task)),
            keep_alive,
            detached: false,
            async_id: None,
            handoff_completed: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
            chunk_sink: Mutex::new(None),
        }
    }

    /// Builds a detached Job (the "async path": no owning CommTask; the
    /// result is published into the `AsyncJobManager` under `async_id`).
    pub fn new_detached(handler: Box<dyn Handler>, request: Request, async_id: u64) -> Self {
        let keep_alive = request.keep_alive();
        Job {
            handler: Mutex::new(handler),
            request,
            cancel_flag: CancelFlag::new(),
            task: Mutex::new(None),
            keep_alive,
            detached: true,
            async_id: Some(async_id),
            handoff_completed: AtomicBool::new(false),
            cleanup_in_progress: AtomicBool::new(false),
            chunk_sink: Mutex::new(None),
        }
    }

    /// Whether this job's handler streams its response through a
    /// [`ChunkSink`] rather than returning one from `execute`.
    pub fn is_chunked(&self) -> bool {
        match self.handler.lock() {
            Ok(handler) => handler.is_chunked(),
            Err(poisoned) => poisoned.into_inner().is_chunked(),
        }
    }

    /// Registers the sink `work` must stream into. Must be called before
    /// submission for any job whose handler is chunked.
    pub fn set_chunk_sink(&self, sink: Arc<dyn ChunkSink>) {
        *self.chunk_sink.lock().unwrap() = Some(sink);
    }

    /// Whether this job has no owning CommTask.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// The async-job id, if this job is detached.
    pub fn async_id(&self) -> Option<u64> {
        self.async_id
    }

    /// The originating CommTask's id, if this job is not detached and the
    /// task has not since been cleared by `begin_shutdown`.
    pub fn task(&self) -> Option<GlobalTaskId> {
        *self.task.lock().unwrap()
    }

    /// Whether the originating request asked to be kept alive.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Where this job wants to run, per its `Handler::policy()`.
    pub fn policy(&self) -> crate::handler::ExecutionPolicy {
        match self.handler.lock() {
            Ok(handler) => handler.policy(),
            Err(poisoned) => poisoned.into_inner().policy(),
        }
    }

    /// A handle workers can use to drive cooperative cancellation.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel_flag
    }

    /// Cancels the job. Safe to call from any thread (distilled §4.9).
    pub fn cancel(&self) {
        if let Ok(mut handler) = self.handler.lock() {
            handler.cancel(&self.cancel_flag);
        } else {
            self.cancel_flag.cancel();
        }
    }

    /// Runs `prepare -> execute -> finalize` on the calling thread (a
    /// dispatcher worker thread, or the event-loop thread for direct
    /// execution). `finalize` always runs, matching distilled §4.9's
    /// "finalizeExecute still runs" even when `execute` fails.
    pub fn work(&self) -> JobOutcome {
        if self.cancel_flag.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let mut handler = match self.handler.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };

        if handler.is_chunked() {
            return self.work_chunked(&mut *handler);
        }

        let outcome = match handler.prepare(&self.request) {
            Ok(()) => handler.execute(&self.cancel_flag),
            Err(e) => Err(e),
        };
        handler.finalize();

        match outcome {
            Ok(response) => JobOutcome::Completed(response),
            Err(DispatchError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }

    /// The chunked counterpart of `work`'s `prepare -> execute -> finalize`
    /// flow: flushes a `chunked` response's headers through the sink,
    /// streams the body via `execute_chunked`, then sends the terminating
    /// chunk. Requires `set_chunk_sink` to have been called first.
    fn work_chunked(&self, handler: &mut Box<dyn Handler>) -> JobOutcome {
        let sink = match self.chunk_sink.lock().unwrap().clone() {
            Some(sink) => sink,
            None => {
                handler.finalize();
                return JobOutcome::Failed(DispatchError::Internal(
                    "chunked job has no registered ChunkSink".into(),
                ));
            }
        };

        let outcome = (|| {
            handler.prepare(&self.request)?;
            let headers = Response::builder(wire::Status::Ok).chunked();
            sink.start(headers)?;
            handler.execute_chunked(&self.cancel_flag, sink.as_ref())
        })();
        handler.finalize();

        match outcome {
            Ok(()) => match sink.finish(self.keep_alive) {
                Ok(()) => JobOutcome::Streamed,
                Err(DispatchError::Cancelled) => JobOutcome::Cancelled,
                Err(e) => JobOutcome::Failed(e),
            },
            Err(DispatchError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }

    /// Begins the destruction path for the CommTask that owned this job
    /// (distilled §4.4, §4.8): spins briefly on `cleanup_in_progress` so
    /// it never observes a half-completed handoff, then clears `task` so
    /// a subsequent (or concurrent) `cleanup`/signal finds no live
    /// destination and discards its result instead of touching a
    /// destroyed CommTask.
    pub fn begin_shutdown(&self) {
        while self.cleanup_in_progress.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        *self.task.lock().unwrap() = None;
    }

    /// Marks the start of `cleanup`'s handoff decision. Held until
    /// [`Self::end_cleanup`] is called.
    pub(crate) fn begin_cleanup(&self) {
        self.cleanup_in_progress.store(true, Ordering::Release);
    }

    /// Marks the end of `cleanup`'s handoff decision.
    pub(crate) fn end_cleanup(&self) {
        self.cleanup_in_progress.store(false, Ordering::Release);
    }

    /// Whether a handoff destination has already consumed this job's
    /// result. The dispatcher worker loop checks this before signalling
    /// so a duplicate or racing signal collapses into a no-op
    /// (distilled §4.8: "signal is idempotent").
    pub fn handoff_completed(&self) -> bool {
        self.handoff_completed.load(Ordering::Acquire)
    }

    /// Marks the handoff complete. Returns `true` the first time it is
    /// called, `false` on any subsequent call (so callers can tell
    /// whether they were the one to complete it).
    pub fn mark_handoff_completed(&self) -> bool {
        self.handoff_completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::event_loop::LoopId;
    use wire::h1::request::Request;
    use wire::{Method, Version};

    fn task(n: usize) -> GlobalTaskId {
        GlobalTaskId {
            loop_id: LoopId(0),
            task: crate::comm_task::TaskId(n),
        }
    }

    #[derive(Debug)]
    struct Echo;
    impl Handler for Echo {
        fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
            Ok(())
        }
        fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
            Ok(Response::new_with_status_line(
                Version::H1_1,
                wire::Status::Ok,
            ))
        }
        fn finalize(&mut self) {}
    }

    fn sample_request() -> Request {
        Request {
            method: Method::Get,
            target: "/".to_string(),
            version: Version::H1_1,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn detached_flag_is_fixed_at_construction() {
        let job = Job::new_detached(Box::new(Echo), sample_request(), 7);
        assert!(job.is_detached());
        assert_eq!(Some(7), job.async_id());
    }

    #[test]
    fn work_runs_prepare_execute_finalize() {
        let job = Job::new(Box::new(Echo), sample_request(), task(1));
        match job.work() {
            JobOutcome::Completed(response) => {
                assert_eq!(wire::Status::Ok, response.status())
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_job_skips_execute() {
        let job = Job::new(Box::new(Echo), sample_request(), task(1));
        job.cancel();
        assert!(matches!(job.work(), JobOutcome::Cancelled));
    }

    #[test]
    fn handoff_completes_exactly_once() {
        let job = Job::new(Box::new(Echo), sample_request(), task(1));
        assert!(job.mark_handoff_completed());
        assert!(!job.mark_handoff_completed());
        assert!(job.handoff_completed());
    }

    #[test]
    fn begin_shutdown_clears_task() {
        let job = Job::new(Box::new(Echo), sample_request(), task(3));
        assert_eq!(Some(task(3)), job.task());
        job.begin_shutdown();
        assert_eq!(None, job.task());
    }
}
