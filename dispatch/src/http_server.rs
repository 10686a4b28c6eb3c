//! `HttpServer`: routes parsed requests to application [`Handler`]s and
//! reunites their results with the right connection or async-job entry
//! (distilled spec §4.4, §4.5, §4.6, §9).
//!
//! `HttpServerInner` is the one part of this crate with a genuinely
//! cyclic dependency: its `Dispatcher`'s worker threads need to call back
//! into it once a `Job` finishes, and the `Scheduler` it owns needs a
//! [`RequestSink`] — itself — before it exists. Both are solved the same
//! way, with a short-lived `Arc<Mutex<Option<Weak<HttpServerInner>>>>`
//! cell created in [`HttpServer::start`] before either the `Dispatcher`
//! or the `Scheduler` is built, captured by a thin closure/shim that
//! upgrades it once `HttpServerInner` exists. The cell itself is never
//! stored as a field — nothing needs it after construction finishes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::async_jobs::{AsyncJobManager, AsyncJobStatus, FetchOutcome};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, TransientError};
use crate::event_loop::{DispatchOutcome, GlobalTaskId, RequestSink};
use crate::handler::{ChunkSink, ExecutionPolicy, Handler};
use crate::job::{Job, JobOutcome};
use crate::live_tasks::LiveTaskRegistry;
use crate::monitor::{MonitorSnapshot, WorkMonitor};
use crate::scheduler::Scheduler;
use wire::h1::request::Request;
use wire::h1::response::Response;
use wire::Status;

/// Builds the [`Handler`] that should process one request. The `server`
/// crate's routing table lives behind this seam; `dispatch` only knows
/// how to run whatever `Handler` it is handed.
pub trait HandlerFactory: Send + Sync {
    /// Builds a handler for `request`. Always succeeds — a "no such
    /// route" outcome is itself expressed as a `Handler` whose `execute`
    /// returns a `404` response, not as an `Option`/`Result` here.
    fn create(&self, request: &Request) -> Box<dyn Handler>;
}

/// A cheap, cloneable handle to a running server. Cloning shares the same
/// underlying scheduler/dispatcher/registries; [`Self::shutdown`] is
/// idempotent across clones, so handing one to every admin `Handler`
/// alongside the top-level owner is safe.
#[derive(Clone, Debug)]
pub struct HttpServer {
    inner: Arc<HttpServerInner>,
}

struct HttpServerInner {
    scheduler: Mutex<Option<Scheduler>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    factory: Box<dyn HandlerFactory>,
    async_jobs: AsyncJobManager,
    live_tasks: LiveTaskRegistry,
    /// Maps an async job id to the `Job` currently running it, so
    /// `async_cancel` can reach the executing `Handler` (distilled §4.6:
    /// "cancel(id): ... propagate to executing Job via its Handler's
    /// cancel"). Entries are removed once `finish_job` hands off the
    /// result, same lifetime as the matching `AsyncJobManager` entry's
    /// `Pending` state.
    async_tasks: Mutex<HashMap<u64, Arc<Job>>>,
    /// Tasks currently registered as chunked-streaming producers, so
    /// `route_request` can enforce `config.max_chunked_tasks` and
    /// `finish_job` knows to skip the single-shot `signal_response` path
    /// for them (distilled §4.3).
    chunked_tasks: Mutex<HashSet<GlobalTaskId>>,
    /// A permanent weak handle to this `HttpServerInner`, so a
    /// `SchedulerChunkSink` constructed during `route_request` (and later
    /// invoked from a dispatcher worker thread, long after `route_request`
    /// returns) can still reach the scheduler.
    self_ref: Mutex<Weak<HttpServerInner>>,
    monitor: WorkMonitor,
    config: ServerConfig,
}

impl std::fmt::Debug for HttpServerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerInner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Thin [`RequestSink`] that upgrades a not-yet-populated weak cell,
/// handed to [`Scheduler::start`] before `HttpServerInner` exists.
struct BootstrapSink(Arc<Mutex<Option<Weak<HttpServerInner>>>>);

impl RequestSink for BootstrapSink {
    fn handle_request(&self, task: GlobalTaskId, request: Request) -> DispatchOutcome {
        match self.upgrade() {
            Some(inner) => inner.route_request(task, request),
            None => DispatchOutcome::Ready(
                build_error_response(&DispatchError::Fatal(
                    "server not yet ready to accept requests".into(),
                )),
                false,
            ),
        }
    }

    fn handle_closed(&self, task: GlobalTaskId) {
        if let Some(inner) = self.upgrade() {
            inner.route_closed(task);
        }
    }
}

impl BootstrapSink {
    fn upgrade(&self) -> Option<Arc<HttpServerInner>> {
        self.0.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }
}

impl HttpServer {
    /// Wires up the monitor, dispatcher, live-task registry, async-job
    /// registry, and scheduler, then opens every event loop. No requests
    /// are processed until this returns.
    pub fn start(
        config: ServerConfig,
        factory: Box<dyn HandlerFactory>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<HttpServer, DispatchError> {
        let monitor = WorkMonitor::start();
        let self_cell: Arc<Mutex<Option<Weak<HttpServerInner>>>> = Arc::new(Mutex::new(None));

        let completion_cell = self_cell.clone();
        let dispatcher = Dispatcher::start(&config, monitor.handle(), move |job, outcome| {
            let upgraded = completion_cell.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let Some(inner) = upgraded {
                inner.finish_job(job, outcome);
            } else {
                warn!("job completed after server teardown began, discarding result");
            }
        });

        let sink = Arc::new(BootstrapSink(self_cell.clone()));
        let scheduler = Scheduler::start(&config, sink, monitor.handle(), tls_config)?;

        let live_tasks = LiveTaskRegistry::new(config.comm_task_lock);
        let async_jobs = AsyncJobManager::new(config.async_job_ttl(), config.async_job_capacity);

        let inner = Arc::new(HttpServerInner {
            scheduler: Mutex::new(Some(scheduler)),
            dispatcher: Mutex::new(Some(dispatcher)),
            factory,
            async_jobs,
            live_tasks,
            async_tasks: Mutex::new(HashMap::new()),
            chunked_tasks: Mutex::new(HashSet::new()),
            self_ref: Mutex::new(Weak::new()),
            monitor,
            config,
        });

        *self_cell.lock().unwrap() = Some(Arc::downgrade(&inner));
        *inner.self_ref.lock().unwrap() = Arc::downgrade(&inner);

        if let Some(scheduler) = inner.scheduler.lock().unwrap().as_ref() {
            scheduler.open_all();
        }

        Ok(HttpServer { inner })
    }

    /// Peeks at an async job's status without removing it.
    pub fn async_poll(&self, id: u64) -> Option<AsyncJobStatus> {
        self.inner.async_jobs.poll(id)
    }

    /// Atomically fetches and removes a finished async job's result.
    pub fn async_fetch(&self, id: u64) -> FetchOutcome {
        self.inner.async_jobs.fetch(id)
    }

    /// Cancels an async job; propagates to the executing `Job` if one is
    /// still running.
    pub fn async_cancel(&self, id: u64) {
        self.inner.async_jobs.cancel(id);
        let job = self.inner.async_tasks.lock().unwrap().get(&id).cloned();
        if let Some(job) = job {
            job.cancel();
        }
    }

    /// Drops async-job entries past their configured TTL. Intended to be
    /// called periodically (e.g. from a timer on the `server` binary's
    /// main thread).
    pub fn sweep_async_jobs(&self) {
        self.inner.async_jobs.sweep_expired();
    }

    /// A structured snapshot of every thread's current work stack.
    pub fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.inner.monitor.snapshot()
    }

    /// Per-queue metrics, keyed by queue name, for the `/_monitor`
    /// surface (distilled §10 supplemented feature).
    pub fn queue_depths(&self) -> Vec<(String, u64, u64, u64)> {
        let guard = self.inner.dispatcher.lock().unwrap();
        let Some(dispatcher) = guard.as_ref() else {
            return Vec::new();
        };
        dispatcher
            .queue_names()
            .filter_map(|name| {
                dispatcher.metrics_for(name).map(|m| {
                    (
                        name.to_string(),
                        m.depth.load(std::sync::atomic::Ordering::Relaxed),
                        m.rejected_total.load(std::sync::atomic::Ordering::Relaxed),
                        m.completed_total.load(std::sync::atomic::Ordering::Relaxed),
                    )
                })
            })
            .collect()
    }

    /// Signals every event loop and dispatcher queue to stop and joins
    /// their threads. Safe to call more than once (including from
    /// multiple clones): the second call onward is a no-op.
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.inner.scheduler.lock().unwrap().take() {
            scheduler.shutdown();
        }
        if let Some(dispatcher) = self.inner.dispatcher.lock().unwrap().take() {
            dispatcher.shutdown();
        }
    }
}

impl HttpServerInner {
    fn route_request(&self, task: GlobalTaskId, request: Request) -> DispatchOutcome {
        if request.header("x-async").is_some() {
            return self.dispatch_async(request);
        }

        let handler = self.factory.create(&request);
        let job = Arc::new(Job::new(handler, request, task));
        let keep_alive = job.keep_alive();

        if job.is_chunked() {
            return match self.register_chunked(task) {
                Ok(()) => {
                    job.set_chunk_sink(self.chunk_sink(task));
                    let queue = match job.policy() {
                        ExecutionPolicy::Direct => "standard",
                        ExecutionPolicy::Queued { queue } => queue,
                    };
                    self.submit_sync(task, job, queue)
                }
                Err(e) => {
                    DispatchOutcome::Ready(build_error_response(&e), false)
                }
            };
        }

        match job.policy() {
            ExecutionPolicy::Direct if self.config.direct_execution_allowed => {
                let _scope = self.monitor.handle().push_handler();
                let outcome = job.work();
                DispatchOutcome::Ready(response_for_outcome(outcome), keep_alive)
            }
            ExecutionPolicy::Direct => self.submit_sync(task, job, "standard"),
            ExecutionPolicy::Queued { queue } => self.submit_sync(task, job, queue),
        }
    }

    /// Reserves a `chunked_tasks` slot for `task`, enforcing
    /// `config.max_chunked_tasks`. A chunked handler always runs on a
    /// worker thread (never `Direct`) since streaming inherently blocks
    /// the calling thread for the run's duration.
    fn register_chunked(&self, task: GlobalTaskId) -> Result<(), DispatchError> {
        let mut chunked = self.chunked_tasks.lock().unwrap();
        if chunked.len() >= self.config.max_chunked_tasks {
            return Err(DispatchError::Transient(TransientError::ChunkedCapacity));
        }
        chunked.insert(task);
        Ok(())
    }

    /// Builds the `ChunkSink` a chunked job's `Handler` streams into.
    fn chunk_sink(&self, task: GlobalTaskId) -> Arc<dyn ChunkSink> {
        Arc::new(SchedulerChunkSink {
            inner: self.self_ref.lock().unwrap().clone(),
            task,
        })
    }

    fn submit_sync(&self, task: GlobalTaskId, job: Arc<Job>, queue: &str) -> DispatchOutcome {
        self.live_tasks.register(task, job.clone());
        match self.submit(queue, job) {
            Ok(()) => DispatchOutcome::Pending,
            Err(e) => {
                self.live_tasks.remove(task);
                DispatchOutcome::Ready(build_error_response(&e), false)
            }
        }
    }

    fn dispatch_async(&self, request: Request) -> DispatchOutcome {
        let keep_alive = request.keep_alive();
        let handler = self.factory.create(&request);
        if handler.is_chunked() {
            // A detached job has no CommTask to stream chunks into.
            return DispatchOutcome::Ready(
                build_error_response(&DispatchError::Fatal(
                    "chunked handlers cannot be dispatched as detached async jobs".into(),
                )),
                keep_alive,
            );
        }
        let async_id = self.async_jobs.allocate();
        let job = Arc::new(Job::new_detached(handler, request, async_id));
        self.async_tasks.lock().unwrap().insert(async_id, job.clone());

        let queue = match job.policy() {
            ExecutionPolicy::Direct if self.config.direct_execution_allowed => {
                let _scope = self.monitor.handle().push_handler();
                let outcome = job.work();
                self.finish_job(&job, outcome);
                return DispatchOutcome::Ready(accepted_response(async_id), keep_alive);
            }
            ExecutionPolicy::Direct => "standard",
            ExecutionPolicy::Queued { queue } => queue,
        };

        match self.submit(queue, job) {
            Ok(()) => DispatchOutcome::Ready(accepted_response(async_id), keep_alive),
            Err(e) => {
                self.async_tasks.lock().unwrap().remove(&async_id);
                self.async_jobs.finish(async_id, AsyncJobStatus::Error, e.to_string().into_bytes());
                DispatchOutcome::Ready(build_error_response(&e), keep_alive)
            }
        }
    }

    fn route_closed(&self, task: GlobalTaskId) {
        if let Some(job) = self.live_tasks.remove(task) {
            job.begin_shutdown();
            job.cancel();
        }
    }

    /// Runs on whichever worker thread finished `job` (distilled §4.4
    /// "cleanup"). Guards the handoff-destination read against a
    /// concurrent `route_closed` with `begin_cleanup`/`end_cleanup`, then
    /// hands the result to whichever destination — `AsyncJobManager` or
    /// the originating `CommTask` via `Scheduler` — `job` still points to.
    fn finish_job(&self, job: &Job, outcome: JobOutcome) {
        job.begin_cleanup();
        let async_id = job.async_id();
        let task = job.task();
        job.end_cleanup();

        if !job.mark_handoff_completed() {
            return;
        }

        if let Some(async_id) = async_id {
            self.async_tasks.lock().unwrap().remove(&async_id);
            let (status, bytes) = encode_async_outcome(outcome);
            self.async_jobs.finish(async_id, status, bytes);
            return;
        }

        let Some(task) = task else {
            // CommTask was torn down before this job finished; nothing
            // left to deliver the result to.
            return;
        };

        self.live_tasks.remove(task);

        if job.is_chunked() {
            // The headers, every chunk, and the terminating chunk were
            // already delivered through the job's `ChunkSink` as
            // `execute_chunked` ran; there is no single `Response` left
            // to signal.
            self.chunked_tasks.lock().unwrap().remove(&task);
            return;
        }

        let guard = self.scheduler.lock().unwrap();
        if let Some(scheduler) = guard.as_ref() {
            if let Err(e) = scheduler.signal_response(task, outcome, job.keep_alive()) {
                warn!(error = %e, "failed to signal job completion to its event loop");
            }
        }
    }

    fn submit(&self, queue: &str, job: Arc<Job>) -> Result<(), DispatchError> {
        let guard = self.dispatcher.lock().unwrap();
        match guard.as_ref() {
            Some(dispatcher) => dispatcher.submit(queue, job),
            None => Err(DispatchError::Fatal("dispatcher already shut down".into())),
        }
    }
}

/// A [`ChunkSink`] backed by a `Scheduler` reached through a weak handle
/// to the owning `HttpServerInner`, so it stays usable for the lifetime
/// of a worker thread's `execute_chunked` call even though it is
/// constructed back on the event-loop thread during `route_request`.
struct SchedulerChunkSink {
    inner: Weak<HttpServerInner>,
    task: GlobalTaskId,
}

impl std::fmt::Debug for SchedulerChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerChunkSink")
            .field("task", &self.task)
            .finish()
    }
}

impl SchedulerChunkSink {
    fn with_scheduler(
        &self,
        f: impl FnOnce(&Scheduler) -> Result<(), DispatchError>,
    ) -> Result<(), DispatchError> {
        let inner = self.inner.upgrade().ok_or_else(|| {
            DispatchError::Internal("server torn down while streaming a chunked response".into())
        })?;
        let guard = inner.scheduler.lock().unwrap();
        match guard.as_ref() {
            Some(scheduler) => f(scheduler),
            None => Err(DispatchError::Internal("scheduler already shut down".into())),
        }
    }
}

impl ChunkSink for SchedulerChunkSink {
    fn start(&self, response: Response) -> Result<(), DispatchError> {
        self.with_scheduler(|scheduler| scheduler.send_stream_start(self.task, response))
    }

    fn send_chunk(&self, data: Vec<u8>) -> Result<(), DispatchError> {
        self.with_scheduler(|scheduler| scheduler.send_chunk(self.task, data))
    }

    fn finish(&self, keep_alive: bool) -> Result<(), DispatchError> {
        self.with_scheduler(|scheduler| scheduler.send_final_chunk(self.task, keep_alive))
    }
}

fn response_for_outcome(outcome: JobOutcome) -> Response {
    match outcome {
        JobOutcome::Completed(response) => response,
        JobOutcome::Cancelled => build_error_response(&DispatchError::Cancelled),
        JobOutcome::Failed(err) => build_error_response(&err),
        // Headers/chunks were already flushed through the `ChunkSink`;
        // nothing left for the caller to do with the response.
        JobOutcome::Streamed => Response::builder(Status::Ok).chunked(),
    }
}

fn encode_async_outcome(outcome: JobOutcome) -> (AsyncJobStatus, Vec<u8>) {
    match outcome {
        JobOutcome::Completed(response) => (AsyncJobStatus::Done, response.serialize()),
        JobOutcome::Cancelled => (AsyncJobStatus::Cancelled, Vec::new()),
        JobOutcome::Failed(err) => (AsyncJobStatus::Error, build_error_response(&err).serialize()),
        // Unreachable in practice: `dispatch_async` refuses chunked
        // handlers before a detached `Job` is ever built.
        JobOutcome::Streamed => (AsyncJobStatus::Error, Vec::new()),
    }
}

fn accepted_response(async_id: u64) -> Response {
    Response::builder(Status::Accepted)
        .header("x-async-id", async_id.to_string())
        .empty()
}

fn build_error_response(err: &DispatchError) -> Response {
    let status = err.status_hint().unwrap_or(Status::InternalServerError);
    Response::builder(status).body(err.to_string().into_bytes())
}
