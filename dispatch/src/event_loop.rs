//! `EventLoop`: one `mio::Poll` reactor thread owning a `Slab<CommTask>`
//! (distilled spec §4.1).
//!
//! Grounded on the teacher's `MultiListener::run`/`event` (`src/
//! multilistener.rs`): the same `Poll` + `Events` + per-token dispatch
//! shape, generalized from a single listener-owned `Slab<Connection>` into
//! a plain per-loop `Slab<CommTask>` fed by a `Scheduler` that owns the
//! accept path, plus a command channel replacing the teacher's narrower
//! `closed_connections` channel (distilled §4.1: "command queue of
//! Register/Unregister/Destroy ops").

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::{Events, Poll, Token, Waker};
use rustls::ServerConnection;
use slab::Slab;
use tracing::warn;
use wire::h1::request::Request;
use wire::h1::response::Response;

use crate::comm_task::{CommTask, TaskId, TaskState};
use crate::error::DispatchError;
use crate::job::JobOutcome;
use crate::monitor::MonitorHandle;
use crate::signal::Signal;

/// The concrete socket type every `CommTask` in this crate wraps. Only
/// `mio::net::TcpStream` implements both [`crate::net::tcp_stream::TcpStream`]
/// and `mio::event::Source` (see `net::tcp_stream`'s doc comment), so
/// `CommTask<S>`'s generic parameter never varies in practice; fixing it
/// here avoids threading a generic through `Scheduler`/`HttpServer` for no
/// benefit.
pub type Conn = mio::net::TcpStream;

/// Identifies one `EventLoop` thread among the `Scheduler`'s pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopId(pub usize);

/// A `Task`'s identity: the loop that owns its `Slab` slot plus the slot's
/// local `TaskId` (distilled §3: "identity + loop affinity"). A bare
/// `TaskId` is only unique within one loop's `Slab`; this is what a `Job`
/// actually carries so a cross-thread completion signal reaches the right
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalTaskId {
    /// The owning loop.
    pub loop_id: LoopId,
    /// The task's slot within that loop.
    pub task: TaskId,
}

/// Explicit lifecycle state for one `EventLoop` (distilled §4.1).
///
/// `Created -> Open` is a genuine startup barrier, not cosmetic: a
/// `Scheduler`'s acceptor threads start running (and may push `Mount`
/// commands) before `HttpServer::start` has finished wiring its
/// self-referential `Weak` handle, but an `EventLoop` sitting in `Created`
/// never touches its `Poll`, so those commands simply queue in the
/// channel until `Scheduler::open_all` flips every loop to `Open` — by
/// which point construction has completed and it is safe for requests to
/// start flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Thread spawned, not yet allowed to poll.
    Created = 0,
    /// Allowed to poll; about to enter its run loop.
    Open = 1,
    /// Actively polling and dispatching events.
    Running = 2,
    /// Draining in-flight tasks before halting.
    Stopping = 3,
    /// Thread has returned.
    Stopped = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Created,
            1 => LoopState::Open,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// Commands an `EventLoopHandle` can push into its loop's inbox.
#[derive(Debug)]
pub enum LoopMessage {
    /// A freshly accepted connection to register and track.
    Mount {
        /// The accepted, non-blocking socket.
        stream: Conn,
        /// `Some` if this listen endpoint terminates TLS.
        tls: Option<Box<ServerConnection>>,
    },
    /// A `Job` (sync path) finished; carries the response-or-error and
    /// whether the connection may be kept alive afterward.
    JobDone {
        /// The `CommTask` this result belongs to.
        task: TaskId,
        /// What the job produced.
        outcome: JobOutcome,
        /// Whether the originating request asked to be kept alive.
        keep_alive: bool,
    },
    /// A chunked response's status line and headers, flushed ahead of any
    /// chunk bytes.
    StreamStart {
        /// The `CommTask` this stream belongs to.
        task: TaskId,
        /// The headers-only response to write immediately.
        response: Response,
    },
    /// One chunk of a streaming response.
    Chunk {
        /// The `CommTask` this chunk belongs to.
        task: TaskId,
        /// Encoded chunk bytes (already framed by `wire::chunked`).
        data: Vec<u8>,
    },
    /// The terminating zero-length chunk.
    FinalChunk {
        /// The `CommTask` this chunk belongs to.
        task: TaskId,
        /// Whether the connection may be kept alive afterward.
        keep_alive: bool,
    },
    /// Begin graceful shutdown.
    Shutdown,
}

/// What `RequestSink::handle_request` tells the `EventLoop` to do with the
/// `CommTask` that just produced a complete request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A response is ready right now (direct execution, routing failure,
    /// or immediate backpressure rejection); write it out.
    Ready(Response, bool),
    /// Submitted for asynchronous completion; the `EventLoop` will hear
    /// back via a [`LoopMessage::JobDone`].
    Pending,
}

/// The seam between an `EventLoop` (transport-only) and `HttpServer`
/// (routing/dispatch), so `event_loop` never depends on `http_server`.
pub trait RequestSink: Send + Sync {
    /// A `CommTask` finished parsing a request; route and (maybe) run it.
    fn handle_request(&self, task: GlobalTaskId, request: Request) -> DispatchOutcome;

    /// A `CommTask` is being torn down while a `Job` may still be
    /// executing on its behalf (distilled §4.5:
    /// "handleCommunicationClosed").
    fn handle_closed(&self, task: GlobalTaskId);
}

/// Token the command-queue `Waker` is registered under. Distinct from any
/// `Slab` key since `Slab::vacant_entry` only ever yields small indices.
pub const COMMAND_TOKEN: Token = Token(usize::MAX);

/// A cheap, cloneable reference to a running `EventLoop`, used by the
/// `Scheduler`'s acceptor threads and by `HttpServer` to push work and
/// completion signals in.
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    id: LoopId,
    commands: Signal<LoopMessage>,
    state: Arc<AtomicU8>,
}

impl EventLoopHandle {
    /// This handle's loop identity.
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Flips `Created -> Open`, letting the loop thread begin polling.
    /// A no-op if the loop has already progressed past `Created`.
    pub fn open(&self) {
        let _ = self.state.compare_exchange(
            LoopState::Created as u8,
            LoopState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Hands a freshly accepted socket to this loop.
    pub fn mount(&self, stream: Conn, tls: Option<ServerConnection>) -> Result<(), DispatchError> {
        self.commands
            .send(LoopMessage::Mount {
                stream,
                tls: tls.map(Box::new),
            })
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }

    /// Delivers a finished job's result back to its `CommTask`.
    pub fn signal_job_done(
        &self,
        task: TaskId,
        outcome: JobOutcome,
        keep_alive: bool,
    ) -> Result<(), DispatchError> {
        self.commands
            .send(LoopMessage::JobDone {
                task,
                outcome,
                keep_alive,
            })
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }

    /// Flushes a chunked response's headers, ahead of any chunk bytes.
    pub fn send_stream_start(&self, task: TaskId, response: Response) -> Result<(), DispatchError> {
        self.commands
            .send(LoopMessage::StreamStart { task, response })
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }

    /// Delivers one chunk of a streaming response.
    pub fn send_chunk(&self, task: TaskId, data: Vec<u8>) -> Result<(), DispatchError> {
        self.commands
            .send(LoopMessage::Chunk { task, data })
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }

    /// Delivers the terminating chunk of a streaming response.
    pub fn send_final_chunk(&self, task: TaskId, keep_alive: bool) -> Result<(), DispatchError> {
        self.commands
            .send(LoopMessage::FinalChunk { task, keep_alive })
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }

    /// Requests graceful shutdown.
    pub fn shutdown(&self) -> Result<(), DispatchError> {
        self.state
            .store(LoopState::Stopping as u8, Ordering::Release);
        self.commands
            .send(LoopMessage::Shutdown)
            .map_err(|_| DispatchError::Fatal("event loop command channel closed".into()))
    }
}

/// One reactor thread: owns its `Poll`, its `Slab<CommTask>`, and drains
/// both socket events and its command inbox (distilled §4.1).
pub struct EventLoop {
    id: LoopId,
    poll: Poll,
    tasks: Slab<CommTask<Conn>>,
    commands: Receiver<LoopMessage>,
    state: Arc<AtomicU8>,
    sink: Arc<dyn RequestSink>,
    monitor: MonitorHandle,
    keep_alive_timeout: Duration,
}

impl EventLoop {
    /// Builds a loop in `Created` state, along with the handle other
    /// threads use to reach it. `waker` must already be registered with
    /// `poll`'s registry under [`COMMAND_TOKEN`].
    pub fn new(
        id: LoopId,
        poll: Poll,
        waker: Arc<Waker>,
        sink: Arc<dyn RequestSink>,
        monitor: MonitorHandle,
        keep_alive_timeout: Duration,
    ) -> (Self, EventLoopHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(AtomicU8::new(LoopState::Created as u8));

        let handle = EventLoopHandle {
            id,
            commands: Signal::new(tx, waker),
            state: state.clone(),
        };

        let event_loop = EventLoop {
            id,
            poll,
            tasks: Slab::new(),
            commands: rx,
            state,
            sink,
            monitor,
            keep_alive_timeout,
        };

        (event_loop, handle)
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Runs the loop until it observes `Shutdown` and drains its
    /// remaining tasks. Blocks the calling thread; intended to be the
    /// body of a dedicated `std::thread`.
    pub fn run(mut self) {
        self.monitor.register_thread(format!("event-loop-{}", self.id.0));
        self.wait_until_open();
        self.state.store(LoopState::Running as u8, Ordering::Release);

        let mut events = Events::with_capacity(1024);
        loop {
            match self.poll.poll(&mut events, Some(Duration::from_millis(250))) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(loop_id = self.id.0, error = %e, "event loop poll failed, stopping");
                    break;
                }
            }

            for event in events.iter() {
                if event.token() == COMMAND_TOKEN {
                    self.drain_commands();
                } else {
                    self.handle_io(event);
                }
            }

            self.check_keep_alive_timeouts();

            if self.state() == LoopState::Stopping && self.tasks.is_empty() {
                break;
            }
        }

        self.state.store(LoopState::Stopped as u8, Ordering::Release);
    }

    fn wait_until_open(&self) {
        while self.state() == LoopState::Created {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(message) = self.commands.try_recv() {
            match message {
                LoopMessage::Mount { stream, tls } => self.mount(stream, tls.map(|b| *b)),
                LoopMessage::JobDone { task, outcome, keep_alive } => {
                    self.complete_job(task, outcome, keep_alive)
                }
                LoopMessage::StreamStart { task, response } => {
                    self.deliver_stream_start(task, response)
                }
                LoopMessage::Chunk { task, data } => self.deliver_chunk(task, data),
                LoopMessage::FinalChunk { task, keep_alive } => {
                    self.deliver_final_chunk(task, keep_alive)
                }
                LoopMessage::Shutdown => {
                    self.state.store(LoopState::Stopping as u8, Ordering::Release);
                }
            }
        }
    }

    fn mount(&mut self, stream: Conn, tls: Option<ServerConnection>) {
        let entry = self.tasks.vacant_entry();
        let token = Token(entry.key());

        let mut task = match tls {
            Some(tls) => CommTask::new_tls(token, stream, tls, self.keep_alive_timeout),
            None => CommTask::new_plain(token, stream, self.keep_alive_timeout),
        };

        if let Err(e) = task.register(self.poll.registry()) {
            warn!(loop_id = self.id.0, error = %e, "failed to register accepted connection");
            return;
        }

        entry.insert(task);
    }

    fn handle_io(&mut self, event: &mio::event::Event) {
        let token = event.token();
        if !self.tasks.contains(token.0) {
            return;
        }

        if event.is_readable() {
            let task = &mut self.tasks[token.0];
            if task.state() == TaskState::KeepAlive {
                task.reset_for_next_request();
            }
            match task.read() {
                Ok(Some(request)) => self.dispatch_request(token, request),
                Ok(None) => {}
                Err(_) => self.tasks[token.0].close(),
            }
        }

        if event.is_writable() {
            if let Some(task) = self.tasks.get_mut(token.0) {
                if task.write().is_err() {
                    task.close();
                }
            }
        }

        self.after_io(token);
    }

    fn dispatch_request(&mut self, token: Token, request: Request) {
        let global = GlobalTaskId {
            loop_id: self.id,
            task: TaskId(token.0),
        };

        match self.sink.handle_request(global, request) {
            DispatchOutcome::Ready(response, keep_alive) => {
                if let Some(task) = self.tasks.get_mut(token.0) {
                    task.enqueue_response(response, keep_alive);
                }
            }
            DispatchOutcome::Pending => {}
        }
    }

    fn complete_job(&mut self, task_id: TaskId, outcome: JobOutcome, keep_alive: bool) {
        let Some(task) = self.tasks.get_mut(task_id.0) else {
            return;
        };

        match outcome {
            JobOutcome::Completed(response) => task.enqueue_response(response, keep_alive),
            JobOutcome::Cancelled => {
                task.enqueue_response(error_response(&DispatchError::Cancelled), false)
            }
            JobOutcome::Failed(err) => {
                if err.closes_connection() || err.status_hint().is_none() {
                    task.enqueue_response(error_response(&err), false);
                } else {
                    task.enqueue_response(error_response(&err), keep_alive);
                }
            }
            // `HttpServerInner::finish_job` never forwards a `Streamed`
            // outcome here: its headers, chunks, and terminating chunk
            // were already delivered through `StreamStart`/`Chunk`/
            // `FinalChunk` as the handler ran.
            JobOutcome::Streamed => {}
        }

        self.after_io(Token(task_id.0));
    }

    fn deliver_stream_start(&mut self, task_id: TaskId, response: Response) {
        if let Some(task) = self.tasks.get_mut(task_id.0) {
            task.enqueue_stream_headers(response);
        }
        self.after_io(Token(task_id.0));
    }

    fn deliver_chunk(&mut self, task_id: TaskId, data: Vec<u8>) {
        if let Some(task) = self.tasks.get_mut(task_id.0) {
            task.enqueue_chunk(&data);
        }
        self.after_io(Token(task_id.0));
    }

    fn deliver_final_chunk(&mut self, task_id: TaskId, keep_alive: bool) {
        if let Some(task) = self.tasks.get_mut(task_id.0) {
            task.enqueue_final_chunk(keep_alive);
        }
        self.after_io(Token(task_id.0));
    }

    fn after_io(&mut self, token: Token) {
        let Some(task) = self.tasks.get_mut(token.0) else {
            return;
        };

        if task.is_closed() {
            self.close_task(token);
            return;
        }

        if let Err(e) = task.reregister(self.poll.registry()) {
            warn!(loop_id = self.id.0, error = %e, "failed to reregister connection");
            self.close_task(token);
        }
    }

    fn close_task(&mut self, token: Token) {
        if let Some(mut task) = (self.tasks.contains(token.0)).then(|| self.tasks.remove(token.0)) {
            let _ = task.deregister(self.poll.registry());
        }

        let global = GlobalTaskId {
            loop_id: self.id,
            task: TaskId(token.0),
        };
        self.sink.handle_closed(global);
    }

    fn check_keep_alive_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.keep_alive_expired(now))
            .map(|(key, _)| key)
            .collect();

        for key in expired {
            self.close_task(Token(key));
        }
    }
}

/// Builds an error response from a `DispatchError`, for the `Cancelled`/
/// `Failed` job outcomes the loop has to render without going back
/// through `HttpServer`'s routing (distilled §4.9).
fn error_response(err: &DispatchError) -> Response {
    let status = err.status_hint().unwrap_or(wire::Status::InternalServerError);
    Response::builder(status).body(err.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_state_round_trips_through_u8() {
        for state in [
            LoopState::Created,
            LoopState::Open,
            LoopState::Running,
            LoopState::Stopping,
            LoopState::Stopped,
        ] {
            assert_eq!(state, LoopState::from_u8(state as u8));
        }
    }

    #[test]
    fn global_task_id_is_ordered_by_loop_then_task() {
        let a = GlobalTaskId { loop_id: LoopId(0), task: TaskId(5) };
        let b = GlobalTaskId { loop_id: LoopId(1), task: TaskId(0) };
        assert!(a < b);
    }
}
