//! `Scheduler`: owns the listen sockets and a pool of `EventLoop` threads,
//! round-robining accepted connections across them (distilled spec §4.2).
//!
//! Grounded on the teacher's `examples/example_server.rs`, which spawns
//! one `MultiListener` per core, each with its own `SO_REUSEPORT`-style
//! bound listener. This crate instead centralizes the accept path here —
//! per distilled §4.2's "Scheduler owns accept and round-robins new
//! sockets to loops" — using a dedicated acceptor thread per configured
//! listen endpoint. Acceptor threads use the blocking `std::net::
//! TcpListener` impl of `net::tcp_listener::TcpListener` (see that
//! module's doc comment for why the trait has both a `mio` and a `std`
//! implementation): accepting is inherently serial per socket regardless
//! of which API does it, and a blocking accept loop is simpler than
//! giving every acceptor its own `Poll` just to wait on one fd.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Poll, Waker};
use rustls::{ServerConfig as TlsServerConfig, ServerConnection};
use tracing::{info, warn};

use crate::config::{ListenEndpoint, ServerConfig};
use crate::error::DispatchError;
use crate::event_loop::{EventLoop, EventLoopHandle, GlobalTaskId, LoopId, RequestSink, COMMAND_TOKEN};
use crate::job::JobOutcome;
use crate::monitor::MonitorHandle;
use crate::net::tcp_listener::TcpListener;

/// Owns every `EventLoop` thread and every listen endpoint's acceptor
/// thread. Dropping a `Scheduler` does not stop anything by itself — call
/// [`Scheduler::shutdown`] for an orderly teardown.
#[derive(Debug)]
pub struct Scheduler {
    loops: Vec<EventLoopHandle>,
    loop_threads: Vec<JoinHandle<()>>,
    acceptor_threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns `config.event_loops` reactor threads (starting in
    /// `LoopState::Created`) and one acceptor thread per
    /// `config.listen` endpoint. Loops do not begin polling until
    /// [`Self::open_all`] is called.
    pub fn start(
        config: &ServerConfig,
        sink: Arc<dyn RequestSink>,
        monitor: MonitorHandle,
        tls_config: Option<Arc<TlsServerConfig>>,
    ) -> Result<Self, DispatchError> {
        if config.listen.iter().any(|e| e.encrypted) && tls_config.is_none() {
            return Err(DispatchError::Fatal(
                "listen endpoint requests TLS but no TLS configuration was provided".into(),
            ));
        }

        let loop_count = config.event_loops.max(1);
        let mut loops = Vec::with_capacity(loop_count);
        let mut loop_threads = Vec::with_capacity(loop_count);

        for i in 0..loop_count {
            let poll = Poll::new().map_err(|e| DispatchError::Fatal(e.to_string()))?;
            let waker = Arc::new(
                Waker::new(poll.registry(), COMMAND_TOKEN)
                    .map_err(|e| DispatchError::Fatal(e.to_string()))?,
            );

            let (event_loop, handle) = EventLoop::new(
                LoopId(i),
                poll,
                waker,
                sink.clone(),
                monitor.clone(),
                config.keep_alive_timeout(),
            );

            let thread = thread::Builder::new()
                .name(format!("event-loop-{i}"))
                .spawn(move || event_loop.run())
                .map_err(|e| DispatchError::Fatal(e.to_string()))?;

            loops.push(handle);
            loop_threads.push(thread);
        }

        let loops_shared = Arc::new(loops.clone());
        let next_loop = Arc::new(AtomicUsize::new(0));
        let mut acceptor_threads = Vec::with_capacity(config.listen.len());

        for endpoint in &config.listen {
            let listener = StdTcpListener::bind(endpoint.address)
                .map_err(|e| DispatchError::Fatal(format!("bind {}: {e}", endpoint.address)))?;

            let loops_shared = loops_shared.clone();
            let next_loop = next_loop.clone();
            let endpoint = endpoint.clone();
            let tls_config = tls_config.clone();

            let thread = thread::Builder::new()
                .name(format!("acceptor-{}", endpoint.address))
                .spawn(move || accept_loop(listener, endpoint, loops_shared, next_loop, tls_config))
                .map_err(|e| DispatchError::Fatal(e.to_string()))?;

            acceptor_threads.push(thread);
        }

        Ok(Scheduler {
            loops,
            loop_threads,
            acceptor_threads,
        })
    }

    /// Flips every loop from `Created` to `Open`, letting them begin
    /// polling. Called once `HttpServer` has finished wiring its
    /// self-referential handle, so no request can be processed before
    /// the server is fully constructed.
    pub fn open_all(&self) {
        for handle in &self.loops {
            handle.open();
        }
    }

    /// Borrows the handle for one loop, by id.
    pub fn loop_handle(&self, id: LoopId) -> Option<&EventLoopHandle> {
        self.loops.get(id.0)
    }

    /// Wakes `task.loop_id` with the given job outcome.
    pub fn signal_response(
        &self,
        task: GlobalTaskId,
        outcome: JobOutcome,
        keep_alive: bool,
    ) -> Result<(), DispatchError> {
        let handle = self.loop_handle(task.loop_id).ok_or_else(|| {
            DispatchError::Internal(format!("no such loop: {:?}", task.loop_id))
        })?;
        handle.signal_job_done(task.task, outcome, keep_alive)
    }

    /// Flushes a chunked response's headers to `task`'s loop, ahead of any
    /// chunk bytes.
    pub fn send_stream_start(
        &self,
        task: GlobalTaskId,
        response: wire::h1::response::Response,
    ) -> Result<(), DispatchError> {
        let handle = self.loop_handle(task.loop_id).ok_or_else(|| {
            DispatchError::Internal(format!("no such loop: {:?}", task.loop_id))
        })?;
        handle.send_stream_start(task.task, response)
    }

    /// Delivers one chunk of a streaming response to `task`'s loop.
    pub fn send_chunk(&self, task: GlobalTaskId, data: Vec<u8>) -> Result<(), DispatchError> {
        let handle = self.loop_handle(task.loop_id).ok_or_else(|| {
            DispatchError::Internal(format!("no such loop: {:?}", task.loop_id))
        })?;
        handle.send_chunk(task.task, data)
    }

    /// Delivers the terminating chunk of a streaming response to `task`'s
    /// loop.
    pub fn send_final_chunk(&self, task: GlobalTaskId, keep_alive: bool) -> Result<(), DispatchError> {
        let handle = self.loop_handle(task.loop_id).ok_or_else(|| {
            DispatchError::Internal(format!("no such loop: {:?}", task.loop_id))
        })?;
        handle.send_final_chunk(task.task, keep_alive)
    }

    /// Signals every loop to stop, then joins its thread. Acceptor
    /// threads are left blocked in `accept()` on a listener with no
    /// remaining owner; the process exiting is what actually reclaims
    /// them; this only tears down the side that holds application state.
    pub fn shutdown(self) {
        for handle in &self.loops {
            if let Err(e) = handle.shutdown() {
                warn!(error = %e, "failed to signal event loop shutdown");
            }
        }

        for thread in self.loop_threads {
            if thread.join().is_err() {
                warn!("event loop thread panicked during shutdown");
            }
        }

        for thread in self.acceptor_threads {
            drop(thread);
        }
    }
}

fn accept_loop(
    listener: StdTcpListener,
    endpoint: ListenEndpoint,
    loops: Arc<Vec<EventLoopHandle>>,
    next_loop: Arc<AtomicUsize>,
    tls_config: Option<Arc<TlsServerConfig>>,
) {
    info!(address = %endpoint.address, encrypted = endpoint.encrypted, "acceptor thread listening");

    loop {
        let (stream, _peer) = match StdTcpListener::accept(&listener) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(address = %endpoint.address, error = %e, "accept failed");
                continue;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "failed to set accepted socket non-blocking, dropping connection");
            continue;
        }

        let mio_stream = mio::net::TcpStream::from_std(stream);

        let tls = match (endpoint.encrypted, &tls_config) {
            (true, Some(cfg)) => match ServerConnection::new(cfg.clone()) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "failed to start TLS session, dropping connection");
                    continue;
                }
            },
            _ => None,
        };

        let idx = next_loop.fetch_add(1, Ordering::Relaxed) % loops.len();
        if let Err(e) = loops[idx].mount(mio_stream, tls) {
            warn!(loop_id = idx, error = %e, "failed to hand off accepted connection");
        }
    }
}

/// Binds a listener for one endpoint, verifying the address is usable
/// before a `Scheduler` commits to it — used by `server`'s startup path
/// to fail fast with a clear error rather than a panic deep in a spawned
/// thread.
pub fn preflight_bind(endpoint: &ListenEndpoint) -> io::Result<()> {
    let listener = <StdTcpListener as TcpListener<std::net::TcpStream>>::bind(endpoint.address)?;
    drop(listener);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_bind_succeeds_on_ephemeral_port() {
        let endpoint = ListenEndpoint {
            address: "127.0.0.1:0".parse().unwrap(),
            encrypted: false,
        };
        assert!(preflight_bind(&endpoint).is_ok());
    }
}
