//! Demo handler table: `/debug`, the `/job` async-job lifecycle surface,
//! and `/_monitor`.
//!
//! `dispatch` knows nothing about routes — it only runs whatever
//! [`Handler`] a [`HandlerFactory`] hands it for a parsed [`Request`].
//! This module is that factory. Handlers that need to call back into the
//! running server (the job-lifecycle and monitor handlers) hold a
//! `OnceLock<HttpServer>` populated once `HttpServer::start` returns —
//! the same "can't know the handle before construction finishes" problem
//! `dispatch::http_server` solves with a weak cell, except here there is
//! no destruction-order cycle to break, only an initialization-order one,
//! so a plain `OnceLock` is enough.

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use dispatch::async_jobs::{AsyncJobStatus, FetchOutcome};
use dispatch::error::DispatchError;
use dispatch::handler::{CancelFlag, ExecutionPolicy, Handler};
use dispatch::{HandlerFactory, HttpServer};
use wire::h1::request::Request;
use wire::h1::response::Response;
use wire::{Method, Status};

const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Builds the demo `HandlerFactory`, returning it alongside the cell the
/// caller must populate with the running `HttpServer` once it exists.
pub fn new_factory() -> (AppHandlerFactory, Arc<OnceLock<HttpServer>>) {
    let cell = Arc::new(OnceLock::new());
    (
        AppHandlerFactory {
            server: cell.clone(),
        },
        cell,
    )
}

#[derive(Debug)]
pub struct AppHandlerFactory {
    server: Arc<OnceLock<HttpServer>>,
}

impl HandlerFactory for AppHandlerFactory {
    fn create(&self, request: &Request) -> Box<dyn Handler> {
        let (path, query) = split_target(&request.target);

        match (request.method, path) {
            (Method::Get, "/debug") | (Method::Post, "/debug") => Box::new(DebugHandler {
                sleep_ms: query_u64(query, "sleep").unwrap_or(0),
            }),
            (Method::Post, "/job") => Box::new(DebugHandler {
                sleep_ms: query_u64(query, "sleep").unwrap_or(0),
            }),
            (Method::Get, "/_monitor") => Box::new(MonitorHandler {
                server: self.server.clone(),
            }),
            (method, p) if p.starts_with("/job/") => {
                job_handler(method, &p["/job/".len()..], self.server.clone())
            }
            _ => Box::new(NotFoundHandler),
        }
    }
}

fn job_handler(method: Method, id_segment: &str, server: Arc<OnceLock<HttpServer>>) -> Box<dyn Handler> {
    match id_segment.parse::<u64>() {
        Ok(id) => match method {
            Method::Get => Box::new(JobPollHandler { server, id }),
            Method::Put => Box::new(JobFetchHandler { server, id }),
            Method::Delete => Box::new(JobCancelHandler { server, id }),
            _ => Box::new(NotFoundHandler),
        },
        Err(_) => Box::new(NotFoundHandler),
    }
}

fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

fn query_u64(query: Option<&str>, key: &str) -> Option<u64> {
    query?
        .split('&')
        .find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == key))
        .and_then(|(_, v)| v.parse().ok())
}

/// Serves scenario 1's debug payload, optionally sleeping (in small steps,
/// checking for cancellation) before responding.
#[derive(Debug)]
struct DebugHandler {
    sleep_ms: u64,
}

#[derive(Serialize)]
struct DebugBody<'a> {
    server: &'a str,
    sleep: u64,
    block: bool,
    version: &'a str,
}

impl Handler for DebugHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        let mut remaining = self.sleep_ms;
        while remaining > 0 {
            if cancel_flag.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let step = remaining.min(SLEEP_STEP.as_millis() as u64);
            thread::sleep(Duration::from_millis(step));
            remaining -= step;
        }

        let body = DebugBody {
            server: "dispatchd",
            sleep: self.sleep_ms,
            block: false,
            version: env!("CARGO_PKG_VERSION"),
        };
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| DispatchError::Internal(format!("failed to encode debug body: {e}")))?;

        Ok(Response::builder(Status::Ok)
            .header("content-type", "application/json")
            .body(bytes))
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Queued { queue: "standard" }
    }
}

#[derive(Debug)]
struct JobPollHandler {
    server: Arc<OnceLock<HttpServer>>,
    id: u64,
}

impl Handler for JobPollHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        let server = server_handle(&self.server)?;
        match server.async_poll(self.id) {
            Some(status) => Ok(status_response(status)),
            None => Err(not_found(self.id)),
        }
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Direct
    }
}

#[derive(Debug)]
struct JobFetchHandler {
    server: Arc<OnceLock<HttpServer>>,
    id: u64,
}

impl Handler for JobFetchHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        let server = server_handle(&self.server)?;
        match server.async_fetch(self.id) {
            FetchOutcome::Ready(body, AsyncJobStatus::Done) => {
                Ok(Response::builder(Status::Ok).body(body))
            }
            FetchOutcome::Ready(body, AsyncJobStatus::Error) => {
                Ok(Response::builder(Status::InternalServerError).body(body))
            }
            FetchOutcome::Ready(_, AsyncJobStatus::Cancelled) => {
                Ok(Response::builder(Status::ClientClosedRequest).empty())
            }
            FetchOutcome::Ready(_, AsyncJobStatus::Pending) => {
                unreachable!("AsyncJobManager::fetch never reports Ready for a pending job")
            }
            FetchOutcome::Pending => Ok(Response::builder(Status::Accepted)
                .header("x-async-id", self.id.to_string())
                .empty()),
            FetchOutcome::Unknown => Err(not_found(self.id)),
        }
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Direct
    }
}

#[derive(Debug)]
struct JobCancelHandler {
    server: Arc<OnceLock<HttpServer>>,
    id: u64,
}

impl Handler for JobCancelHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        let server = server_handle(&self.server)?;
        if server.async_poll(self.id).is_none() {
            return Err(not_found(self.id));
        }
        server.async_cancel(self.id);
        Ok(Response::builder(Status::NoContent).empty())
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Direct
    }
}

fn status_response(status: AsyncJobStatus) -> Response {
    let label = match status {
        AsyncJobStatus::Pending => "pending",
        AsyncJobStatus::Done => "done",
        AsyncJobStatus::Error => "error",
        AsyncJobStatus::Cancelled => "cancelled",
    };
    Response::builder(Status::Ok)
        .header("content-type", "application/json")
        .body(format!(r#"{{"status":"{label}"}}"#).into_bytes())
}

fn not_found(id: u64) -> DispatchError {
    DispatchError::Handler {
        status: Status::NotFound,
        message: format!("no such async job: {id}"),
    }
}

#[derive(Debug)]
struct MonitorHandler {
    server: Arc<OnceLock<HttpServer>>,
}

#[derive(Serialize)]
struct MonitorReport {
    threads: Vec<MonitorThreadReport>,
    queues: Vec<QueueReport>,
}

#[derive(Serialize)]
struct MonitorThreadReport {
    name: String,
    stack: Vec<dispatch::monitor::WorkDescription>,
}

#[derive(Serialize)]
struct QueueReport {
    name: String,
    depth: u64,
    rejected_total: u64,
    completed_total: u64,
}

impl Handler for MonitorHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        let server = server_handle(&self.server)?;
        let snapshot = server.monitor_snapshot();
        let report = MonitorReport {
            threads: snapshot
                .threads
                .into_iter()
                .map(|(name, stack)| MonitorThreadReport { name, stack })
                .collect(),
            queues: server
                .queue_depths()
                .into_iter()
                .map(|(name, depth, rejected_total, completed_total)| QueueReport {
                    name,
                    depth,
                    rejected_total,
                    completed_total,
                })
                .collect(),
        };

        let bytes = serde_json::to_vec(&report)
            .map_err(|e| DispatchError::Internal(format!("failed to encode monitor report: {e}")))?;

        Ok(Response::builder(Status::Ok)
            .header("content-type", "application/json")
            .body(bytes))
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Direct
    }
}

#[derive(Debug)]
struct NotFoundHandler;

impl Handler for NotFoundHandler {
    fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
        Ok(())
    }

    fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
        Ok(Response::builder(Status::NotFound).empty())
    }

    fn finalize(&mut self) {}

    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Direct
    }
}

fn server_handle(cell: &OnceLock<HttpServer>) -> Result<&HttpServer, DispatchError> {
    cell.get().ok_or_else(|| {
        warn!("admin handler invoked before server handle was published");
        DispatchError::Internal("server not yet fully started".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        assert_eq!(("/debug", Some("sleep=10")), split_target("/debug?sleep=10"));
        assert_eq!(("/debug", None), split_target("/debug"));
    }

    #[test]
    fn parses_sleep_query_param() {
        assert_eq!(Some(10), query_u64(Some("sleep=10"), "sleep"));
        assert_eq!(None, query_u64(Some("other=1"), "sleep"));
        assert_eq!(None, query_u64(None, "sleep"));
    }

    #[test]
    fn job_path_without_numeric_id_is_not_found() {
        let cell: Arc<OnceLock<HttpServer>> = Arc::new(OnceLock::new());
        let mut handler = job_handler(Method::Get, "not-a-number", cell);
        let request = Request {
            method: Method::Get,
            target: "/job/not-a-number".to_string(),
            version: wire::Version::H1_1,
            headers: Vec::new(),
            body: Vec::new(),
        };
        let flag = CancelFlag::new();
        handler.prepare(&request).unwrap();
        let response = handler.execute(&flag).unwrap();
        assert_eq!(Status::NotFound, response.status());
    }
}
