#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! Scheduler, dispatcher, and per-connection comm-task coordination core
//! for `dispatchd`'s HTTP front end.
//!
//! This crate owns everything below the application layer: accepting
//! connections, driving the HTTP/1.1 protocol state machine per
//! connection (via [`wire`]), routing complete requests to application
//! [`handler::Handler`]s, running them either inline or on a bounded
//! worker pool, and reuniting their results with the right connection or
//! async-job entry. It knows nothing about what any particular route
//! does — that lives in the `server` crate's [`http_server::HandlerFactory`]
//! implementation.

pub mod async_jobs;
pub mod comm_task;
pub mod config;
pub mod dispatch_queue;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod http_server;
pub mod job;
pub mod live_tasks;
pub mod monitor;
pub mod net;
pub mod scheduler;
pub mod signal;
pub mod spinlock;

pub use config::ServerConfig;
pub use error::DispatchError;
pub use http_server::{HandlerFactory, HttpServer};
