//! `LiveTaskRegistry`: maps a live `CommTask`'s [`GlobalTaskId`] to the
//! `Job` currently running on its behalf (distilled spec §4.5, §9).
//!
//! `HttpServer::handle_closed` needs this when a connection dies mid-
//! dispatch (client disconnected before its handler finished): the
//! `EventLoop` only knows the `CommTask` is gone, not which in-flight
//! `Job` to cancel. Backed by either `std::sync::Mutex` or
//! [`crate::spinlock::Spinlock`] depending on
//! [`crate::config::LockStrategy`] — distilled §9's redesign flag moving
//! that choice from a compile-time build flag to a runtime one.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::LockStrategy;
use crate::event_loop::GlobalTaskId;
use crate::job::Job;
use crate::spinlock::Spinlock;
use std::sync::Arc;

type Table = HashMap<GlobalTaskId, Arc<Job>>;

#[derive(Debug)]
enum Backing {
    Mutex(Mutex<Table>),
    Spin(Spinlock<Table>),
}

/// Registry of in-flight (non-detached) jobs, keyed by the `CommTask`
/// they're running on behalf of.
#[derive(Debug)]
pub struct LiveTaskRegistry {
    backing: Backing,
}

impl LiveTaskRegistry {
    /// Builds an empty registry using the configured locking strategy.
    pub fn new(strategy: LockStrategy) -> Self {
        let backing = match strategy {
            LockStrategy::Mutex => Backing::Mutex(Mutex::new(HashMap::new())),
            LockStrategy::Spin => Backing::Spin(Spinlock::new(HashMap::new())),
        };
        LiveTaskRegistry { backing }
    }

    /// Records that `job` is executing on behalf of `task`.
    pub fn register(&self, task: GlobalTaskId, job: Arc<Job>) {
        match &self.backing {
            Backing::Mutex(m) => {
                m.lock().unwrap().insert(task, job);
            }
            Backing::Spin(s) => {
                s.lock().insert(task, job);
            }
        }
    }

    /// Removes and returns the job running on behalf of `task`, if any.
    pub fn remove(&self, task: GlobalTaskId) -> Option<Arc<Job>> {
        match &self.backing {
            Backing::Mutex(m) => m.lock().unwrap().remove(&task),
            Backing::Spin(s) => s.lock().remove(&task),
        }
    }

    /// Borrows (via clone) the job running on behalf of `task`, if any,
    /// without removing it.
    pub fn get(&self, task: GlobalTaskId) -> Option<Arc<Job>> {
        match &self.backing {
            Backing::Mutex(m) => m.lock().unwrap().get(&task).cloned(),
            Backing::Spin(s) => s.lock().get(&task).cloned(),
        }
    }

    /// Number of jobs currently tracked.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Mutex(m) => m.lock().unwrap().len(),
            Backing::Spin(s) => s.lock().len(),
        }
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm_task::TaskId;
    use crate::event_loop::LoopId;
    use crate::handler::{CancelFlag, Handler};
    use crate::error::DispatchError;
    use wire::h1::request::Request;
    use wire::h1::response::Response;
    use wire::{Method, Version};

    #[derive(Debug)]
    struct Noop;
    impl Handler for Noop {
        fn prepare(&mut self, _request: &Request) -> Result<(), DispatchError> {
            Ok(())
        }
        fn execute(&mut self, _cancel_flag: &CancelFlag) -> Result<Response, DispatchError> {
            Ok(Response::new_with_status_line(Version::H1_1, wire::Status::Ok))
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

    fn task(n: usize) -> GlobalTaskId {
        GlobalTaskId { loop_id: LoopId(0), task: TaskId(n) }
    }

    #[test]
    fn register_then_remove_round_trips_for_both_strategies() {
        for strategy in [LockStrategy::Mutex, LockStrategy::Spin] {
            let registry = LiveTaskRegistry::new(strategy);
            let job = Arc::new(Job::new(Box::new(Noop), sample_request(), task(1)));

            registry.register(task(1), job.clone());
            assert_eq!(1, registry.len());
            assert!(registry.get(task(1)).is_some());

            let removed = registry.remove(task(1));
            assert!(removed.is_some());
            assert!(registry.is_empty());
        }
    }
}
