//! `Dispatcher`: a set of named queues selected by `Handler::policy()`
//! (distilled spec §2.4, §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::dispatch_queue::DispatcherQueue;
use crate::error::{DispatchError, TransientError};
use crate::job::{Job, JobOutcome};
use crate::monitor::MonitorHandle;

/// Owns every named `DispatcherQueue` and routes submissions to the one
/// `Handler::policy()` selected.
#[derive(Debug)]
pub struct Dispatcher {
    queues: HashMap<String, DispatcherQueue>,
}

impl Dispatcher {
    /// Builds one `DispatcherQueue` per entry in
    /// `config.dispatcher_queues`, each draining into `on_completion`.
    pub fn start<F>(config: &ServerConfig, monitor: MonitorHandle, on_completion: F) -> Self
    where
        F: Fn(&Job, JobOutcome) + Send + Sync + Clone + 'static,
    {
        let queues = config
            .dispatcher_queues
            .iter()
            .map(|(name, queue_config)| {
                let queue = DispatcherQueue::start(
                    name.clone(),
                    queue_config.size,
                    queue_config.threads,
                    monitor.clone(),
                    on_completion.clone(),
                );
                (name.clone(), queue)
            })
            .collect();

        Dispatcher { queues }
    }

    /// Submits `job` to the queue named `queue_name`, or `NoSuchQueue` if
    /// no such queue was configured.
    pub fn submit(&self, queue_name: &str, job: Arc<Job>) -> Result<(), DispatchError> {
        match self.queues.get(queue_name) {
            Some(queue) => queue.submit(job),
            None => Err(DispatchError::Transient(TransientError::NoSuchQueue)),
        }
    }

    /// Per-queue metrics, for the `/_monitor` diagnostic surface.
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Borrows one queue's metrics by name.
    pub fn metrics_for(&self, queue_name: &str) -> Option<&crate::dispatch_queue::QueueMetrics> {
        self.queues.get(queue_name).map(DispatcherQueue::metrics)
    }

    /// Drains and joins every queue's workers (distilled §5: "Dispatcher
    /// drains queues, then joins workers").
    pub fn shutdown(self) {
        for (_, queue) in self.queues {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::monitor::WorkMonitor;
    use std::collections::BTreeMap;

    #[test]
    fn submit_to_unknown_queue_is_transient_error() {
        let monitor = WorkMonitor::start();
        let mut cfg = ServerConfig::default();
        cfg.dispatcher_queues = BTreeMap::new();
        cfg.dispatcher_queues
            .insert("standard".to_string(), QueueConfig { size: 4, threads: 1 });

        let dispatcher = Dispatcher::start(&cfg, monitor.handle(), |_job, _outcome| {});
        let job = Arc::new(crate::job::Job::new_detached(
            Box::new(NoopHandler),
            sample_request(),
            1,
        ));

        let result = dispatcher.submit("does-not-exist", job);
        assert!(matches!(
            result,
            Err(DispatchError::Transient(TransientError::NoSuchQueue))
        ));

        dispatcher.shutdown();
    }

    #[derive(Debug)]
    struct NoopHandler;
    impl crate::handler::Handler for NoopHandler {
        fn prepare(&mut self, _request: &wire::h1::request::Request) -> Result<(), DispatchError> {
            Ok(())
        }
        fn execute(
            &mut self,
            _cancel_flag: &crate::handler::CancelFlag,
        ) -> Result<wire::h1::response::Response, DispatchError> {
            Ok(wire::h1::response::Response::new_with_status_line(
                wire::Version::H1_1,
                wire::Status::NoContent,
            ))
        }
        fn finalize(&mut self) {}
    }

    fn sample_request() -> wire::h1::request::Request {
        wire::h1::request::Request {
            method: wire::Method::Get,
            target: "/".to_string(),
            version: wire::Version::H1_1,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}
