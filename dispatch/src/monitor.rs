//! `WorkMonitor`: process-wide observability core (distilled spec §4.7).
//!
//! New module — the teacher has no equivalent (its `worker.rs` doc
//! comment even muses about adding per-worker introspection but never
//! built it). Per distilled §9's redesign flag ("encapsulate global
//! mutable state... in an explicitly created `MonitorService` whose
//! lifetime is tied to process init/teardown"), this is built as an
//! explicitly constructed service with an owned background thread
//! rather than a singleton/thread-local pair, using
//! `crossbeam-queue::ArrayQueue` (a sibling of the `crossbeam-channel`
//! the teacher already depends on) for the two lock-free reclamation
//! queues distilled §4.7 calls for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use tracing::debug;

/// What kind of unit of work a [`WorkDescription`] node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// The node at the bottom of a thread's stack, describing the thread
    /// itself (event-loop thread, dispatcher worker, monitor thread).
    Thread,
    /// A handler currently executing on this thread.
    Handler,
}

/// A node in a per-thread observability stack (distilled §4.7). Carries
/// no pointer back to its creator beyond what is needed to reconstruct a
/// snapshot; lifetime ends when it is dropped, which pushes its slot
/// into the reclamation queue instead of running a destructor inline.
#[derive(Debug, Clone, Serialize)]
pub struct WorkDescription {
    /// Which kind of node this is.
    pub kind: WorkKind,
    /// Thread name, if known.
    pub thread_name: String,
    /// Free-form description (e.g. the handler's type name).
    pub detail: String,
}

const RECLAMATION_CAPACITY: usize = 4096;

struct Inner {
    /// Snapshot-able description of the top of each thread's stack. Pushing
    /// a handler appends; popping removes. Simpler than a true per-thread
    /// linked stack (distilled §9's simplification target list calls out
    /// the thread-local/lock-free-queue pairing as something to
    /// encapsulate, not necessarily preserve verbatim) while keeping the
    /// "strictly LIFO per thread" invariant, since each thread only ever
    /// touches its own `Vec`.
    stacks: std::sync::Mutex<std::collections::HashMap<String, Vec<WorkDescription>>>,
    /// Lock-free queue of descriptions ready to be recycled.
    reusable: ArrayQueue<WorkDescription>,
    /// Lock-free queue of descriptions ready to be freed (logged, then
    /// dropped) by the monitor thread.
    freeable: ArrayQueue<WorkDescription>,
    shutdown: AtomicBool,
}

/// A structured point-in-time snapshot of every thread's work stack, for
/// diagnostics (distilled §4.7: "periodically snapshots all thread stacks
/// into a structured document").
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    /// One entry per thread that has ever pushed a `WorkDescription`.
    pub threads: Vec<(String, Vec<WorkDescription>)>,
}

/// Owns the monitor's background reclamation thread. Dropping this stops
/// the thread.
#[derive(Debug)]
pub struct WorkMonitor {
    inner: Arc<Inner>,
    reclaimer: Option<JoinHandle<()>>,
}

/// A cheap, cloneable handle threads use to push/pop work descriptions
/// and take snapshots, without owning the background thread's lifetime.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    inner: Arc<Inner>,
}

/// RAII guard returned by [`MonitorHandle::push_handler`]; pops the
/// pushed description when dropped, enforcing the LIFO invariant even if
/// the handler panics.
#[derive(Debug)]
pub struct HandlerScope {
    inner: Arc<Inner>,
    thread_name: String,
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        let mut stacks = self.inner.stacks.lock().unwrap();
        if let Some(stack) = stacks.get_mut(&self.thread_name) {
            if let Some(description) = stack.pop() {
                if self.inner.freeable.push(description).is_err() {
                    debug!("work monitor reclamation queue full, dropping description inline");
                }
            }
        }
    }
}

impl WorkMonitor {
    /// Starts the monitor and its background reclamation thread.
    pub fn start() -> Self {
        let inner = Arc::new(Inner {
            stacks: std::sync::Mutex::new(std::collections::HashMap::new()),
            reusable: ArrayQueue::new(RECLAMATION_CAPACITY),
            freeable: ArrayQueue::new(RECLAMATION_CAPACITY),
            shutdown: AtomicBool::new(false),
        });

        let reclaimer_inner = inner.clone();
        let reclaimer = thread::Builder::new()
            .name("work-monitor".to_string())
            .spawn(move || reclamation_loop(reclaimer_inner))
            .expect("failed to spawn work monitor thread");

        WorkMonitor {
            inner,
            reclaimer: Some(reclaimer),
        }
    }

    /// A cloneable handle other threads use to record work.
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Takes a structured snapshot of every thread's current stack.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let stacks = self.inner.stacks.lock().unwrap();
        MonitorSnapshot {
            threads: stacks
                .iter()
                .map(|(name, stack)| (name.clone(), stack.clone()))
                .collect(),
        }
    }
}

impl Drop for WorkMonitor {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reclaimer.take() {
            let _ = handle.join();
        }
    }
}

impl MonitorHandle {
    /// Registers the calling thread's base stack entry. Idempotent if
    /// called more than once for the same thread name.
    pub fn register_thread(&self, detail: impl Into<String>) {
        let name = current_thread_name();
        let mut stacks = self.inner.stacks.lock().unwrap();
        stacks.entry(name.clone()).or_insert_with(|| {
            vec![WorkDescription {
                kind: WorkKind::Thread,
                thread_name: name,
                detail: detail.into(),
            }]
        });
    }

    /// Pushes a handler description onto the calling thread's stack,
    /// reusing a recycled node if one is available. Returns a guard that
    /// pops it back off on drop (distilled §4.7: "pushHandler/popHandler
    /// are strictly LIFO on a single thread").
    pub fn push_handler(&self) -> HandlerScope {
        self.push_handler_detail("handler")
    }

    /// As [`Self::push_handler`], with an explicit detail string (e.g. a
    /// handler type name) for the snapshot.
    pub fn push_handler_detail(&self, detail: impl Into<String>) -> HandlerScope {
        let name = current_thread_name();
        let description = self.inner.reusable.pop().map(|mut reused| {
            reused.kind = WorkKind::Handler;
            reused.thread_name = name.clone();
            reused.detail = detail.into();
            reused
        }).unwrap_or_else(|| WorkDescription {
            kind: WorkKind::Handler,
            thread_name: name.clone(),
            detail: detail.into(),
        });

        let mut stacks = self.inner.stacks.lock().unwrap();
        stacks.entry(name.clone()).or_default().push(description);

        HandlerScope {
            inner: self.inner.clone(),
            thread_name: name,
        }
    }
}

fn current_thread_name() -> String {
    thread::current()
        .name()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{:?}", thread::current().id()))
}

fn reclamation_loop(inner: Arc<Inner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        let mut drained_any = false;
        while let Some(description) = inner.freeable.pop() {
            drained_any = true;
            debug!(thread = %description.thread_name, detail = %description.detail, "reclaiming work description");
            // Recycle the node rather than actually dropping it, bounded
            // by the reusable queue's capacity; if it's full the node is
            // simply dropped.
            let _ = inner.reusable.push(description);
        }

        if !drained_any {
            thread::sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drop_pops_handler() {
        let monitor = WorkMonitor::start();
        let handle = monitor.handle();
        handle.register_thread("test-thread");

        {
            let _scope = handle.push_handler_detail("unit-test-handler");
            let snapshot = monitor.snapshot();
            let (_, stack) = snapshot
                .threads
                .iter()
                .find(|(name, _)| name == &current_thread_name())
                .unwrap();
            assert!(stack.iter().any(|d| d.kind == WorkKind::Handler));
        }

        let snapshot = monitor.snapshot();
        let (_, stack) = snapshot
            .threads
            .iter()
            .find(|(name, _)| name == &current_thread_name())
            .unwrap();
        assert!(!stack.iter().any(|d| d.kind == WorkKind::Handler));
    }

    #[test]
    fn stacks_are_strictly_lifo() {
        let monitor = WorkMonitor::start();
        let handle = monitor.handle();

        let first = handle.push_handler_detail("first");
        let second = handle.push_handler_detail("second");
        drop(second);
        drop(first);

        let snapshot = monitor.snapshot();
        let (_, stack) = snapshot
            .threads
            .iter()
            .find(|(name, _)| name == &current_thread_name())
            .unwrap();
        assert!(stack.iter().all(|d| d.kind != WorkKind::Handler));
    }
}
