//! `AsyncJobManager`: registry of detached jobs by id (distilled spec
//! §4.6).
//!
//! New module; no direct teacher counterpart. Uses `std::sync::Mutex` +
//! `BTreeMap` (ordered by id, which doubles as creation order) and an
//! `AtomicU64` id generator, consistent with the teacher's general
//! preference for `std::sync` primitives over pulling in a concurrent-map
//! crate for something this small.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Status of a detached job, per distilled §3's `AsyncJobEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncJobStatus {
    /// Submitted, not yet finished.
    Pending,
    /// Finished successfully; `result` carries the serialized response.
    Done,
    /// Finished with an error; `result` carries the serialized error
    /// response.
    Error,
    /// Cancelled before or during execution.
    Cancelled,
}

#[derive(Debug, Clone)]
struct AsyncJobEntry {
    status: AsyncJobStatus,
    result: Option<Vec<u8>>,
    created_at: Instant,
    fetched: bool,
}

/// What `fetch` reports to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The job finished; this is its (now removed) result.
    Ready(Vec<u8>, AsyncJobStatus),
    /// The job is still running.
    Pending,
    /// No such id (never existed, expired, evicted, or already fetched).
    Unknown,
}

/// Registry mapping a 64-bit monotonic job id to its [`AsyncJobEntry`].
#[derive(Debug)]
pub struct AsyncJobManager {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, AsyncJobEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl AsyncJobManager {
    /// Builds an empty registry with the given TTL and capacity
    /// (distilled §6 configuration: `asyncJobTTL`, `asyncJobCapacity`).
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        AsyncJobManager {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
            ttl,
            capacity,
        }
    }

    /// Allocates a new, process-lifetime-unique id and registers it as
    /// `pending` (distilled §4.6: `put(id) = pending` on submission).
    pub fn allocate(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id,
            AsyncJobEntry {
                status: AsyncJobStatus::Pending,
                result: None,
                created_at: Instant::now(),
                fetched: false,
            },
        );
        self.enforce_capacity(&mut entries);
        id
    }

    /// Atomically replaces a pending entry with a finished one. A no-op if
    /// the entry was already marked `Cancelled`: distilled §8's "pending
    /// -> (done|error|cancelled) exactly once" means a cancellation that
    /// lands first must stick even if the job goes on to finish naturally.
    pub fn finish(&self, id: u64, status: AsyncJobStatus, result: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            if entry.status == AsyncJobStatus::Cancelled {
                return;
            }
            entry.status = status;
            entry.result = Some(result);
        }
    }

    /// Peeks at an entry's status without removing it.
    pub fn poll(&self, id: u64) -> Option<AsyncJobStatus> {
        self.entries.lock().unwrap().get(&id).map(|e| e.status.clone())
    }

    /// Atomic test-and-remove: returns the result if the job is finished,
    /// `Pending` if not, `Unknown` if the id never existed / already was
    /// fetched / was evicted (distilled §8: "second fetch returns
    /// unknown").
    pub fn fetch(&self, id: u64) -> FetchOutcome {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            None => FetchOutcome::Unknown,
            Some(entry) if matches!(entry.status, AsyncJobStatus::Pending) => FetchOutcome::Pending,
            Some(_) => {
                let entry = entries.remove(&id).unwrap();
                FetchOutcome::Ready(entry.result.unwrap_or_default(), entry.status)
            }
        }
    }

    /// Marks a job cancelled. The caller is responsible for separately
    /// invoking `Handler::cancel` on the executing `Job` (distilled
    /// §4.6: "cancel(id): mark cancelled, propagate to executing Job via
    /// its Handler's cancel").
    pub fn cancel(&self, id: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            entry.status = AsyncJobStatus::Cancelled;
        }
    }

    /// Drops entries older than the configured TTL. Intended to be
    /// invoked periodically by a dedicated sweep thread/timer.
    pub fn sweep_expired(&self) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let ttl = self.ttl;
        entries.retain(|id, entry| {
            let expired = now.duration_since(entry.created_at) > ttl;
            if expired {
                warn!(job_id = id, "async job entry expired before being fetched");
            }
            !expired
        });
    }

    /// Evicts the oldest pending-not-fetched entry(ies) once `capacity`
    /// is exceeded (distilled open-question resolution: oldest
    /// pending-not-fetched entries beyond cap evict with a warning).
    /// Already-fetched or finished entries are preferred eviction
    /// candidates since a client has either already retrieved them or
    /// can be told `unknown` without losing information it hadn't yet
    /// seen.
    fn enforce_capacity(&self, entries: &mut BTreeMap<u64, AsyncJobEntry>) {
        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .min_by_key(|(id, entry)| (!matches!(entry.status, AsyncJobStatus::Pending), **id))
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    warn!(job_id = id, "evicting async job entry, capacity exceeded");
                    entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_poll_fetch_round_trip() {
        let manager = AsyncJobManager::new(Duration::from_secs(60), 16);
        let id = manager.allocate();
        assert_eq!(Some(AsyncJobStatus::Pending), manager.poll(id));

        manager.finish(id, AsyncJobStatus::Done, b"result".to_vec());
        assert_eq!(
            FetchOutcome::Ready(b"result".to_vec(), AsyncJobStatus::Done),
            manager.fetch(id)
        );
        assert_eq!(FetchOutcome::Unknown, manager.fetch(id));
    }

    #[test]
    fn cancel_marks_status() {
        let manager = AsyncJobManager::new(Duration::from_secs(60), 16);
        let id = manager.allocate();
        manager.cancel(id);
        assert_eq!(Some(AsyncJobStatus::Cancelled), manager.poll(id));
    }

    #[test]
    fn finish_does_not_revert_a_cancelled_entry() {
        let manager = AsyncJobManager::new(Duration::from_secs(60), 16);
        let id = manager.allocate();
        manager.cancel(id);
        manager.finish(id, AsyncJobStatus::Done, b"too late".to_vec());
        assert_eq!(Some(AsyncJobStatus::Cancelled), manager.poll(id));
    }

    #[test]
    fn capacity_evicts_oldest_pending_first() {
        let manager = AsyncJobManager::new(Duration::from_secs(60), 2);
        let first = manager.allocate();
        let _second = manager.allocate();
        let _third = manager.allocate();

        // `first` was the oldest pending entry; it should have been
        // evicted to keep the registry at capacity 2.
        assert_eq!(FetchOutcome::Unknown, manager.fetch(first));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let manager = AsyncJobManager::new(Duration::from_millis(1), 16);
        let id = manager.allocate();
        std::thread::sleep(Duration::from_millis(5));
        manager.sweep_expired();
        assert_eq!(None, manager.poll(id));
    }
}
