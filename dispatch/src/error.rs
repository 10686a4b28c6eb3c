//! Error taxonomy (distilled spec §7).
//!
//! Every error a [`crate::job::Job`] can produce is captured here and
//! translated into a [`wire::Status`] before it ever reaches a `CommTask`;
//! nothing propagates back to an event-loop thread as a raw error.

use thiserror::Error;

/// The six error categories from distilled spec §7.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transient backpressure: a queue was full, or a resource was busy.
    /// Does not kill the connection; produces a retry-hint response.
    #[error("transient: {0}")]
    Transient(#[from] TransientError),

    /// Malformed or disallowed request. 4xx; connection may continue on
    /// keep-alive.
    #[error("client protocol error: {0}")]
    ClientProtocol(#[from] wire::ParseError),

    /// Handler-defined failure (not-found, conflict, forbidden, unique
    /// constraint violation, ...). Connection continues.
    #[error("handler error: {message}")]
    Handler {
        /// Status the handler wants surfaced to the client.
        status: wire::Status,
        /// Human-readable detail, not necessarily sent to the client.
        message: String,
    },

    /// The client (or an operator) cancelled the job before or during
    /// execution.
    #[error("cancelled")]
    Cancelled,

    /// A bug, or an unexpected condition the handler could not account
    /// for. 5xx; connection closes after the response is written.
    #[error("internal error: {0}")]
    Internal(String),

    /// Fatal: the event loop or dispatcher worker thread cannot continue.
    /// Propagates to terminate the affected thread; the process may
    /// continue with reduced capacity.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Backpressure-specific transient failures.
#[derive(Debug, Error, Clone, Copy)]
pub enum TransientError {
    /// The target `DispatcherQueue` was at capacity.
    #[error("queue full")]
    QueueFull,
    /// The target queue does not exist (misconfigured handler).
    #[error("no such queue")]
    NoSuchQueue,
    /// `config::ServerConfig::max_chunked_tasks` simultaneously streaming
    /// responses are already in flight.
    #[error("too many chunked responses in flight")]
    ChunkedCapacity,
}

impl DispatchError {
    /// Maps this error to the status code a `CommTask` should write back
    /// to the client, per distilled spec §4.9/§7. `None` means "do not
    /// write a response" (e.g. the connection is already gone).
    pub fn status_hint(&self) -> Option<wire::Status> {
        use wire::Status;
        Some(match self {
            DispatchError::Transient(_) => Status::ServiceUnavailable,
            DispatchError::ClientProtocol(_) => Status::BadRequest,
            DispatchError::Handler { status, .. } => *status,
            DispatchError::Cancelled => Status::ClientClosedRequest,
            DispatchError::Internal(_) => Status::InternalServerError,
            DispatchError::Fatal(_) => return None,
        })
    }

    /// Whether the connection must close after this error's response is
    /// written (distilled §7 category 5).
    pub fn closes_connection(&self) -> bool {
        matches!(self, DispatchError::Internal(_) | DispatchError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::Status;

    #[test]
    fn transient_maps_to_503() {
        let err = DispatchError::Transient(TransientError::QueueFull);
        assert_eq!(Some(Status::ServiceUnavailable), err.status_hint());
        assert!(!err.closes_connection());
    }

    #[test]
    fn internal_closes_connection() {
        let err = DispatchError::Internal("panic in handler".into());
        assert!(err.closes_connection());
        assert_eq!(Some(Status::InternalServerError), err.status_hint());
    }

    #[test]
    fn fatal_has_no_status_hint() {
        let err = DispatchError::Fatal("allocation failure during teardown".into());
        assert_eq!(None, err.status_hint());
    }
}
