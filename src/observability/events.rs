//! Observable events for aerorepo
//!
//! Every lifecycle point of the live pipeline, the reference cache and the
//! one-shot query path is named here. Events are explicit and typed.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Live statements
    /// A backend live subscription was created for a statement
    LiveSubscribed,
    /// The last subscriber left and the backend subscription was torn down
    LiveUnsubscribed,
    /// A transient backend error triggered a resubscribe
    LiveRetry,
    /// Retries exhausted or a terminal error reached subscribers
    LiveFailed,

    // Merge engine
    /// The initial snapshot of a live query has been replayed
    InitialReplayComplete,
    /// A debounced batch was handed downstream
    BatchFlushed,

    // Referenced objects
    /// A class-level change listener was created
    ClassListenerCreated,
    /// A class-level change listener was released and unsubscribed
    ClassListenerReleased,
    /// A referenced entity was loaded from the backend
    ReferenceLoaded,
    /// A cached reference was invalidated
    ReferenceInvalidated,

    // One-shot operations
    /// A one-shot query or aggregate completed
    QueryExecuted,
    /// A write operation completed
    WriteExecuted,
    /// A write was rejected because of a concurrent modification
    WriteConflict,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::LiveSubscribed => "LIVE_SUBSCRIBED",
            Event::LiveUnsubscribed => "LIVE_UNSUBSCRIBED",
            Event::LiveRetry => "LIVE_RETRY",
            Event::LiveFailed => "LIVE_FAILED",
            Event::InitialReplayComplete => "INITIAL_REPLAY_COMPLETE",
            Event::BatchFlushed => "BATCH_FLUSHED",
            Event::ClassListenerCreated => "CLASS_LISTENER_CREATED",
            Event::ClassListenerReleased => "CLASS_LISTENER_RELEASED",
            Event::ReferenceLoaded => "REFERENCE_LOADED",
            Event::ReferenceInvalidated => "REFERENCE_INVALIDATED",
            Event::QueryExecuted => "QUERY_COMPLETE",
            Event::WriteExecuted => "WRITE_COMPLETE",
            Event::WriteConflict => "WRITE_CONFLICT",
        }
    }

    /// Default severity for this event
    pub fn severity(&self) -> Severity {
        match self {
            Event::LiveRetry | Event::WriteConflict => Severity::Warn,
            Event::LiveFailed => Severity::Error,
            Event::LiveSubscribed
            | Event::LiveUnsubscribed
            | Event::ClassListenerCreated
            | Event::ClassListenerReleased => Severity::Info,
            _ => Severity::Trace,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
