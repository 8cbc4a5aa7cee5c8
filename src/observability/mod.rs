//! Observability for aerorepo
//!
//! - Structured logging (JSON lines)
//! - Typed lifecycle events
//!
//! Observability is read-only: a failed or suppressed log line never
//! changes the outcome of a query, a write or a live subscription.
//!
//! # Usage
//!
//! ```ignore
//! use aerorepo::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::LiveRetry, &[("attempt", "3")]);
//! ```

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};

/// Log a lifecycle event at its default severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields at its default severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::LiveSubscribed);
        log_event(Event::BatchFlushed);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(Event::ReferenceLoaded, &[("identity", "#12:0")]);
    }
}
