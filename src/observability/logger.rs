//! JSON-lines logger
//!
//! Each record is one line: `event`, `severity` and `ts` first, then the
//! caller's fields sorted by key. Records below the process-wide minimum
//! severity are dropped before anything is formatted.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

/// Record severity, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Error,
    Fatal,
}

const LEVELS: [Severity; 5] = [
    Severity::Trace,
    Severity::Info,
    Severity::Warn,
    Severity::Error,
    Severity::Fatal,
];

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MIN_SEVERITY: AtomicU8 = AtomicU8::new(Severity::Info as u8);

/// Process-wide structured logger
pub struct Logger;

impl Logger {
    pub fn set_min_severity(severity: Severity) {
        MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        let level = MIN_SEVERITY.load(Ordering::Relaxed) as usize;
        LEVELS.get(level).copied().unwrap_or(Severity::Fatal)
    }

    pub fn enabled(severity: Severity) -> bool {
        severity >= Self::min_severity()
    }

    /// Write one record; warnings and worse go to stderr.
    ///
    /// A failed write is ignored.
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        let line = render(severity, event, fields);
        let _ = if severity >= Severity::Warn {
            io::stderr().lock().write_all(line.as_bytes())
        } else {
            io::stdout().lock().write_all(line.as_bytes())
        };
    }
}

fn quoted(text: &str) -> String {
    Value::from(text).to_string()
}

/// One JSON object terminated by a newline
pub(crate) fn render(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
    sorted.sort_by_key(|(key, _)| *key);

    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!(
        "{{\"event\":{},\"severity\":\"{}\",\"ts\":\"{}\"",
        quoted(event),
        severity,
        ts
    );
    for (key, value) in sorted {
        line.push(',');
        line.push_str(&quoted(key));
        line.push(':');
        line.push_str(&quoted(value));
    }
    line.push_str("}\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_one_json_line() {
        let line = render(Severity::Info, "LIVE_SUBSCRIBED", &[("entity", "Product")]);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "LIVE_SUBSCRIBED");
        assert_eq!(parsed["severity"], "INFO");
        assert_eq!(parsed["entity"], "Product");
        assert!(parsed["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_fields_follow_header_sorted() {
        let line = render(
            Severity::Warn,
            "LIVE_RETRY",
            &[("statement", "1"), ("attempt", "2"), ("entity", "3")],
        );
        let position = |key: &str| line.find(&format!("\"{}\"", key)).unwrap();
        assert!(position("event") < position("severity"));
        assert!(position("ts") < position("attempt"));
        assert!(position("attempt") < position("entity"));
        assert!(position("entity") < position("statement"));
    }

    #[test]
    fn test_values_are_escaped() {
        let line = render(Severity::Warn, "TEST", &[("message", "said \"no\"\nretrying")]);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["message"], "said \"no\"\nretrying");
    }

    #[test]
    fn test_default_minimum_is_info() {
        assert!(!Logger::enabled(Severity::Trace));
        assert!(Logger::enabled(Severity::Warn));
        assert_eq!(LEVELS[Severity::Error as usize], Severity::Error);
    }
}
