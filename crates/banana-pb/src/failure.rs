//! Serialized failures carried by `error` responses.
//!
//! On the wire a failure is one STRING:
//!
//! ```text
//! <type>: <message>
//!
//! Traceback:
//! <text>
//! ```
//!
//! The traceback section is only present when the serving broker has
//! unsafe tracebacks enabled.

use banana_core::Violation;
use thiserror::Error;

const TRACEBACK_MARKER: &str = "\n\nTraceback:\n";

/// A failure raised while servicing a call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{type_name}: {message}")]
pub struct Failure {
    /// Kind of failure, for example `"ValueError"` or `"Violation"`
    pub type_name: String,
    /// Human readable description
    pub message: String,
    /// Extra diagnostic text, only sent with unsafe tracebacks
    pub traceback: Option<String>,
}

impl Failure {
    /// Create a failure without a traceback.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), message: message.into(), traceback: None }
    }

    /// Attach diagnostic text.
    #[must_use]
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Failure describing a schema violation. The location is diagnostic
    /// detail and travels as the traceback.
    pub fn from_violation(violation: &Violation) -> Self {
        let failure = Self::new("Violation", violation.message());
        match violation.location() {
            Some(location) => failure.with_traceback(format!("at {location}")),
            None => failure,
        }
    }

    /// Wire form.
    pub fn to_wire(&self, include_traceback: bool) -> String {
        match (&self.traceback, include_traceback) {
            (Some(traceback), true) => {
                format!("{}: {}{TRACEBACK_MARKER}{traceback}", self.type_name, self.message)
            },
            _ => format!("{}: {}", self.type_name, self.message),
        }
    }

    /// Parse the wire form. Text without a `type: ` prefix becomes an
    /// untyped failure.
    pub fn from_wire(text: &str) -> Self {
        let (head, traceback) = match text.split_once(TRACEBACK_MARKER) {
            Some((head, traceback)) => (head, Some(traceback.to_string())),
            None => (text, None),
        };
        let (type_name, message) = match head.split_once(": ") {
            Some((type_name, message)) if !type_name.contains(char::is_whitespace) => {
                (type_name.to_string(), message.to_string())
            },
            _ => ("Failure".to_string(), head.to_string()),
        };
        Self { type_name, message, traceback }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_only_when_enabled() {
        let failure = Failure::new("ValueError", "bad input").with_traceback("line 3");
        assert_eq!(failure.to_wire(false), "ValueError: bad input");
        assert_eq!(failure.to_wire(true), "ValueError: bad input\n\nTraceback:\nline 3");
    }

    #[test]
    fn wire_form_parses_back() {
        let failure = Failure::new("KeyError", "missing: a").with_traceback("frame");
        assert_eq!(Failure::from_wire(&failure.to_wire(true)), failure);
        let plain = Failure::from_wire(&failure.to_wire(false));
        assert_eq!(plain.type_name, "KeyError");
        assert_eq!(plain.message, "missing: a");
        assert_eq!(plain.traceback, None);
    }

    #[test]
    fn untyped_text() {
        let failure = Failure::from_wire("something broke");
        assert_eq!(failure.type_name, "Failure");
        assert_eq!(failure.message, "something broke");
    }

    #[test]
    fn violation_location_is_traceback() {
        let violation = Violation::new("too long").at("root.call.list");
        let failure = Failure::from_violation(&violation);
        assert_eq!(failure.to_wire(false), "Violation: too long");
        assert_eq!(failure.traceback.as_deref(), Some("at root.call.list"));
    }
}
