#![forbid(unsafe_code)]

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// A line-granular source position. Line numbers start at one; a negative
/// line means the location is past the end of the file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub filename: String,
    pub line: i64,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, line: i64) -> Self {
        SourceLocation {
            filename: filename.into(),
            line,
        }
    }

    pub fn eof(filename: impl Into<String>) -> Self {
        SourceLocation {
            filename: filename.into(),
            line: -1,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line < 0 {
            write!(f, "{}: EOF", self.filename)
        } else {
            write!(f, "{}:{}", self.filename, self.line)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorMessage {
    pub location: SourceLocation,
    pub message: String,
    pub activity: String,
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)?;
        if !self.activity.is_empty() {
            write!(f, " ({})", self.activity)?;
        }
        Ok(())
    }
}

/// A failure of the compiler itself (missing file, malformed FFI
/// descriptor, absent runtime sources) rather than of the user's program.
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(eyot::internal))]
pub struct InternalError {
    pub message: String,
}

/// Accumulator for located diagnostics plus a single internal-error slot.
///
/// Passed by mutable reference through every pass. Producers set the
/// current location (the lexer tags each token, the parser and analyzer
/// interleave dummy nodes) and then report plain messages against it.
#[derive(Debug, Default)]
pub struct Errors {
    messages: Vec<ErrorMessage>,
    last_location: SourceLocation,
    internal: Option<InternalError>,
    activity: String,
}

impl Errors {
    pub fn new() -> Self {
        Errors::default()
    }

    pub fn set_activity(&mut self, activity: impl Into<String>) {
        self.activity = activity.into();
    }

    pub fn set_location(&mut self, location: SourceLocation) {
        self.last_location = location;
    }

    pub fn report(&mut self, message: impl Into<String>) {
        self.messages.push(ErrorMessage {
            location: self.last_location.clone(),
            message: message.into(),
            activity: self.activity.clone(),
        });
    }

    pub fn log_internal(&mut self, message: impl Into<String>) {
        self.internal = Some(InternalError {
            message: message.into(),
        });
    }

    pub fn internal_error(&self) -> Option<&InternalError> {
        self.internal.as_ref()
    }

    pub fn clean(&self) -> bool {
        self.internal.is_none() && self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ErrorMessage] {
        &self.messages
    }

    /// Render the human-readable diagnostic lines, one per message.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in &self.messages {
            out.push_str(&m.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_renders_file_and_line() {
        let loc = SourceLocation::new("main", 12);
        assert_eq!(loc.to_string(), "main:12");
    }

    #[test]
    fn eof_location_renders_eof() {
        let loc = SourceLocation::eof("main");
        assert_eq!(loc.to_string(), "main: EOF");
    }

    #[test]
    fn reported_errors_carry_the_last_location() {
        let mut es = Errors::new();
        es.set_location(SourceLocation::new("mod", 3));
        es.report("bad thing");
        assert!(!es.clean());
        assert_eq!(es.render(), "mod:3: bad thing\n");
    }

    #[test]
    fn internal_errors_make_the_collector_dirty() {
        let mut es = Errors::new();
        assert!(es.clean());
        es.log_internal("file not found");
        assert!(!es.clean());
        assert!(es.internal_error().is_some());
    }
}
