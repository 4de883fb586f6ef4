//! Structured error surface shared by the engine, the event log, and replay.
//!
//! The variant is the machine-readable kind; message text is for humans.
//! Programmer errors are not represented here; they abort via
//! [`crate::core::check`].

use std::io;

/// Error kinds surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument failed validation: bad workspace root,
    /// empty identifier, unknown phase string.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An event was emitted or encountered against a terminated run/step,
    /// without its start, or with a duplicate terminal.
    #[error("lifecycle violation: {message}")]
    Lifecycle { message: String },

    /// A phase transition was illegal or a phase exhausted its attempts.
    #[error("ordering violation: {message}")]
    Ordering { message: String },

    /// An artifact path escapes the workspace root.
    #[error("path '{path}' escapes the workspace root")]
    Contained { path: String },

    /// A stored log line failed to parse or violated sequencing.
    #[error("corrupt log at line {line}: {message}")]
    Corruption { line: u64, message: String },

    /// A disk open, write, or flush failed at the OS layer.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// An operation was issued against a closed log or engine.
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        Error::Lifecycle {
            message: message.into(),
        }
    }

    pub(crate) fn ordering(message: impl Into<String>) -> Self {
        Error::Ordering {
            message: message.into(),
        }
    }

    pub(crate) fn contained(path: impl Into<String>) -> Self {
        Error::Contained { path: path.into() }
    }

    pub(crate) fn corruption(line: u64, message: impl Into<String>) -> Self {
        Error::Corruption {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_message_names_the_line() {
        let err = Error::corruption(3, "seq 2 is not strictly increasing");
        assert_eq!(
            err.to_string(),
            "corrupt log at line 3: seq 2 is not strictly increasing"
        );
    }

    #[test]
    fn io_error_preserves_source() {
        let err = Error::io(
            "write event",
            io::Error::new(io::ErrorKind::StorageFull, "no space"),
        );
        assert!(err.to_string().starts_with("write event"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
