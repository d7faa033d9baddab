//! Error types for the agent runtime.
//!
//! Two families live here: [`Error`] covers lifecycle and programmer errors
//! raised synchronously by the cluster/scheduler surface, and [`ScriptError`]
//! is the value-level representation of an exception thrown by engine code.

use crate::runtime::host::HostShared;
use deno_core::v8;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the cluster, scheduler and dispatch plumbing.
#[derive(Debug, Error)]
pub enum Error {
    #[error("scheduler is closed")]
    SchedulerClosed,

    #[error("scheduler handle already has a running thread")]
    AlreadyRunning,

    #[error("failed to spawn host thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dispatcher for a pending result went away without delivering one.
    #[error("result was abandoned before it was dispatched")]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an engine exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
    /// A non-`Error` value was thrown.
    Thrown,
    /// Execution was interrupted through `Agent::terminate`.
    Terminated,
    /// The isolate reached its heap limit; its host is being disposed.
    MemoryLimit,
    /// The result could not be transferred out of the engine.
    Conversion,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Error => "error",
            ErrorKind::EvalError => "eval_error",
            ErrorKind::RangeError => "range_error",
            ErrorKind::ReferenceError => "reference_error",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::TypeError => "type_error",
            ErrorKind::UriError => "uri_error",
            ErrorKind::Thrown => "thrown",
            ErrorKind::Terminated => "terminated",
            ErrorKind::MemoryLimit => "memory_limit",
            ErrorKind::Conversion => "conversion",
        }
    }

    /// Map a native error constructor name onto a kind. Unknown names
    /// (user subclasses) fall back to [`ErrorKind::Error`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "EvalError" => ErrorKind::EvalError,
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            "TypeError" => ErrorKind::TypeError,
            "URIError" => ErrorKind::UriError,
            _ => ErrorKind::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exception captured at the boundary between host code and the engine.
///
/// Compile, run and evaluate helpers return this instead of unwinding, so a
/// throwing script never takes down the host thread.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{name}: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn terminated() -> Self {
        Self::new(
            ErrorKind::Terminated,
            "Terminated",
            "execution was terminated",
        )
    }

    pub fn memory_limit() -> Self {
        Self::new(
            ErrorKind::MemoryLimit,
            "RangeError",
            "isolate was disposed because it exceeded its memory limit",
        )
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conversion, "ConversionError", message)
    }

    /// Build an error from the state of a `TryCatch` after a failed engine call.
    ///
    /// A pending termination is cancelled here so the isolate stays usable for
    /// the next task, unless the host ran out of heap.
    pub(crate) fn from_try_catch(tc: &mut v8::TryCatch<v8::HandleScope>) -> Self {
        if tc.has_terminated() {
            let exceeded = tc
                .get_slot::<Arc<HostShared>>()
                .is_some_and(|host| host.memory_exceeded());
            if exceeded {
                return Self::memory_limit();
            }
            tc.cancel_terminate_execution();
            return Self::terminated();
        }
        match tc.exception() {
            Some(exception) => Self::from_exception(tc, exception),
            None => Self::new(ErrorKind::Error, "Error", "unknown engine failure"),
        }
    }

    pub(crate) fn from_exception<'s>(
        scope: &mut v8::HandleScope<'s>,
        exception: v8::Local<'s, v8::Value>,
    ) -> Self {
        if !exception.is_native_error() {
            let message = exception.to_rust_string_lossy(scope);
            return Self::new(ErrorKind::Thrown, "Error", message);
        }

        let Some(object) = exception.to_object(scope) else {
            return Self::new(ErrorKind::Error, "Error", exception.to_rust_string_lossy(scope));
        };
        let name = read_string_property(scope, object, "name").unwrap_or_else(|| "Error".into());
        let message = read_string_property(scope, object, "message").unwrap_or_default();
        let stack = read_string_property(scope, object, "stack");

        Self {
            kind: ErrorKind::from_name(&name),
            name,
            message,
            stack,
        }
    }
}

fn read_string_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    key: &str,
) -> Option<String> {
    let key = v8::String::new(scope, key)?;
    let value = object.get(scope, key.into())?;
    if value.is_undefined() {
        return None;
    }
    Some(value.to_rust_string_lossy(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(ErrorKind::TypeError.as_str(), "type_error");
        assert_eq!(ErrorKind::UriError.as_str(), "uri_error");
        assert_eq!(ErrorKind::Terminated.to_string(), "terminated");
        assert_eq!(ErrorKind::MemoryLimit.as_str(), "memory_limit");
    }

    #[test]
    fn test_error_kind_from_name() {
        assert_eq!(ErrorKind::from_name("TypeError"), ErrorKind::TypeError);
        assert_eq!(ErrorKind::from_name("URIError"), ErrorKind::UriError);
        assert_eq!(ErrorKind::from_name("ValidationError"), ErrorKind::Error);
    }

    #[test]
    fn test_script_error_display() {
        let err = ScriptError::new(ErrorKind::RangeError, "RangeError", "out of bounds");
        assert_eq!(err.to_string(), "RangeError: out of bounds");
        assert!(err.stack.is_none());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::SchedulerClosed.to_string(), "scheduler is closed");
        let err = Error::InvalidConfig("bad heap".into());
        assert_eq!(err.to_string(), "invalid configuration: bad heap");
    }
}
