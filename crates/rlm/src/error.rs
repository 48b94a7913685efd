use thiserror::Error;

/// Failure kinds surfaced by the sandbox. `Syntax` through `Attribute` mirror
/// the exception classes user code can raise and catch; the resource kinds
/// cannot be caught from inside the sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Value,
    Key,
    Index,
    ZeroDivision,
    Attribute,
    ImportForbidden,
    Timeout,
    StepLimit,
    RecursionLimit,
    MemoryLimit,
    Other,
}

impl ErrorKind {
    /// The exception-class name user code sees, e.g. in `except ValueError:`.
    pub fn class_name(self) -> &'static str {
        match self {
            Self::Syntax => "SyntaxError",
            Self::Name => "NameError",
            Self::Type => "TypeError",
            Self::Value => "ValueError",
            Self::Key => "KeyError",
            Self::Index => "IndexError",
            Self::ZeroDivision => "ZeroDivisionError",
            Self::Attribute => "AttributeError",
            Self::ImportForbidden => "ImportError",
            Self::Timeout => "ExecutionTimeout",
            Self::StepLimit => "StepLimitExceeded",
            Self::RecursionLimit => "RecursionLimit",
            Self::MemoryLimit => "MemoryLimit",
            Self::Other => "RuntimeError",
        }
    }

    /// Resource-cap and syntax failures are not interceptable by `except`.
    pub fn catchable(self) -> bool {
        !matches!(
            self,
            Self::Syntax
                | Self::Timeout
                | Self::StepLimit
                | Self::RecursionLimit
                | Self::MemoryLimit
                | Self::ImportForbidden
        )
    }
}

/// A sandbox failure: one kind plus a single-line human message. Formats as
/// `ClassName: message`, which is exactly what the agent loop feeds back to
/// the model and records as a `repl_error` event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", kind.class_name())]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.contains('\n') {
            message = message.replace('\n', " ");
        }
        Self { kind, message }
    }

    pub fn syntax(line: usize, col: usize, message: impl AsRef<str>) -> Self {
        Self::new(
            ErrorKind::Syntax,
            format!("{} (line {line}, column {col})", message.as_ref()),
        )
    }

    pub fn name(name: &str) -> Self {
        Self::new(ErrorKind::Name, format!("name '{name}' is not defined"))
    }

    pub fn type_err(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_err(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn import_forbidden() -> Self {
        Self::new(
            ErrorKind::ImportForbidden,
            "__import__ not found; imports are disabled (re, json, base64, binascii and zlib \
             are already bound)",
        )
    }

    /// Maps a class name from a `raise`/`except` clause back to a kind.
    pub fn kind_for_class(name: &str) -> Option<ErrorKind> {
        match name {
            "ValueError" => Some(ErrorKind::Value),
            "TypeError" => Some(ErrorKind::Type),
            "KeyError" => Some(ErrorKind::Key),
            "IndexError" => Some(ErrorKind::Index),
            "RuntimeError" => Some(ErrorKind::Other),
            "ZeroDivisionError" => Some(ErrorKind::ZeroDivision),
            "NameError" => Some(ErrorKind::Name),
            "AttributeError" => Some(ErrorKind::Attribute),
            _ => None,
        }
    }
}

pub type ExecResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_single_line() {
        let err = ExecutionError::new(ErrorKind::Value, "bad\nvalue");
        assert_eq!(err.to_string(), "ValueError: bad value");
    }

    #[test]
    fn import_error_contains_contract_substring() {
        assert!(
            ExecutionError::import_forbidden()
                .to_string()
                .contains("__import__ not found")
        );
    }

    #[test]
    fn resource_kinds_are_not_catchable() {
        assert!(!ErrorKind::Timeout.catchable());
        assert!(!ErrorKind::StepLimit.catchable());
        assert!(!ErrorKind::MemoryLimit.catchable());
        assert!(!ErrorKind::RecursionLimit.catchable());
        assert!(ErrorKind::Value.catchable());
        assert!(ErrorKind::ZeroDivision.catchable());
    }
}
