//! VM error types

use thiserror::Error;

/// Diagnostic kinds delivered to the host error callback.
///
/// `StackTraceBegin` / `StackTrace` / `StackTraceEnd` frame a runtime-error
/// trace (one begin, many trace lines each with its own line number, one end)
/// and are never returned from API functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No error.
    None,
    /// The allocator could not satisfy a request.
    OutOfMemory,
    /// A runtime invariant was violated while executing bytecode.
    Runtime,
    /// The lexer rejected the source text.
    Lexer,
    /// The parser rejected the source text.
    Compile,
    /// A function was called with the wrong number of arguments.
    ArityMismatch,
    /// A module with the same name already exists.
    ModuleAlreadyDefined,
    /// The module resolver produced no source for a name.
    ModuleNotFound,
    /// An operation was applied to a value of the wrong kind.
    InvalidOpOnType,
    /// An API argument was out of range.
    InvalidArgument,
    /// Start of a runtime-error stack trace.
    StackTraceBegin,
    /// One stack trace line.
    StackTrace,
    /// End of a runtime-error stack trace.
    StackTraceEnd,
}

/// Errors returned from VM API functions.
///
/// This is the closed returnable subset of [`ErrorKind`]; the stack-trace
/// framing kinds only ever travel through the error callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    /// The allocator could not satisfy a request.
    #[error("out of memory")]
    OutOfMemory,
    /// A runtime invariant was violated; the frame stack has been unwound.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// The lexer rejected the source text.
    #[error("lexer error: {0}")]
    Lexer(String),
    /// One or more compile errors were reported through the error callback.
    #[error("compile error: {0}")]
    Compile(String),
    /// A host-initiated call passed the wrong number of arguments.
    #[error("arity mismatch: {0}")]
    ArityMismatch(String),
    /// A module with this name already exists.
    #[error("module already defined: {0}")]
    ModuleAlreadyDefined(String),
    /// No module source could be resolved for this name.
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// An operation was applied to a value of the wrong kind.
    #[error("invalid operation on type: {0}")]
    InvalidOpOnType(String),
    /// An API argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VmError {
    /// The [`ErrorKind`] this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::OutOfMemory => ErrorKind::OutOfMemory,
            VmError::Runtime(_) => ErrorKind::Runtime,
            VmError::Lexer(_) => ErrorKind::Lexer,
            VmError::Compile(_) => ErrorKind::Compile,
            VmError::ArityMismatch(_) => ErrorKind::ArityMismatch,
            VmError::ModuleAlreadyDefined(_) => ErrorKind::ModuleAlreadyDefined,
            VmError::ModuleNotFound(_) => ErrorKind::ModuleNotFound,
            VmError::InvalidOpOnType(_) => ErrorKind::InvalidOpOnType,
            VmError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(VmError::OutOfMemory.kind(), ErrorKind::OutOfMemory);
        assert_eq!(VmError::Runtime("x".into()).kind(), ErrorKind::Runtime);
        assert_eq!(
            VmError::ModuleAlreadyDefined("m".into()).kind(),
            ErrorKind::ModuleAlreadyDefined
        );
    }
}
