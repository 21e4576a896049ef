use crate::language::{
    errors::SyntaxErrors,
    span::{LineIndex, Location},
};
use crate::runtime::debugger::CallStackEntry;
use crate::runtime::environment::ScopeError;
use miette::Diagnostic;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Clone, Debug, Error)]
pub enum RuntimeError {
    #[error("Unknown symbol `{name}`")]
    UnknownSymbol { name: String },
    #[error("Constant `{name}` cannot be reassigned")]
    ImmutableBinding { name: String },
    #[error("Assignment to undeclared variable `{name}`")]
    UndeclaredAssignment { name: String },
    #[error("`{name}` is already declared")]
    DuplicateDeclaration { name: String },
    #[error("Type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("Operation not supported: {message}")]
    Unsupported { message: String },
    #[error("Modulo by zero")]
    DivisionByZero,
    #[error("`{name}` is not a function")]
    NotCallable { name: String },
    #[error("Function `{name}` expected {expected} arguments but received {received}")]
    ArityMismatch {
        name: String,
        expected: usize,
        received: usize,
    },
    #[error("Register table is full ({capacity} slots)")]
    RegisterCapacity { capacity: usize },
    #[error("Register `{name}` holds {expected} values, cannot store {found}")]
    RegisterType {
        name: String,
        expected: String,
        found: String,
    },
    #[error("{function}: illegal call outside the right callback")]
    IllegalCallContext { function: String },
    #[error("Assertion failed: {message}")]
    AssertionFailed { message: String },
    #[error("Array index {index} is out of range")]
    IndexOutOfRange { index: usize },
    #[error("Stack overflow: call depth exceeded {limit}")]
    StackOverflow { limit: usize },
    #[error("Execution timed-out")]
    Timeout,
    #[error("`{statement}` used outside of a loop")]
    StrayControl { statement: &'static str },
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Compile,
    Runtime,
    Timeout,
}

/// The single error type handed across the callback boundary.
#[derive(Clone, Debug)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<Location>,
    pub callback: Option<String>,
    pub external_file: Option<PathBuf>,
    pub call_stack: Vec<CallStackEntry>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            callback: None,
            external_file: None,
            call_stack: Vec::new(),
        }
    }

    pub fn from_syntax(
        errors: &SyntaxErrors,
        lines: &LineIndex,
        external_file: Option<PathBuf>,
    ) -> Self {
        let (message, location) = match errors.first() {
            Some(first) => (first.message.clone(), Some(lines.locate(first.span))),
            None => ("Syntax error".to_string(), None),
        };
        Self {
            kind: ErrorKind::Syntax,
            message,
            location,
            callback: None,
            external_file,
            call_stack: Vec::new(),
        }
    }

    pub fn from_runtime(
        error: RuntimeError,
        location: Option<Location>,
        call_stack: Vec<CallStackEntry>,
    ) -> Self {
        let kind = match error {
            RuntimeError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Runtime,
        };
        Self {
            kind,
            message: error.to_string(),
            location,
            callback: None,
            external_file: None,
            call_stack,
        }
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_external_file(mut self, file: Option<PathBuf>) -> Self {
        if self.external_file.is_none() {
            self.external_file = file;
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn line(&self) -> Option<u32> {
        self.location.map(|loc| loc.line)
    }

    pub fn column(&self) -> Option<u32> {
        self.location.map(|loc| loc.column)
    }

    pub fn offset(&self) -> Option<usize> {
        self.location.map(|loc| loc.offset())
    }

    /// Multi-line rendering with one "called from" line per stack entry.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        for entry in self.call_stack.iter().rev() {
            out.push_str(&format!("\n  called from {entry}"));
        }
        out
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.external_file {
            write!(f, "{}: ", file.display())?;
        }
        match self.location {
            Some(loc) => write!(
                f,
                "Line {}, column {}: {}",
                loc.line, loc.column, self.message
            ),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

impl Diagnostic for ScriptError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let code = match self.kind {
            ErrorKind::Syntax => "rtscript::syntax",
            ErrorKind::Compile => "rtscript::compile",
            ErrorKind::Runtime => "rtscript::runtime",
            ErrorKind::Timeout => "rtscript::timeout",
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        if self.call_stack.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .call_stack
            .iter()
            .rev()
            .map(|entry| format!("called from {entry}"))
            .collect();
        Some(Box::new(lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::span::Span;

    #[test]
    fn timeout_runtime_errors_map_to_timeout_kind() {
        let err = ScriptError::from_runtime(RuntimeError::Timeout, None, Vec::new());
        assert!(err.is_timeout());
        assert_eq!(err.message, "Execution timed-out");
    }

    #[test]
    fn display_includes_line_and_column() {
        let lines = LineIndex::new("var a;\nfoo();\n");
        let location = lines.locate(Span::new(7, 10));
        let err = ScriptError::from_runtime(
            RuntimeError::UnknownSymbol { name: "foo".into() },
            Some(location),
            Vec::new(),
        );
        assert_eq!(err.to_string(), "Line 2, column 1: Unknown symbol `foo`");
        assert_eq!(err.offset(), Some(7));
    }
}
