// Copyright 2025 permafrost Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    backtrace::Backtrace,
    fmt::{Debug, Display},
    sync::Arc,
};

/// ErrorKind is all kinds of Error of permafrost.
///
/// Retry and propagation decisions are made on the kind alone, never on message matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The evictor is draining or already shut down. Never retried.
    Deactivated,
    /// Insert of an identity that is already present.
    AlreadyExists,
    /// The identity has no backing record.
    NotFound,
    /// The storage engine detected a transactional conflict. Retryable.
    Deadlock,
    /// A deadlock surfaced through a nested call sharing the transaction. Retryable.
    NestedDeadlock,
    /// Any other storage engine failure. Fatal for the current call.
    Database,
    /// A programming error, e.g. a write through a read-only checkout.
    IllegalState,
    /// Config error.
    Config,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Deactivated => "Evictor deactivated",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::NotFound => "Not found",
            ErrorKind::Deadlock => "Deadlock",
            ErrorKind::NestedDeadlock => "Nested-call deadlock",
            ErrorKind::Database => "Database error",
            ErrorKind::IllegalState => "Illegal state",
            ErrorKind::Config => "Config error",
        }
    }
}

/// Error is the error struct returned by all permafrost functions.
///
/// ## Display
///
/// Error can be displayed in two ways:
///
/// - Via `Display`: like `err.to_string()` or `format!("{err}")`
///
/// Error will be printed in a single line:
///
/// ```shell
/// Deadlock, context: { identity: account-17 } => lock wait timed out, source: ...
/// ```
///
/// - Via `Debug`: like `format!("{err:?}")`
///
/// Error will be printed in multiple lines with more details and backtraces (if captured), or with the
/// conventional struct-style representation for `format!("{err:#?}")`.
pub struct Error {
    kind: ErrorKind,
    message: String,

    context: Vec<(&'static str, String)>,

    source: Option<Arc<anyhow::Error>>,
    backtrace: Option<Arc<Backtrace>>,
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If alternate has been specified, print like a conventional struct Debug.
        if f.alternate() {
            let mut de = f.debug_struct("Error");
            de.field("kind", &self.kind);
            de.field("message", &self.message);
            de.field("context", &self.context);
            de.field("source", &self.source);
            de.field("backtrace", &self.backtrace);
            return de.finish();
        }

        write!(f, "{}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }
        writeln!(f)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "  {k}: {v}")?;
            }
        }

        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source:")?;
            writeln!(f, "  {source:#}")?;
        }

        if let Some(backtrace) = &self.backtrace {
            writeln!(f)?;
            writeln!(f, "Backtrace:")?;
            writeln!(f, "{backtrace}")?;
        }

        Ok(())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            let mut iter = self.context.iter().peekable();
            while let Some((k, v)) = iter.next() {
                write!(f, "{k}: {v}")?;
                if iter.peek().is_some() {
                    write!(f, ", ")?;
                }
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref().as_ref())
    }
}

/// Cloning an [`Error`] with large message and context can be expensive.
///
/// Be careful when cloning errors in performance-critical paths.
impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
            source: self.source.clone(),
            backtrace: self.backtrace.clone(),
        }
    }
}

impl Error {
    /// Create a new error.
    ///
    /// If the error needs to carry a source error, please use the `with_source` method.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
            backtrace: Some(Arc::new(Backtrace::capture())),
        }
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, a debug assertion is raised here.
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");
        self.source = Some(Arc::new(source.into()));
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error context.
    pub fn context(&self) -> &Vec<(&'static str, String)> {
        &self.context
    }

    /// Get the error backtrace.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }

    /// Get the error source.
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Downcast the reference of the source error to a specific error type reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Whether the error is a detected transactional conflict, of either the plain or the
    /// nested-call flavor.
    pub fn is_deadlock(&self) -> bool {
        matches!(self.kind, ErrorKind::Deadlock | ErrorKind::NestedDeadlock)
    }

    /// Whether re-running the whole top-level dispatch may succeed.
    ///
    /// Only deadlocks are retryable; everything else is either fatal for the call or a caller error.
    pub fn is_retryable(&self) -> bool {
        self.is_deadlock()
    }
}

/// Result type for permafrost.
pub type Result<T> = std::result::Result<T, Error>;

/// Helper methods for Error.
impl Error {
    /// Helper for creating an [`ErrorKind::Deactivated`] error.
    pub fn deactivated() -> Self {
        Error::new(ErrorKind::Deactivated, "evictor is deactivating or deactivated")
    }

    /// Helper for creating an [`ErrorKind::Deadlock`] error.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Deadlock, message)
    }

    /// Helper for creating an [`ErrorKind::NestedDeadlock`] error.
    pub fn nested_deadlock() -> Self {
        Error::new(
            ErrorKind::NestedDeadlock,
            "deadlock detected while sharing a transaction with a nested call",
        )
    }

    /// Helper for creating an [`ErrorKind::AlreadyExists`] error with the offending key attached.
    pub fn already_exists(key: impl ToString) -> Self {
        Error::new(ErrorKind::AlreadyExists, "record already exists").with_context("key", key)
    }

    /// Helper for creating an [`ErrorKind::NotFound`] error with the missing key attached.
    pub fn not_found(key: impl ToString) -> Self {
        Error::new(ErrorKind::NotFound, "no record for identity").with_context("key", key)
    }

    /// Helper for creating an [`ErrorKind::Database`] error from an engine failure.
    pub fn database(source: impl Into<anyhow::Error>) -> Self {
        Error::new(ErrorKind::Database, "storage engine failure").with_source(source)
    }

    /// Helper for creating an [`ErrorKind::IllegalState`] error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::IllegalState, message)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Error>();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn test_error_display() {
        let err = Error::deadlock("lock wait timed out")
            .with_source(TestError("locked by txn 42".to_string()))
            .with_context("table", "objects")
            .with_context("key", "account-17");

        assert_eq!(
            "Deadlock, context: { table: objects, key: account-17 } => lock wait timed out, source: TestError: locked by txn 42",
            err.to_string()
        );
    }

    #[test]
    fn test_error_downcast() {
        let inner = TestError("cannot read database".to_string());
        let err = Error::database(inner.clone());

        let downcasted = err.downcast_ref::<TestError>().unwrap();
        assert_eq!(downcasted, &inner);
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::deadlock("conflict").is_retryable());
        assert!(Error::nested_deadlock().is_retryable());
        assert!(!Error::deactivated().is_retryable());
        assert!(!Error::database(TestError("io".into())).is_retryable());
        assert!(!Error::already_exists("k").is_retryable());
    }
}
