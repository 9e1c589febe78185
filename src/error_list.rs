use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::{BoxError, JobError};

/// An error attributed to the node(s) it concerns.
///
/// Errors recovered from a panic also carry the stack of the code that
/// panicked.
#[derive(Debug, Clone)]
pub struct NodeError {
    cause: Arc<dyn Error + Send + Sync>,
    node_ids: Vec<String>,
    stack: Option<String>,
}

impl NodeError {
    pub fn new(cause: impl Into<BoxError>) -> Self {
        let cause: BoxError = cause.into();
        Self {
            cause: Arc::from(cause),
            node_ids: Vec::new(),
            stack: None,
        }
    }

    /// Keeps an error that already is a `NodeError` as is, wraps anything else.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<NodeError>() {
            Ok(attributed) => *attributed,
            Err(other) => Self::new(other),
        }
    }

    /// `stack` is the trace taken where the panic was raised; without one the
    /// current stack is recorded instead.
    pub(crate) fn panic(message: String, stack: Option<String>) -> Self {
        let mut err = Self::new(JobError::PanicRecovered(message));
        err.stack = Some(stack.unwrap_or_else(|| Backtrace::force_capture().to_string()));
        err
    }

    pub fn with_node_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn cause(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// The cause as a [`JobError`], if it is one.
    pub fn job_error(&self) -> Option<&JobError> {
        self.cause.downcast_ref::<JobError>()
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.job_error(), Some(JobError::PanicRecovered(_)))
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node_ids.is_empty() {
            write!(f, "{}", self.cause)
        } else {
            write!(f, "{}: {}", self.cause, self.node_ids.join(", "))
        }
    }
}

impl Error for NodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Failures collected from one run, in the order they were encountered.
///
/// An empty list means success; use [`ErrorList::into_result`] rather than
/// treating every `ErrorList` as an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorList(Vec<NodeError>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: NodeError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeError> {
        self.0.iter()
    }

    /// Every node id named by any error, in order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().flat_map(|e| e.node_ids().iter().map(String::as_str))
    }

    /// The first error attributed to `id`.
    pub fn for_node(&self, id: &str) -> Option<&NodeError> {
        self.0.iter().find(|e| e.node_ids().iter().any(|n| n == id))
    }

    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl Error for ErrorList {}

impl FromIterator<NodeError> for ErrorList {
    fn from_iter<T: IntoIterator<Item = NodeError>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ErrorList {
    type Item = NodeError;
    type IntoIter = std::vec::IntoIter<NodeError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ErrorList {
    type Item = &'a NodeError;
    type IntoIter = std::slice::Iter<'a, NodeError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
