use std::error::Error as StdError;
use std::fmt::{self, Display};

use market_agent_model::ModelProviderError;

/// The kind of error that ended a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The model could not be reached, or kept failing after retries.
    Model,
    /// The turn was cancelled by the caller.
    Cancelled,
    /// The model kept asking for tools beyond the configured limit.
    IterationLimit,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Model => write!(f, "Model error"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::IterationLimit => write!(f, "Iteration limit reached"),
        }
    }
}

/// Describes why a turn ended without an answer.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
    source: Option<Box<dyn ModelProviderError>>,
}

impl Error {
    pub(crate) fn model(source: Box<dyn ModelProviderError>) -> Self {
        Self {
            kind: ErrorKind::Model,
            reason: Some(source.to_string()),
            source: Some(source),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            reason: None,
            source: None,
        }
    }

    pub(crate) fn iteration_limit(max_iterations: usize) -> Self {
        Self {
            kind: ErrorKind::IterationLimit,
            reason: Some(format!(
                "no final answer after {max_iterations} model calls"
            )),
            source: None,
        }
    }

    /// Returns the kind of the error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the model error kind, if the model caused this error.
    #[inline]
    pub fn model_error_kind(&self) -> Option<market_agent_model::ErrorKind> {
        self.source.as_ref().map(|err| err.kind())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {reason}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}
