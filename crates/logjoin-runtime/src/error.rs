//! Error types for log line ingestion.

/// A log line that could not be turned into an event.
///
/// Both variants are recoverable at line granularity: the line is skipped and
/// ingestion continues with the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// A mandatory parameter is missing or malformed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The event type tag is not one the join understands.
    #[error("unsupported event type '{0}'")]
    UnsupportedEvent(char),
}

impl JoinError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        JoinError::Parse(msg.into())
    }

    /// Short label used for metrics and dead-letter entries.
    pub fn reason(&self) -> &'static str {
        match self {
            JoinError::Parse(_) => "parse",
            JoinError::UnsupportedEvent(_) => "unsupported_event",
        }
    }
}
