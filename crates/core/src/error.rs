//! Call contract error model.

use thiserror::Error;

/// Result type used by the call model and codec.
pub type CallResult<T> = Result<T, CallError>;

/// Contract violation raised while building, mutating, encoding or decoding calls.
///
/// These are deterministic programmer/data errors. They are surfaced to the
/// caller and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call descriptor failed validation (weight, callable name, resources, hooks).
    #[error("invalid call descriptor: {0}")]
    InvalidDescriptor(String),

    /// A call report failed validation (outcome fields, timestamps).
    #[error("invalid call report: {0}")]
    InvalidReport(String),

    /// A lifecycle event key outside the fixed set.
    #[error("unknown lifecycle event: {0}")]
    UnknownLifecycleEvent(String),

    /// A control operation key outside the fixed set.
    #[error("unknown control operation: {0}")]
    UnknownControlOperation(String),

    /// A value could not be encoded into a durable record.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A durable record could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CallError {
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    pub fn invalid_report(msg: impl Into<String>) -> Self {
        Self::InvalidReport(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// Re-labels any error raised while reading a record as a decode failure.
    pub fn into_decode(self) -> Self {
        match self {
            CallError::Decode(_) => self,
            other => CallError::Decode(other.to_string()),
        }
    }
}
