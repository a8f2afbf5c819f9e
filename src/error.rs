//! Error types for the fact store.
//!
//! Each failure class that callers need to tell apart gets its own type:
//! script predicate failures ([`MatchError`]), missing or failing
//! transformations ([`TransformationError`]), optimistic-lock aborts
//! ([`AttemptError`]) and the terminal error a subscription reports to its
//! observer ([`SubscriptionError`]). Everything else is a [`FactCastError`].

use crate::types::{Serial, TransformationKey};
use thiserror::Error;
use uuid::Uuid;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum FactCastError {
    #[error("Duplicate fact id: {0}")]
    DuplicateFactId(Uuid),

    #[error("Invalid fact: {0}")]
    InvalidFact(String),

    #[error("Invalid subscription request: {0}")]
    InvalidRequest(String),

    #[error("Unknown starting fact id: {0}")]
    UnknownStartId(Uuid),

    #[error("Timed out after {waited_ms}ms waiting for lock {code}")]
    LockTimeout { code: i64, waited_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Store has been shut down")]
    ShutDown,

    #[error(transparent)]
    Transformation(Box<TransformationError>),
}

impl From<serde_json::Error> for FactCastError {
    fn from(e: serde_json::Error) -> Self {
        FactCastError::Serialization(e.to_string())
    }
}

impl From<TransformationError> for FactCastError {
    fn from(e: TransformationError) -> Self {
        FactCastError::Transformation(Box::new(e))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, FactCastError>;

/// A filter script could not be compiled or evaluated.
///
/// Never treated as a non-match: the subscription evaluating it fails.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    #[error("Filter script {hash} failed to compile: {message}")]
    Compile { hash: String, message: String },

    #[error("Filter script {hash} failed: {message}")]
    Evaluation { hash: String, message: String },

    #[error("Filter script {hash} returned {got} instead of a boolean")]
    NotBoolean { hash: String, got: String },
}

/// Failure to bring a fact into a requested version.
#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("Missing transformation information for {key} from version {from} to {to}")]
    MissingTransformationInformation {
        key: TransformationKey,
        from: u32,
        to: u32,
    },

    #[error("Transformation {key} {from}->{to} failed: {message}")]
    StepFailed {
        key: TransformationKey,
        from: u32,
        to: u32,
        message: String,
    },

    #[error("Schema registry error: {0}")]
    Registry(#[from] FactCastError),
}

/// Terminal error reported to a subscription observer.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Match(#[from] MatchError),

    #[error("Fact {fact_id} at serial {serial} could not be delivered: {source}")]
    Transformation {
        fact_id: Uuid,
        serial: Serial,
        #[source]
        source: TransformationError,
    },

    #[error(transparent)]
    Store(#[from] FactCastError),
}

/// Why a locked attempt did not publish.
#[derive(Debug, Error)]
pub enum AbortReason {
    /// The attempt function aborted with a message.
    #[error("{0}")]
    Message(String),

    /// The attempt function aborted because of an underlying error.
    #[error("aborted by cause: {0}")]
    Cause(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A fact matching the declared specs was published after the observed position.
    #[error("concurrent modification: fact {fact_id} published at serial {serial}")]
    ConcurrentModification { fact_id: Uuid, serial: Serial },

    /// The attempt function neither published nor aborted.
    #[error("attempt returned no result")]
    NoResult,
}

/// Outcome of a failed [`crate::attempt::LockedOperation::attempt`].
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("Attempt aborted: {0}")]
    Aborted(AbortReason),

    #[error("Conflict check failed: {0}")]
    Match(#[from] MatchError),

    #[error(transparent)]
    Store(#[from] FactCastError),
}

impl AttemptError {
    /// The abort reason, if this was an abort rather than an infrastructure failure.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            AttemptError::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}
