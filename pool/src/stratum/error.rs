//! Stratum error taxonomy
//!
//! Fixed set of share/worker rejection kinds with stable codes shared by every dialect,
//! plus the error types raised while decoding client messages.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Stable numeric codes sent to miners.
pub mod codes {
    pub const OTHER: i32 = -32003;
    pub const INVALID_SOLUTION: i32 = -32004;
    pub const SOLUTION_SIZE: i32 = -32005;
    pub const DUPLICATE: i32 = -32006;
    pub const NONCE_SIZE: i32 = -32007;
    pub const STALE: i32 = -32008;
    pub const LOW_DIFFICULTY: i32 = -32009;
    pub const UNAUTHORIZED_WORKER: i32 = -32010;
}

/// Rejection kinds known to every dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StratumErrorKind {
    InvalidSolution,
    IncorrectSolutionSize,
    DuplicateShare,
    IncorrectNonceSize,
    StaleShare,
    LowDifficulty,
    UnauthorizedWorker,
}

impl StratumErrorKind {
    pub const ALL: [StratumErrorKind; 7] = [
        StratumErrorKind::InvalidSolution,
        StratumErrorKind::IncorrectSolutionSize,
        StratumErrorKind::DuplicateShare,
        StratumErrorKind::IncorrectNonceSize,
        StratumErrorKind::StaleShare,
        StratumErrorKind::LowDifficulty,
        StratumErrorKind::UnauthorizedWorker,
    ];

    pub const fn code(self) -> i32 {
        match self {
            StratumErrorKind::InvalidSolution => codes::INVALID_SOLUTION,
            StratumErrorKind::IncorrectSolutionSize => codes::SOLUTION_SIZE,
            StratumErrorKind::DuplicateShare => codes::DUPLICATE,
            StratumErrorKind::IncorrectNonceSize => codes::NONCE_SIZE,
            StratumErrorKind::StaleShare => codes::STALE,
            StratumErrorKind::LowDifficulty => codes::LOW_DIFFICULTY,
            StratumErrorKind::UnauthorizedWorker => codes::UNAUTHORIZED_WORKER,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            StratumErrorKind::InvalidSolution => "Invalid solution",
            StratumErrorKind::IncorrectSolutionSize => "Incorrect size of solution",
            StratumErrorKind::DuplicateShare => "Duplicate share",
            StratumErrorKind::IncorrectNonceSize => "Incorrect size of nonce",
            StratumErrorKind::StaleShare => "Stale share - Job not found",
            StratumErrorKind::LowDifficulty => "Low difficulty",
            StratumErrorKind::UnauthorizedWorker => "Unauthorized worker",
        }
    }
}

/// Error carried in a reply: either a taxonomy kind or a free-form `OTHER` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumError {
    Kind(StratumErrorKind),
    Custom(String),
}

impl StratumError {
    pub fn custom(message: impl Into<String>) -> Self {
        StratumError::Custom(message.into())
    }

    pub fn code(&self) -> i32 {
        match self {
            StratumError::Kind(kind) => kind.code(),
            StratumError::Custom(_) => codes::OTHER,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StratumError::Kind(kind) => kind.message(),
            StratumError::Custom(message) => message,
        }
    }

    pub fn kind(&self) -> Option<StratumErrorKind> {
        match self {
            StratumError::Kind(kind) => Some(*kind),
            StratumError::Custom(_) => None,
        }
    }

    /// Classic dialect error array: `[code, message, null]`.
    pub fn response_array(&self) -> Value {
        json!([self.code(), self.message(), Value::Null])
    }
}

impl From<StratumErrorKind> for StratumError {
    fn from(kind: StratumErrorKind) -> Self {
        StratumError::Kind(kind)
    }
}

impl std::fmt::Display for StratumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StratumError", 2)?;
        state.serialize_field("code", &self.code())?;
        state.serialize_field("error", self.message())?;
        state.end()
    }
}

impl Serialize for StratumErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StratumError::Kind(*self).serialize(serializer)
    }
}

/// A client message that cannot be interpreted. Never reaches share validation.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("Params must be an array")]
    ParamsNotArray,
}
