//! Typed error hierarchy for the crowdbox orchestrator.
//!
//! One enum per subsystem:
//! - `ChallengeError` - flag/hint/objective configuration and progression
//! - `ResourceError` - remote machine lifecycle failures
//! - `StoreError` - persistence failures
//! - `GatewayError` - chat connection failures
//! - `SessionError` - orchestrator preconditions, wraps the others
//!
//! Every error reports an [`ErrorKind`] so callers (console, chat replies)
//! can decide how to present it without matching on every variant.

use thiserror::Error;

/// Coarse classification shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    Unauthorized,
    MovementBoundary,
    /// The operation timed out and may succeed if issued again.
    Retryable,
    Failure,
}

/// Errors from the challenge engine.
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Flag '{text}' already exists")]
    DuplicateFlag { text: String },

    #[error("Flag '{text}' does not exist")]
    FlagNotFound { text: String },

    #[error("Hint already exists on level {level}")]
    DuplicateHint { level: u32 },

    #[error("Hint {order} on level {level} does not exist")]
    HintNotFound { level: u32, order: usize },

    #[error("Hint {order} on level {level} can not be moved {direction}")]
    HintMovement {
        level: u32,
        order: usize,
        direction: &'static str,
    },

    #[error("Level {level} already has an objective")]
    ObjectiveAlreadyExists { level: u32 },

    #[error("Level {level} has no objective")]
    ObjectiveNotFound { level: u32 },

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),
}

impl ChallengeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateFlag { .. }
            | Self::DuplicateHint { .. }
            | Self::ObjectiveAlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::FlagNotFound { .. }
            | Self::HintNotFound { .. }
            | Self::ObjectiveNotFound { .. }
            | Self::UnknownProvider(_) => ErrorKind::NotFound,
            Self::HintMovement { .. } => ErrorKind::MovementBoundary,
        }
    }
}

/// Errors from the remote machine wrapper and its driver.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Machine '{name}' not found")]
    NotFound { name: String },

    #[error("Machine is not running")]
    NotRunning,

    #[error("Machine is already running")]
    AlreadyRunning,

    #[error("Machine operation '{operation}' timed out after {secs} seconds")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Machine driver error: {0}")]
    Driver(#[source] anyhow::Error),
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotRunning | Self::AlreadyRunning => ErrorKind::InvalidState,
            Self::Timeout { .. } => ErrorKind::Retryable,
            Self::Driver(_) => ErrorKind::Failure,
        }
    }
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Profile {id} not found")]
    ProfileNotFound { id: i64 },

    #[error("Challenge {id} not found")]
    ChallengeNotFound { id: i64 },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProfileNotFound { .. } | Self::ChallengeNotFound { .. } => ErrorKind::NotFound,
            Self::Database(_) | Self::LockPoisoned => ErrorKind::Failure,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Errors from the chat gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Chat gateway is not connected")]
    NotConnected,

    #[error("Chat gateway is already connected")]
    AlreadyConnected,

    #[error("Chat gateway I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected | Self::AlreadyConnected => ErrorKind::InvalidState,
            Self::Io(_) => ErrorKind::Failure,
        }
    }
}

/// Errors surfaced by the session orchestrator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No profile has been loaded")]
    NoProfileSelected,

    #[error("No challenge has been loaded")]
    NoChallengeSelected,

    #[error("Machine has not been initialized")]
    ResourceNotInitialized,

    #[error("Chat gateway has not been initialized")]
    GatewayNotInitialized,

    #[error("Chat gateway is already initialized")]
    GatewayAlreadyInitialized,

    #[error("Not allowed to interact")]
    Unauthorized { message: Option<String> },

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoProfileSelected
            | Self::NoChallengeSelected
            | Self::ResourceNotInitialized
            | Self::GatewayNotInitialized
            | Self::GatewayAlreadyInitialized => ErrorKind::InvalidState,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Challenge(e) => e.kind(),
            Self::Resource(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Gateway(e) => e.kind(),
            Self::Other(_) => ErrorKind::Failure,
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_error_duplicate_flag_carries_text() {
        let err = ChallengeError::DuplicateFlag {
            text: "FLAG{abc}".to_string(),
        };
        match &err {
            ChallengeError::DuplicateFlag { text } => assert_eq!(text, "FLAG{abc}"),
            _ => panic!("Expected DuplicateFlag"),
        }
        assert!(err.to_string().contains("FLAG{abc}"));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn hint_movement_is_a_boundary_error() {
        let err = ChallengeError::HintMovement {
            level: 1,
            order: 0,
            direction: "up",
        };
        assert_eq!(err.kind(), ErrorKind::MovementBoundary);
        assert!(err.to_string().contains("up"));
    }

    #[test]
    fn resource_lifecycle_errors_are_invalid_state() {
        assert_eq!(ResourceError::NotRunning.kind(), ErrorKind::InvalidState);
        assert_eq!(ResourceError::AlreadyRunning.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn resource_timeout_is_retryable() {
        let err = ResourceError::Timeout {
            operation: "launch",
            secs: 30,
        };
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert!(err.to_string().contains("launch"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn store_error_profile_not_found_carries_id() {
        let err = StoreError::ProfileNotFound { id: 42 };
        match &err {
            StoreError::ProfileNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected ProfileNotFound"),
        }
        assert!(err.to_string().contains("42"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn session_error_converts_from_challenge_error() {
        let inner = ChallengeError::FlagNotFound {
            text: "nope".to_string(),
        };
        let err: SessionError = inner.into();
        match &err {
            SessionError::Challenge(ChallengeError::FlagNotFound { text }) => {
                assert_eq!(text, "nope");
            }
            _ => panic!("Expected SessionError::Challenge(FlagNotFound)"),
        }
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn session_error_kind_delegates_to_resource() {
        let err: SessionError = ResourceError::NotRunning.into();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ChallengeError::UnknownProvider("x".into()));
        assert_std_error(&ResourceError::NotRunning);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&GatewayError::NotConnected);
        assert_std_error(&SessionError::NoProfileSelected);
    }
}
