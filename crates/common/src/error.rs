use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by (or while talking to) the push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The token is invalid or no longer registered; do not retry.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Permanent(_))
    }
}

/// Error taxonomy for the notification subsystem.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("User {0} has no active channels")]
    NoChannels(Uuid),

    #[error("Target user list is empty")]
    EmptyTargets,

    #[error("Too many targets: {count} (max {max})")]
    TooManyTargets { count: usize, max: usize },

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Notification to {user_id} suppressed: {reason}")]
    Suppressed { user_id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),
}

impl NotifyError {
    pub fn user_not_found(user_id: Uuid) -> Self {
        NotifyError::NotFound(format!("User {} not found", user_id))
    }

    /// HTTP status a request handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            NotifyError::NotFound(_) | NotifyError::UnknownTemplate(_) => 404,
            NotifyError::InvalidTopic(_)
            | NotifyError::EmptyTargets
            | NotifyError::TooManyTargets { .. }
            | NotifyError::Schedule(_)
            | NotifyError::Validation(_) => 400,
            NotifyError::NoChannels(_) | NotifyError::Suppressed { .. } => 409,
            NotifyError::Gateway(_) => 502,
            NotifyError::Database(_) | NotifyError::Store(_) => 500,
        }
    }
}
