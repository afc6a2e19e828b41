use thiserror::Error;

use crate::http::StatusCode;
use crate::resolver::ResolveError;
use crate::view::ViewError;

/// A failure raised by a stage.
///
/// Whatever the variant, the server answers `500` with the error's message.
/// A status carried by [`StageError::Failed`] is only a hint for stages such
/// as [`ErrorHandler`](crate::stages::ErrorHandler) that render error pages.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{message}")]
    Failed {
        status: Option<StatusCode>,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    View(#[from] ViewError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StageError {
    /// A plain failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            status: None,
            message: message.into(),
        }
    }

    /// A failure that suggests `status` for error pages.
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Failed {
            status: Some(status),
            message: message.into(),
        }
    }

    /// The suggested HTTP status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Failed { status, .. } => *status,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Some(StatusCode::NOT_FOUND),
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Some(StatusCode::FORBIDDEN)
            }
            _ => None,
        }
    }
}
