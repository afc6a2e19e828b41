//! Response body sources.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::view::View;

/// A boxed byte stream a response body can be read from.
pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

/// Where a response's body comes from.
///
/// Only [`Body::Full`] is known up front. Streams are read and views are
/// rendered after the response head has gone out, so a failure there can no
/// longer change the status.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A complete in-memory body.
    Full(Bytes),
    /// A readable stream, with its length when the stage knows it.
    Stream {
        reader: BodyStream,
        length: Option<u64>,
    },
    /// A view rendered against a JSON model while the body is written.
    View {
        view: Arc<dyn View>,
        model: serde_json::Value,
    },
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            Self::Stream { length, .. } => *length == Some(0),
            Self::View { .. } => false,
        }
    }

    /// Returns the in-memory bytes, if this body is [`Body::Full`].
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Full(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream { length, .. } => f.debug_struct("Stream").field("length", length).finish(),
            Self::View { model, .. } => f.debug_struct("View").field("model", model).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Full(Bytes::from_static(s.as_bytes()))
    }
}
