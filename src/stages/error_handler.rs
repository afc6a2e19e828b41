//! Error pages.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::http::body::Body;
use crate::http::{Request, Response, StatusCode};
use crate::stage::{BoxFuture, Next, Stage, StageResult};
use crate::view::View;

/// Renders an error view when the rest of the chain fails or answers
/// nothing.
///
/// The view receives `{"error": <message>, "code": <status>}`. The status is
/// 404 for an empty result, otherwise the error's [`status`] hint, or 500.
///
/// [`status`]: crate::stage::StageError::status
pub struct ErrorHandler {
    view: Arc<dyn View>,
    intercept_status: bool,
}

impl ErrorHandler {
    pub fn new<V>(view: V) -> Self
    where
        V: View + 'static,
    {
        Self::with_view(Arc::new(view))
    }

    pub fn with_view(view: Arc<dyn View>) -> Self {
        Self {
            view,
            intercept_status: false,
        }
    }

    /// Also replace plain 4xx and 5xx responses from later stages (such as
    /// the file server's 403 and 404) with the error view, using their body
    /// text as the message.
    #[must_use]
    pub fn intercept_status(mut self, intercept: bool) -> Self {
        self.intercept_status = intercept;
        self
    }

    fn render(&self, status: StatusCode, message: &str) -> Response {
        let model = json!({
            "error": message,
            "code": status.as_u16(),
        });
        Response::new(status).view(Arc::clone(&self.view), model)
    }

    fn intercepts(&self, response: &Response) -> bool {
        let status = response.status();
        self.intercept_status
            && (status.is_client_error() || status.is_server_error())
            && !matches!(response.body_ref(), Body::View { .. })
    }
}

impl Stage for ErrorHandler {
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            match next.pass(request).await {
                Ok(Some(response)) if self.intercepts(&response) => {
                    let message = response
                        .body_ref()
                        .as_bytes()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .unwrap_or_else(|| response.status().canonical_reason().to_owned());
                    Ok(Some(self.render(response.status(), &message)))
                }
                Ok(Some(response)) => Ok(Some(response)),
                Ok(None) => Ok(Some(self.render(StatusCode::NOT_FOUND, "not found"))),
                Err(e) => {
                    let status = e.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    warn!(path = %request.path(), status = status.as_u16(), error = %e, "rendering error page");
                    Ok(Some(self.render(status, &e.to_string())))
                }
            }
        })
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("intercept_status", &self.intercept_status)
            .finish_non_exhaustive()
    }
}
