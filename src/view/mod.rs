//! Views: deferred response bodies rendered from a JSON model.
//!
//! A stage can answer with `Response::view(view, model)` instead of a
//! finished body; the server renders it while writing the response. Template
//! languages are left to implementors of [`View`].

use thiserror::Error;

/// Errors raised while rendering a view.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("failed to serialize view model: {0}")]
    Json(#[from] serde_json::Error),

    #[error("render failed: {0}")]
    Render(String),
}

/// Renders a model into a response body.
pub trait View: Send + Sync {
    fn render(&self, model: &serde_json::Value) -> Result<String, ViewError>;

    /// The `Content-Type` used when the response does not set one.
    fn content_type(&self) -> &str {
        "text/html; charset=utf-8"
    }
}

/// A view that ignores its model and returns fixed markup.
#[derive(Debug, Clone)]
pub struct StaticView {
    template: String,
}

impl StaticView {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Returns `true` if the markup looks like a whole HTML document rather
    /// than a fragment.
    pub fn is_complete(&self) -> bool {
        let lower = self.template.to_ascii_lowercase();
        lower.trim_start().starts_with("<!doctype") || lower.contains("<html")
    }
}

impl View for StaticView {
    fn render(&self, _model: &serde_json::Value) -> Result<String, ViewError> {
        Ok(self.template.clone())
    }
}

/// A view that renders its model as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonView {
    pretty: bool,
}

impl JsonView {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

impl View for JsonView {
    fn render(&self, model: &serde_json::Value) -> Result<String, ViewError> {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(model)?
        } else {
            serde_json::to_string(model)?
        };
        Ok(rendered)
    }

    fn content_type(&self) -> &str {
        "application/json"
    }
}
