//! Controller dispatch by path, and `action_link` reference resolution.
//!
//! A request for `/users/show-all/page/2` is routed to the action
//! `showAll` of the controller mounted at `users`, with `page=2` added to
//! the request parameters. The `default` controller is mounted at the root
//! and the `default` action catches paths naming no known action.
//!
//! The dispatcher also resolves links the other way round:
//! `ref:action_link:/users/showAll/page=2` becomes `/users/show-all/page/2`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::http::Request;
use crate::resolver::{ResolveError, Resolver, ResolverRegistry};
use crate::stage::{BoxFuture, Next, Stage, StageResult};

/// Resolver namespace for links to controller actions.
pub const ACTION_LINK: &str = "action_link";

/// Name of the controller mounted at the root and of the fallback action.
pub const DEFAULT: &str = "default";

/// Converts a camel-case name to its URL form: `showAll` → `show-all`.
pub fn hyphenize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('-');
        }
        prev_lower = c.is_ascii_lowercase();
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// Converts a URL segment to camel case: `show-all` → `showAll`.
pub fn dehyphenize(segment: &str) -> String {
    let lower = segment.to_ascii_lowercase();
    let chars: Vec<char> = lower.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut upper_next = false;
    for (i, &c) in chars.iter().enumerate() {
        let joins_words = c == '-'
            && i > 0
            && is_word(chars[i - 1])
            && chars.get(i + 1).is_some_and(|&next| is_word(next));
        if joins_words {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A set of actions the dispatcher can route to.
///
/// # Examples
///
/// ```rust
/// use capsela::stage::{BoxFuture, StageResult};
/// use capsela::stages::dispatcher::Controller;
/// use capsela::{Request, Response, StatusCode};
///
/// struct Users;
///
/// impl Controller for Users {
///     fn actions(&self) -> &[&str] {
///         &["default", "showAll"]
///     }
///
///     fn call<'a>(&'a self, action: &'a str, request: &'a mut Request) -> BoxFuture<'a, StageResult> {
///         Box::pin(async move {
///             let page = request.params().get("page").unwrap_or("1").to_owned();
///             Ok(Some(Response::new(StatusCode::OK).body(format!("{action} page {page}"))))
///         })
///     }
/// }
/// ```
pub trait Controller: Send + Sync {
    /// Action names in camel case. Include `"default"` to catch paths that
    /// name no other action.
    fn actions(&self) -> &[&str];

    /// Runs `action`. `Ok(None)` lets the request fall through to the next
    /// stage.
    fn call<'a>(&'a self, action: &'a str, request: &'a mut Request)
    -> BoxFuture<'a, StageResult>;
}

/// Placed in the request extensions before an action runs.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub controller: String,
    pub action: String,
    /// The dispatcher's shared configuration.
    pub config: Arc<Value>,
}

struct Entry {
    name: String,
    mount_point: String,
    controller: Arc<dyn Controller>,
}

impl Entry {
    fn has_action(&self, action: &str) -> bool {
        self.controller.actions().contains(&action)
    }
}

#[derive(Clone, Default)]
struct RouteTable {
    by_route: HashMap<String, Arc<Entry>>,
    by_name: HashMap<String, Arc<Entry>>,
}

impl Resolver for RouteTable {
    fn resolve(&self, namespace: &str, reference: &str) -> Result<Option<String>, ResolveError> {
        if namespace != ACTION_LINK {
            return Ok(None);
        }

        let mut pieces = reference.split('/');
        let mut controller = pieces.next().unwrap_or_default();
        if controller.is_empty() {
            controller = pieces.next().unwrap_or_default();
        }
        // An empty action segment still yields a path part, so
        // `/admin/` links to `/admin/`; a missing one means `default`.
        let action = pieces.next().unwrap_or(DEFAULT);

        let mut is_leaf = true;
        let mut params: Vec<(&str, Option<&str>)> = Vec::new();
        for piece in pieces {
            if piece.is_empty() {
                is_leaf = false;
                continue;
            }
            let (key, value) = match piece.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (piece, None),
            };
            match params.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = value,
                None => params.push((key, value)),
            }
        }

        let mut parts: Vec<String> = Vec::new();
        if controller != DEFAULT {
            let entry = self
                .by_name
                .get(controller)
                .ok_or_else(|| ResolveError::UnknownController(controller.to_owned()))?;
            parts.push(entry.mount_point.clone());
        }
        if action != DEFAULT {
            parts.push(hyphenize(action));
        }
        for (key, value) in params {
            parts.push(key.to_owned());
            if let Some(value) = value {
                parts.push(value.to_owned());
            }
        }

        let trailing = if !is_leaf && !parts.is_empty() { "/" } else { "" };
        Ok(Some(format!("/{}{trailing}", parts.join("/"))))
    }
}

/// Routes requests to registered controllers.
///
/// ```rust,no_run
/// # use capsela::stages::dispatcher::Controller;
/// # struct Stub;
/// # impl Controller for Stub {
/// #     fn actions(&self) -> &[&str] { unimplemented!() }
/// #     fn call<'a>(&'a self, _: &'a str, _: &'a mut capsela::Request)
/// #         -> capsela::stage::BoxFuture<'a, capsela::StageResult> { unimplemented!() }
/// # }
/// # fn users() -> impl Controller { Stub }
/// use capsela::stages::Dispatcher;
///
/// let dispatcher = Dispatcher::new()
///     .with_config(serde_json::json!({"page_size": 20}))
///     .controller("users", users());
/// ```
#[derive(Clone, Default)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    config: Arc<Value>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration handed to every action through [`Dispatch`].
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Registers `controller` under `name`. The `default` controller is
    /// mounted at the root; any other at its hyphenized name.
    #[must_use]
    pub fn controller<C>(mut self, name: impl Into<String>, controller: C) -> Self
    where
        C: Controller + 'static,
    {
        let name = name.into();
        let mount_point = if name == DEFAULT {
            String::new()
        } else {
            hyphenize(&name)
        };
        debug!(controller = %name, mount_point = %mount_point, "adding controller");

        let entry = Arc::new(Entry {
            name: name.clone(),
            mount_point: mount_point.clone(),
            controller: Arc::new(controller),
        });
        let routes = Arc::make_mut(&mut self.routes);
        routes.by_route.insert(mount_point, Arc::clone(&entry));
        routes.by_name.insert(name, entry);
        self
    }

    /// Resolves an `action_link` reference without going through a registry.
    pub fn link(&self, reference: &str) -> Result<Option<String>, ResolveError> {
        self.routes.resolve(ACTION_LINK, reference)
    }

    /// Picks the controller and action for a path, leaving the unused
    /// segments in `segments`.
    fn route(&self, segments: &mut Vec<String>) -> Option<(Arc<Entry>, String)> {
        let entry = match segments.first().and_then(|first| self.routes.by_route.get(first)) {
            Some(entry) => {
                let entry = Arc::clone(entry);
                segments.remove(0);
                entry
            }
            None => Arc::clone(self.routes.by_name.get(DEFAULT)?),
        };

        let named = segments
            .first()
            .filter(|segment| !segment.is_empty())
            .map(|segment| dehyphenize(segment))
            .filter(|action| entry.has_action(action));
        let action = match named {
            Some(action) => {
                segments.remove(0);
                action
            }
            None if entry.has_action(DEFAULT) => DEFAULT.to_owned(),
            None => return None,
        };
        Some((entry, action))
    }
}

impl Stage for Dispatcher {
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let mut segments: Vec<String> = request.path().split('/').skip(1).map(str::to_owned).collect();

            let Some((entry, action)) = self.route(&mut segments) else {
                return next.pass(request).await;
            };

            for pair in segments.chunks(2) {
                if pair[0].is_empty() {
                    continue;
                }
                let value = pair.get(1).map(String::as_str).unwrap_or_default();
                request.params_mut().insert(pair[0].as_str(), value);
            }
            request.extensions_mut().insert(Dispatch {
                controller: entry.name.clone(),
                action: action.clone(),
                config: Arc::clone(&self.config),
            });

            debug!(controller = %entry.name, action = %action, "dispatching");
            match entry.controller.call(&action, request).await? {
                Some(response) => Ok(Some(response)),
                None => next.pass(request).await,
            }
        })
    }

    fn set_resolver(&self, registry: &mut ResolverRegistry) {
        let routes: Arc<RouteTable> = Arc::clone(&self.routes);
        registry.register(ACTION_LINK, routes);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.routes.by_name.keys().collect();
        names.sort();
        f.debug_struct("Dispatcher")
            .field("controllers", &names)
            .field("config", &self.config)
            .finish()
    }
}
