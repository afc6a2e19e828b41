//! Symbolic reference resolution.
//!
//! Stages that own part of the URL space (the dispatcher, for one) register
//! a [`Resolver`] under a namespace. Anything holding the registry can then
//! turn a reference such as `ref:action_link:/users/show/id=7` into a
//! concrete path without knowing how routing works.
//!
//! The server builds one registry per instance, lets every stage register
//! during construction, and then freezes it; it is read-only while serving.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

/// Prefix of a full reference URI: `ref:<namespace>:<reference>`.
const REF_SCHEME: &str = "ref:";

/// Errors a resolver may raise for a reference it owns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("controller '{0}' not found")]
    UnknownController(String),

    #[error("malformed reference '{0}'")]
    Malformed(String),
}

/// Expands references in one or more namespaces. Must be synchronous and
/// free of side effects.
pub trait Resolver: Send + Sync {
    /// Resolves `reference` in `namespace`. `Ok(None)` means "not mine".
    fn resolve(&self, namespace: &str, reference: &str) -> Result<Option<String>, ResolveError>;
}

/// Namespace → resolver map. At most one resolver per namespace; the last
/// registration wins.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use capsela::resolver::{ResolveError, Resolver, ResolverRegistry};
///
/// struct Static(&'static str);
///
/// impl Resolver for Static {
///     fn resolve(&self, _: &str, reference: &str) -> Result<Option<String>, ResolveError> {
///         Ok(Some(format!("{}/{reference}", self.0)))
///     }
/// }
///
/// let mut registry = ResolverRegistry::new();
/// registry.register("asset", Arc::new(Static("/v1")));
/// registry.register("asset", Arc::new(Static("/v2")));
///
/// assert_eq!(registry.resolve("asset", "app.js").unwrap().as_deref(), Some("/v2/app.js"));
/// assert_eq!(registry.resolve("other", "app.js").unwrap(), None);
/// ```
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resolver` for `namespace`, returning the one it replaces.
    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        resolver: Arc<dyn Resolver>,
    ) -> Option<Arc<dyn Resolver>> {
        let namespace = namespace.into();
        debug!(namespace = %namespace, "registering resolver");
        self.resolvers.insert(namespace, resolver)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.resolvers.contains_key(namespace)
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Resolves `reference` with the resolver registered for `namespace`.
    ///
    /// Returns `Ok(None)` when no resolver is registered; the caller should
    /// then use the reference as a literal.
    pub fn resolve(&self, namespace: &str, reference: &str) -> Result<Option<String>, ResolveError> {
        match self.resolvers.get(namespace) {
            Some(resolver) => resolver.resolve(namespace, reference),
            None => Ok(None),
        }
    }

    /// Resolves a full `ref:<namespace>:<reference>` URI.
    ///
    /// Strings that are not reference URIs resolve to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Malformed`] for `ref:` strings with no namespace
    /// separator, plus anything the namespace's resolver raises.
    pub fn resolve_uri(&self, uri: &str) -> Result<Option<String>, ResolveError> {
        let Some(rest) = uri.strip_prefix(REF_SCHEME) else {
            return Ok(None);
        };
        let (namespace, reference) = rest
            .split_once(':')
            .ok_or_else(|| ResolveError::Malformed(uri.to_owned()))?;
        self.resolve(namespace, reference)
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.resolvers.keys()).finish()
    }
}
