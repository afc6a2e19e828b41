//! The stage pipeline: an ordered chain of request-processing stages.
//!
//! A request enters at the head of a [`Pipeline`] and travels down the chain
//! until some stage answers it. Each stage may:
//!
//! - **Short-circuit**: return `Ok(Some(response))` without calling `next`.
//! - **Fall through**: return `next.pass(request).await`.
//! - **Decorate**: call `next.pass(request).await`, then adjust the response
//!   (or the request state it left behind) before returning it.
//! - **Fail**: return `Err(StageError)`; errors travel back up the chain
//!   untouched unless a stage chooses to handle them.
//!
//! ## Core types
//!
//! - [`Stage`]: trait implemented by every stage.
//! - [`Next`]: the rest of the chain as seen from one stage.
//! - [`Pipeline`]: the chain itself, owned by the server.
//! - [`StageResult`]: `Ok(None)` means "no response"; the server turns that
//!   into `404`.

use std::{future::Future, pin::Pin, sync::Arc};

use tracing::debug;

use crate::{http::Request, http::Response, resolver::ResolverRegistry};

mod error;

pub use error::StageError;

/// A boxed, sendable future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a stage hands back: a response, no response, or a failure.
pub type StageResult = Result<Option<Response>, StageError>;

/// The core trait for all stages.
///
/// Only [`service`](Self::service) is required. The hooks have no-op
/// defaults; [`Pipeline`] calls each hook on every stage in chain order, so an
/// override never has to forward the call itself.
///
/// # Contract
///
/// - Stage N+1 is only entered when stage N calls [`Next::pass`].
/// - Errors returned by `pass` belong to the caller; a stage must not turn
///   them into "no response".
/// - Stages are shared by every connection. Interior state needs its own
///   synchronization.
///
/// # Examples
///
/// ```rust
/// use capsela::stage::{BoxFuture, Next, Stage, StageResult};
/// use capsela::{Request, Response, StatusCode};
///
/// struct Hello;
///
/// impl Stage for Hello {
///     fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
///         Box::pin(async move {
///             if request.path() == "/hello" {
///                 return Ok(Some(Response::new(StatusCode::OK).body("hi")));
///             }
///             next.pass(request).await
///         })
///     }
/// }
/// ```
pub trait Stage: Send + Sync {
    /// Handle `request`, optionally delegating to the rest of the chain.
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>)
    -> BoxFuture<'a, StageResult>;

    /// Resolves once the stage has finished any asynchronous setup.
    fn is_ready(&self) -> BoxFuture<'_, Result<(), StageError>> {
        Box::pin(async { Ok(()) })
    }

    /// Lets the stage register resolvers with the server's registry.
    fn set_resolver(&self, _registry: &mut ResolverRegistry) {}

    /// Passive look at each request before the chain runs.
    fn echo(&self, _request: &Request) {}
}

/// The remainder of the chain below the current stage.
///
/// `Next` is consumed by [`pass`](Self::pass), so a stage forwards a request
/// at most once per invocation.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Stage>]) -> Self {
        Self { stages }
    }

    /// A cursor with nothing behind it, for driving a single stage directly.
    pub fn end() -> Self {
        Self { stages: &[] }
    }

    /// Returns `true` when no stage follows.
    pub fn is_end(&self) -> bool {
        self.stages.is_empty()
    }

    /// Forwards `request` to the next stage, or yields `Ok(None)` when this
    /// is the last stage.
    pub fn pass<'r>(self, request: &'r mut Request) -> BoxFuture<'r, StageResult>
    where
        'a: 'r,
    {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.service(request, Next { stages: rest }),
            None => {
                debug!(path = %request.path(), "end of stage chain, no response");
                Box::pin(async { Ok(None) })
            }
        }
    }
}

/// An ordered chain of stages.
///
/// # Examples
///
/// ```rust,no_run
/// use capsela::stage::Pipeline;
/// use capsela::stages::{ErrorHandler, FileServer};
/// use capsela::view::StaticView;
///
/// let pipeline = Pipeline::new()
///     .stage(ErrorHandler::new(StaticView::new("<h1>oops</h1>")))
///     .stage(FileServer::new("/static", "./public"));
/// assert_eq!(pipeline.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `stage` as the successor of the current last stage.
    #[must_use]
    pub fn stage<S>(mut self, stage: S) -> Self
    where
        S: Stage + 'static,
    {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends an already shared stage.
    pub fn push(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs `request` through the chain from the head.
    pub fn service<'r>(&'r self, request: &'r mut Request) -> BoxFuture<'r, StageResult> {
        Next::new(&self.stages).pass(request)
    }

    /// Waits for every stage to report ready. The first failure wins.
    pub async fn is_ready(&self) -> Result<(), StageError> {
        for stage in &self.stages {
            stage.is_ready().await?;
        }
        Ok(())
    }

    /// Offers `registry` to every stage, head first.
    pub fn set_resolver(&self, registry: &mut ResolverRegistry) {
        for stage in &self.stages {
            stage.set_resolver(registry);
        }
    }

    /// Shows `request` to every stage, head first.
    pub fn echo(&self, request: &Request) {
        for stage in &self.stages {
            stage.echo(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::http::{Method, StatusCode};
    use crate::resolver::{ResolveError, Resolver};

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Stage for Record {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            Box::pin(async move {
                self.log.lock().unwrap().push(self.name);
                let response = next.pass(request).await?;
                self.log.lock().unwrap().push(self.name);
                Ok(response)
            })
        }
    }

    struct Answer;

    impl Stage for Answer {
        fn service<'a>(&'a self, _: &'a mut Request, _: Next<'a>) -> BoxFuture<'a, StageResult> {
            Box::pin(async { Ok(Some(Response::new(StatusCode::OK).body("ok"))) })
        }
    }

    struct Fail;

    impl Stage for Fail {
        fn service<'a>(&'a self, _: &'a mut Request, _: Next<'a>) -> BoxFuture<'a, StageResult> {
            Box::pin(async { Err(StageError::msg("boom")) })
        }
    }

    struct Tag;

    impl Stage for Tag {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            Box::pin(async move {
                request.params_mut().insert("tagged", "yes");
                next.pass(request).await
            })
        }
    }

    struct ReadTag;

    impl Stage for ReadTag {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            _: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            Box::pin(async move {
                let tag = request.params().get("tagged").unwrap_or("no").to_owned();
                Ok(Some(Response::new(StatusCode::OK).body(tag)))
            })
        }
    }

    struct Hooks {
        ready: Arc<AtomicUsize>,
        echoed: Arc<AtomicUsize>,
        namespace: &'static str,
    }

    struct Upper;

    impl Resolver for Upper {
        fn resolve(&self, _: &str, reference: &str) -> Result<Option<String>, ResolveError> {
            Ok(Some(reference.to_uppercase()))
        }
    }

    impl Stage for Hooks {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            next: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            next.pass(request)
        }

        fn is_ready(&self) -> BoxFuture<'_, Result<(), StageError>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.ready.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn set_resolver(&self, registry: &mut ResolverRegistry) {
            registry.register(self.namespace, Arc::new(Upper));
        }

        fn echo(&self, _: &Request) {
            self.echoed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request() -> Request {
        Request::new(Method::Get, "/x")
    }

    #[tokio::test]
    async fn empty_pipeline_yields_no_response() {
        let pipeline = Pipeline::new();
        assert!(pipeline.service(&mut request()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stages_run_in_order_and_unwind_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .stage(Record { name: "a", log: Arc::clone(&log) })
            .stage(Record { name: "b", log: Arc::clone(&log) })
            .stage(Answer);

        let response = pipeline.service(&mut request()).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .stage(Answer)
            .stage(Record { name: "never", log: Arc::clone(&log) });

        assert!(pipeline.service(&mut request()).await.unwrap().is_some());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn errors_propagate_through_pass() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .stage(Record { name: "a", log: Arc::clone(&log) })
            .stage(Fail);

        let err = pipeline.service(&mut request()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        // the recording stage never got its response back
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn request_changes_are_visible_downstream() {
        let pipeline = Pipeline::new().stage(Tag).stage(ReadTag);
        let mut req = request();
        let response = pipeline.service(&mut req).await.unwrap().unwrap();
        assert_eq!(response.body_ref().as_bytes().unwrap(), "yes");
        assert_eq!(req.params().get("tagged"), Some("yes"));
    }

    #[tokio::test]
    async fn hooks_reach_every_stage() {
        let ready = Arc::new(AtomicUsize::new(0));
        let echoed = Arc::new(AtomicUsize::new(0));
        let hooks = |namespace| Hooks {
            ready: Arc::clone(&ready),
            echoed: Arc::clone(&echoed),
            namespace,
        };
        let pipeline = Pipeline::new().stage(hooks("first")).stage(hooks("second"));

        pipeline.is_ready().await.unwrap();
        assert_eq!(ready.load(Ordering::SeqCst), 2);

        pipeline.echo(&request());
        assert_eq!(echoed.load(Ordering::SeqCst), 2);

        let mut registry = ResolverRegistry::new();
        pipeline.set_resolver(&mut registry);
        assert_eq!(registry.resolve("second", "abc").unwrap().as_deref(), Some("ABC"));
    }

    #[tokio::test]
    async fn next_end_yields_no_response() {
        assert!(Next::end().is_end());
        assert!(Next::end().pass(&mut request()).await.unwrap().is_none());
    }
}
