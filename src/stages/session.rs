//! Cookie-identified sessions.
//!
//! [`SessionManager`] finds the session named by the request's session
//! cookie (or query parameter), or starts a new one, and leaves it in the
//! request extensions for later stages. Once the rest of the chain has
//! answered, the session is saved, or destroyed if a stage ended it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use moka::future::Cache;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::http::{Cookie, Request};
use crate::stage::{BoxFuture, Next, Stage, StageError, StageResult};

/// Cookie and query parameter carrying the session id.
pub const DEFAULT_SESSION_KEY: &str = "_sid";

/// Idle time after which a session is abandoned.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Per-client state kept between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    data: HashMap<String, Value>,
    last_touched: DateTime<Utc>,
    ended: bool,
}

impl Session {
    /// A fresh session with a random id.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data: HashMap::new(),
            last_touched: Utc::now(),
            ended: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Marks the session as used now.
    pub fn touch(&mut self) {
        self.last_touched = Utc::now();
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_touched
    }

    /// Backdates the last use, for stores restoring persisted sessions.
    #[must_use]
    pub fn with_last_touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_touched = at;
        self
    }

    /// Returns `true` if the session has not ended and was used within
    /// `timeout`.
    pub fn still_valid(&self, timeout: Duration) -> bool {
        if self.ended {
            return false;
        }
        let idle = Utc::now().signed_duration_since(self.last_touched);
        match idle.to_std() {
            Ok(idle) => idle < timeout,
            // last touched in the future: clock skew, not expiry
            Err(_) => true,
        }
    }

    /// Ends the session. The manager destroys it once the response is ready
    /// and tells the client to drop its cookie.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Where sessions live between requests.
pub trait SessionStore: Send + Sync {
    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Session>, StageError>>;

    fn save<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), StageError>>;

    fn destroy<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StageError>>;
}

/// Most sessions a [`MemorySessionStore`] holds before evicting.
pub const DEFAULT_STORE_CAPACITY: u64 = 100_000;

/// An in-process session store. Sessions are lost on restart.
///
/// Entries idle for longer than the store's idle limit are evicted, and the
/// store never grows past its capacity.
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Cache<String, Session>,
}

impl MemorySessionStore {
    /// A store with [`DEFAULT_STORE_CAPACITY`] and the default session
    /// timeout as its idle limit.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_STORE_CAPACITY, DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_limits(capacity: u64, idle: Duration) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(idle)
                .build(),
        }
    }

    /// Live sessions, after pending evictions have run.
    pub async fn len(&self) -> u64 {
        self.sessions.run_pending_tasks().await;
        self.sessions.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("entries", &self.sessions.entry_count())
            .finish_non_exhaustive()
    }
}

impl SessionStore for MemorySessionStore {
    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Session>, StageError>> {
        Box::pin(async move { Ok(self.sessions.get(id).await) })
    }

    fn save<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            self.sessions.insert(session.id.clone(), session.clone()).await;
            Ok(())
        })
    }

    fn destroy<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            self.sessions.invalidate(id).await;
            Ok(())
        })
    }
}

/// Restricts the path of a newly issued session cookie. A stage places it
/// in the request extensions; without it the cookie path is `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePath(pub String);

/// Attaches a [`Session`] to every request.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use capsela::stages::{MemorySessionStore, SessionManager};
///
/// let sessions = SessionManager::new(Arc::new(MemorySessionStore::new()))
///     .secure_cookies(true);
/// ```
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    key: String,
    timeout: Duration,
    secure_cookies: bool,
    http_only: bool,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            key: DEFAULT_SESSION_KEY.to_owned(),
            timeout: DEFAULT_SESSION_TIMEOUT,
            secure_cookies: false,
            http_only: true,
        }
    }

    /// Cookie and query parameter name for the session id.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Loads the session named by `id`, or starts a new one if there is no
    /// such session or it has gone idle. The flag is `true` for new sessions.
    pub async fn establish(&self, id: Option<&str>) -> Result<(Session, bool), StageError> {
        if let Some(id) = id {
            match self.store.load(id).await? {
                Some(mut session) if session.still_valid(self.timeout) => {
                    session.touch();
                    return Ok((session, false));
                }
                Some(_) => {
                    debug!(session = %id, "session expired; starting a new one");
                    self.store.destroy(id).await?;
                }
                None => debug!(session = %id, "unknown session; starting a new one"),
            }
        }
        Ok((Session::new(), true))
    }
}

impl Stage for SessionManager {
    fn service<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> BoxFuture<'a, StageResult> {
        Box::pin(async move {
            let id = request
                .cookie(&self.key)
                .or_else(|| request.params().get(&self.key))
                .map(str::to_owned);

            let (session, created) = self.establish(id.as_deref()).await?;
            request.extensions_mut().insert(session);

            let Some(mut response) = next.pass(request).await? else {
                return Ok(None);
            };

            let Some(session) = request.extensions_mut().remove::<Session>() else {
                warn!("session removed from request; not saving");
                return Ok(Some(response));
            };

            if session.is_ended() {
                self.store.destroy(session.id()).await?;
                Cookie::new(self.key.as_str(), "")
                    .path("/")
                    .unset_in(&mut response);
                debug!(session = %session.id(), "session ended");
                return Ok(Some(response));
            }

            self.store.save(&session).await?;
            if created {
                let path = request
                    .extensions()
                    .get::<CookiePath>()
                    .map_or("/", |path| path.0.as_str());
                Cookie::new(self.key.as_str(), session.id())
                    .path(path)
                    .secure(self.secure_cookies)
                    .http_only(self.http_only)
                    .set_in(&mut response);
            }
            Ok(Some(response))
        })
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("secure_cookies", &self.secure_cookies)
            .field("http_only", &self.http_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::http::{Method, Response, StatusCode};
    use crate::stage::Pipeline;

    /// Counts visits in the session; `/logout` ends it, `/silent` answers
    /// nothing.
    struct Visits;

    impl Stage for Visits {
        fn service<'a>(
            &'a self,
            request: &'a mut Request,
            _: Next<'a>,
        ) -> BoxFuture<'a, StageResult> {
            Box::pin(async move {
                if request.path() == "/silent" {
                    return Ok(None);
                }
                if request.path() == "/scoped" {
                    request.extensions_mut().insert(CookiePath("/app".into()));
                }
                let logout = request.path() == "/logout";
                let session = request.extensions_mut().get_mut::<Session>().unwrap();
                let visits = session.get("visits").and_then(Value::as_u64).unwrap_or(0) + 1;
                session.insert("visits", json!(visits));
                if logout {
                    session.end();
                }
                Ok(Some(Response::new(StatusCode::OK).body(visits.to_string())))
            })
        }
    }

    fn setup() -> (Arc<MemorySessionStore>, Pipeline) {
        let store = Arc::new(MemorySessionStore::new());
        let pipeline = Pipeline::new()
            .stage(SessionManager::new(store.clone()))
            .stage(Visits);
        (store, pipeline)
    }

    async fn send(pipeline: &Pipeline, request: Request) -> Option<Response> {
        let mut request = request;
        pipeline.service(&mut request).await.unwrap()
    }

    fn sid(response: &Response) -> String {
        let cookie = response.headers().get("set-cookie").unwrap();
        let (pair, _) = cookie.split_once(';').unwrap();
        pair.strip_prefix("_sid=").unwrap().to_owned()
    }

    fn body(response: &Response) -> String {
        String::from_utf8(response.body_ref().as_bytes().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn validity() {
        let fresh = Session::new();
        assert!(fresh.still_valid(DEFAULT_SESSION_TIMEOUT));

        let stale = Session::new().with_last_touched(Utc::now() - ChronoDuration::hours(25));
        assert!(!stale.still_valid(DEFAULT_SESSION_TIMEOUT));
        assert!(stale.still_valid(Duration::from_secs(26 * 3600)));

        let mut ended = Session::new();
        ended.end();
        assert!(!ended.still_valid(DEFAULT_SESSION_TIMEOUT));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Session::new().id(), Session::new().id());
    }

    #[tokio::test]
    async fn new_session_sets_a_cookie_and_is_saved() {
        let (store, pipeline) = setup();
        let response = send(&pipeline, Request::new(Method::Get, "/")).await.unwrap();

        let cookie = response.headers().get("set-cookie").unwrap();
        assert!(cookie.contains("; Path=/"));
        assert!(cookie.contains("HttpOnly"));
        assert!(store.load(&sid(&response)).await.unwrap().is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn known_session_is_reused_without_a_cookie() {
        let (store, pipeline) = setup();
        let first = send(&pipeline, Request::new(Method::Get, "/")).await.unwrap();
        let id = sid(&first);

        let request = Request::new(Method::Get, "/").with_header("Cookie", format!("_sid={id}"));
        let second = send(&pipeline, request).await.unwrap();
        assert_eq!(body(&second), "2");
        assert!(!second.headers().contains("set-cookie"));

        // the query string works too
        let third = send(&pipeline, Request::new(Method::Get, format!("/?_sid={id}"))).await.unwrap();
        assert_eq!(body(&third), "3");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced() {
        let store = Arc::new(MemorySessionStore::new());
        let stale = Session::new().with_last_touched(Utc::now() - ChronoDuration::days(2));
        store.save(&stale).await.unwrap();

        let pipeline = Pipeline::new()
            .stage(SessionManager::new(store.clone()))
            .stage(Visits);
        let request = Request::new(Method::Get, "/").with_header("Cookie", format!("_sid={}", stale.id()));
        let response = send(&pipeline, request).await.unwrap();

        assert_eq!(body(&response), "1");
        assert_ne!(sid(&response), stale.id());
        assert!(store.load(stale.id()).await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_from_memory() {
        let store = MemorySessionStore::with_limits(DEFAULT_STORE_CAPACITY, Duration::from_millis(50));
        let session = Session::new();
        store.save(&session).await.unwrap();
        assert!(store.load(session.id()).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.load(session.id()).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_store_is_bounded() {
        let store = MemorySessionStore::with_limits(8, DEFAULT_SESSION_TIMEOUT);
        for _ in 0..100 {
            store.save(&Session::new()).await.unwrap();
        }
        assert!(store.len().await <= 8);
    }

    #[tokio::test]
    async fn ended_session_is_destroyed_and_cookie_unset() {
        let (store, pipeline) = setup();
        let first = send(&pipeline, Request::new(Method::Get, "/")).await.unwrap();
        let id = sid(&first);

        let request = Request::new(Method::Get, "/logout").with_header("Cookie", format!("_sid={id}"));
        let response = send(&pipeline, request).await.unwrap();

        let cookie = response.headers().get("set-cookie").unwrap();
        assert!(cookie.starts_with("_sid=; Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn no_response_means_nothing_saved() {
        let (store, pipeline) = setup();
        assert!(send(&pipeline, Request::new(Method::Get, "/silent")).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cookie_path_comes_from_the_request() {
        let (_store, pipeline) = setup();
        let response = send(&pipeline, Request::new(Method::Get, "/scoped")).await.unwrap();
        assert!(response.headers().get("set-cookie").unwrap().contains("; Path=/app"));
    }

    #[tokio::test]
    async fn custom_key_and_secure_cookies() {
        let store = Arc::new(MemorySessionStore::new());
        let pipeline = Pipeline::new()
            .stage(SessionManager::new(store).key("token").secure_cookies(true).http_only(false))
            .stage(Visits);
        let response = send(&pipeline, Request::new(Method::Get, "/")).await.unwrap();
        let cookie = response.headers().get("set-cookie").unwrap();
        assert!(cookie.starts_with("token="));
        assert!(cookie.contains("; Secure"));
        assert!(!cookie.contains("HttpOnly"));
    }
}
