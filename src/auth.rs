//! OAuth 2.0 Authorization Code flow: consent URL construction, the
//! loopback redirect server, code-for-token exchange, and refresh-token
//! renewal serialized against in-flight requests.
//!
//! Routing and CSRF semantics below follow the original library's
//! `HttpServerCallback::handle` exactly: the `state` check precedes every
//! other branch, and the pending callback is swapped to empty atomically so
//! a replayed redirect is inert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::crypto::CryptoCapability;
use crate::error::Error;
use crate::http::{HttpRequest, Method};
use crate::request::{Completer, Request, RequestContext};

/// `{access_token, refresh_token, expires_in}`. `expires_in < 0` means
/// "unknown, assume expired on first 401" — the state `fromTokenString`
/// produces when rehydrating a persisted refresh token.
#[derive(Clone)]
pub struct Token {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_in: i64,
    obtained_at: Instant,
}

impl Token {
    pub fn new(access_token: String, refresh_token: String, expires_in: i64) -> Self {
        Token {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_in,
            obtained_at: Instant::now(),
        }
    }

    /// Rehydrates a token from a persisted refresh token alone, with
    /// `expires_in` set to the "unknown" sentinel so the first use forces a
    /// refresh.
    pub fn from_token_string(refresh_token: impl Into<String>) -> Self {
        Token {
            access_token: String::new().into(),
            refresh_token: refresh_token.into().into(),
            expires_in: -1,
            obtained_at: Instant::now(),
        }
    }

    /// A 5-minute buffer before the declared expiry, matching the teacher's
    /// `StoredTokens::is_expired`.
    pub fn is_expired(&self) -> bool {
        if self.expires_in < 0 {
            return true;
        }
        let elapsed = self.obtained_at.elapsed().as_secs() as i64;
        elapsed >= self.expires_in - 300
    }
}

/// Short, provider-branded HTML pages served by the loopback redirect
/// server.
#[derive(Clone, Copy)]
pub struct HtmlPages {
    pub login: &'static str,
    pub success: &'static str,
    pub error: &'static str,
}

impl Default for HtmlPages {
    fn default() -> Self {
        HtmlPages {
            login: "<html><body><h1>Sign in to continue</h1></body></html>",
            success: "<html><body><h1>Authorized</h1>You may close this window.</body></html>",
            error: "<html><body><h1>Authorization failed</h1></body></html>",
        }
    }
}

/// The two provider-specific URL templates every OAuth2 provider supplies.
#[derive(Clone)]
pub struct AuthUrls {
    pub authorize_url: String,
    pub token_url: String,
}

/// Per-provider OAuth2 configuration: everything needed to build the
/// consent URL and perform the code/refresh token exchanges.
#[derive(Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub urls: AuthUrls,
    pub pages: HtmlPages,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Per-provider authorization state: the fixed CSRF nonce, the current
/// token, and a lock serializing refreshes so concurrent 401s trigger at
/// most one network call.
pub struct AuthState {
    config: AuthConfig,
    /// Generated once at construction and never mutated — a CSRF nonce
    /// embedded in the consent URL and checked on every redirect.
    pub state: String,
    token: Mutex<Option<Token>>,
    /// `Some(waiters)` while a refresh is in flight: every request that
    /// observes an expired token while a refresh is already running parks
    /// its completer here instead of issuing a second network call.
    inflight_refresh: Mutex<Option<Vec<Completer<Token>>>>,
}

impl AuthState {
    pub fn new(config: AuthConfig, crypto: &dyn CryptoCapability) -> Self {
        AuthState {
            state: crypto.random_state(),
            config,
            token: Mutex::new(None),
            inflight_refresh: Mutex::new(None),
        }
    }

    /// Builds the provider's consent URL, embedding `client_id`,
    /// `redirect_uri`, and the stored CSRF `state`.
    pub fn authorize_library_url(&self) -> String {
        let mut url = url::Url::parse(&self.config.urls.authorize_url)
            .expect("provider authorize_url must be a valid URL");
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("state", &self.state);
        url.into()
    }

    /// Everything after the third `/` of the redirect URI — the path the
    /// loopback server routes on.
    pub fn redirect_uri_path(&self) -> &str {
        redirect_uri_path(&self.config.redirect_uri)
    }

    pub fn current_token(&self) -> Option<Token> {
        self.token.lock().unwrap().clone()
    }

    pub fn set_token(&self, token: Token) {
        *self.token.lock().unwrap() = Some(token);
    }

    /// Builds the `POST {token_url}` request for the authorization-code
    /// exchange.
    fn exchange_code_request(&self, code: &str) -> HttpRequest {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "authorization_code")
            .append_pair("code", code)
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", self.config.client_secret.expose_secret())
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .finish();
        HttpRequest::new(Method::Post, &self.config.urls.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.into_bytes())
    }

    /// Builds the `POST {token_url}` request for a refresh-token exchange.
    fn refresh_token_request(&self, refresh_token: &str) -> HttpRequest {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", self.config.client_secret.expose_secret())
            .finish();
        HttpRequest::new(Method::Post, &self.config.urls.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.into_bytes())
    }

    fn parse_token_response(body: &[u8]) -> Result<Token, Error> {
        let parsed: TokenResponse = serde_json::from_slice(body)
            .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(body).into_owned()))?;
        Ok(Token {
            access_token: parsed.access_token.into(),
            refresh_token: parsed
                .refresh_token
                .unwrap_or_default()
                .into(),
            expires_in: parsed.expires_in.unwrap_or(-1),
            obtained_at: Instant::now(),
        })
    }

    /// Exchanges an authorization code for a token and stores it.
    pub fn exchange_authorization_code(
        self: &Arc<Self>,
        ctx: &RequestContext,
        code: String,
    ) -> Request<Token> {
        let this = Arc::clone(self);
        ctx.send_request(move || this.exchange_code_request(&code))
            .then(move |result| {
                let response = result?.into_result()?;
                Self::parse_token_response(&response.body)
            })
    }

    /// Refreshes the stored token. Callers needing the "at most one
    /// in-flight refresh per provider" guarantee should route through
    /// [`AuthState::get_valid_token`] instead of calling this directly.
    pub fn refresh(self: &Arc<Self>, ctx: &RequestContext, refresh_token: String) -> Request<Token> {
        let this = Arc::clone(self);
        let this_for_store = Arc::clone(self);
        ctx.send_request(move || this.refresh_token_request(&refresh_token))
            .then(move |result| {
                let response = result?.into_result()?;
                let token = Self::parse_token_response(&response.body)?;
                this_for_store.set_token(token.clone());
                Ok(token)
            })
    }

    /// Marks the stored token as expired without discarding its refresh
    /// token, forcing the next [`AuthState::get_valid_token`] call to
    /// refresh even though the cached `expires_in` hadn't yet elapsed —
    /// the path taken when a request comes back 401 despite a
    /// locally-valid-looking token.
    pub fn invalidate_token(&self) {
        if let Some(token) = self.token.lock().unwrap().as_mut() {
            token.expires_in = -1;
        }
    }

    /// Returns a currently-valid token, refreshing first if necessary.
    /// Guarantees exactly one network refresh call per storm of concurrent
    /// callers: the first caller to observe an expired token performs the
    /// refresh, every other concurrent caller parks behind it and is
    /// replayed the same result.
    pub fn get_valid_token(self: &Arc<Self>, ctx: &RequestContext) -> Request<Token> {
        if let Some(token) = self.current_token() {
            if !token.is_expired() {
                return Request::ready(Arc::clone(&ctx.event_loop), Ok(token));
            }
        }

        let (request, completer) = Request::pending(Arc::clone(&ctx.event_loop));
        let mut inflight = self.inflight_refresh.lock().unwrap();
        match inflight.as_mut() {
            Some(waiters) => {
                waiters.push(completer);
            }
            None => {
                *inflight = Some(vec![completer]);
                drop(inflight);

                let refresh_token = self
                    .current_token()
                    .map(|t| t.refresh_token.expose_secret().to_string())
                    .unwrap_or_default();
                let this = Arc::clone(self);
                let ctx = ctx.clone();
                let _disposed: Request<()> =
                    self.refresh(&ctx, refresh_token).then(move |result| {
                        let waiters = this.inflight_refresh.lock().unwrap().take().unwrap_or_default();
                        match &result {
                            Ok(token) => {
                                for waiter in waiters {
                                    waiter.complete(Ok(token.clone()));
                                }
                            }
                            Err(_) => {
                                for waiter in waiters {
                                    waiter.complete(Err(Error::InvalidCredentials(
                                        "refresh failed".to_string(),
                                    )));
                                }
                            }
                        }
                        Ok(())
                    });
            }
        }
        request
    }
}

/// Everything after the third `/` of a `scheme://host:port/path` URI.
fn redirect_uri_path(redirect_uri: &str) -> &str {
    let mut slashes = 0;
    for (i, c) in redirect_uri.char_indices() {
        if c == '/' {
            slashes += 1;
            if slashes == 3 {
                return &redirect_uri[i + 1..];
            }
        }
    }
    ""
}

/// The callback awaiting exactly one invocation with either the
/// authorization code or a failure, atomically swapped to empty on first
/// fire so a replayed redirect is inert.
pub struct PendingCallback {
    slot: Mutex<Option<Box<dyn FnOnce(Result<String, Error>) + Send>>>,
}

impl PendingCallback {
    pub fn new(callback: impl FnOnce(Result<String, Error>) + Send + 'static) -> Arc<Self> {
        Arc::new(PendingCallback {
            slot: Mutex::new(Some(Box::new(callback))),
        })
    }

    fn take(&self) -> Option<Box<dyn FnOnce(Result<String, Error>) + Send>> {
        self.slot.lock().unwrap().take()
    }
}

/// Response the loopback server writes back for one request.
struct RouteResponse {
    status: u16,
    body: &'static str,
}

/// Implements the original's exact redirect-handling branches. The `state`
/// check runs first and unconditionally; the pending callback fires at
/// most once regardless of how many further redirects arrive.
fn handle_route(
    auth: &AuthState,
    pending: &PendingCallback,
    path: &str,
    query: &HashMap<String, String>,
) -> RouteResponse {
    let pages = auth.config.pages;

    match query.get("state") {
        Some(state) if state == &auth.state => {}
        _ => {
            return RouteResponse {
                status: 401,
                body: pages.error,
            }
        }
    }

    if let Some(accepted) = query.get("accepted") {
        if let Some(callback) = pending.take() {
            if accepted == "true" && query.get("code").is_some() {
                let code = query.get("code").cloned().unwrap_or_default();
                callback(Ok(code));
            } else {
                let description = query.get("error").cloned().unwrap_or_default();
                callback(Err(Error::Bad(description)));
            }
        }
    }

    if query.contains_key("code") {
        RouteResponse {
            status: 200,
            body: pages.success,
        }
    } else if query.contains_key("error") {
        RouteResponse {
            status: 401,
            body: pages.error,
        }
    } else if path == format!("{}/login", auth.redirect_uri_path()) {
        RouteResponse {
            status: 200,
            body: pages.login,
        }
    } else {
        RouteResponse {
            status: 404,
            body: pages.error,
        }
    }
}

/// Parses the request line and query string of a single raw HTTP GET
/// request, e.g. `GET /callback?state=x&code=y HTTP/1.1`.
fn parse_request_line(line: &str) -> Option<(String, HashMap<String, String>)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    if method != "GET" {
        return None;
    }
    let target = parts.next()?;
    let (path, query_string) = target.split_once('?').unwrap_or((target, ""));
    let query = url::form_urlencoded::parse(query_string.as_bytes())
        .into_owned()
        .collect();
    Some((path.to_string(), query))
}

/// A running loopback redirect server. Dropping the handle aborts the
/// accept loop and releases the bound port.
pub struct AuthServerHandle {
    task: JoinHandle<()>,
}

impl Drop for AuthServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Binds a loopback HTTP server on `port` serving the redirect routes for
/// `auth`, invoking `pending`'s callback at most once.
pub async fn bind_callback_server(
    auth: Arc<AuthState>,
    pending: Arc<PendingCallback>,
    port: u16,
) -> Result<AuthServerHandle, Error> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    let task = tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            let auth = Arc::clone(&auth);
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                    return;
                }
                let Some((path, query)) = parse_request_line(request_line.trim_end()) else {
                    return;
                };
                let response = handle_route(&auth, &pending, &path, &query);
                let body = response.body;
                let status_line = match response.status {
                    200 => "200 OK",
                    401 => "401 Unauthorized",
                    404 => "404 Not Found",
                    _ => "500 Internal Server Error",
                };
                let out = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = write_half.write_all(out.as_bytes()).await;
            });
        }
    });

    Ok(AuthServerHandle { task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    fn test_auth() -> Arc<AuthState> {
        let config = AuthConfig {
            client_id: "id".into(),
            client_secret: "secret".to_string().into(),
            redirect_uri: "http://127.0.0.1:9000/callback".into(),
            urls: AuthUrls {
                authorize_url: "https://example.com/authorize".into(),
                token_url: "https://example.com/token".into(),
            },
            pages: HtmlPages::default(),
        };
        Arc::new(AuthState::new(config, &DefaultCrypto))
    }

    #[test]
    fn redirect_uri_path_is_everything_after_third_slash() {
        assert_eq!(redirect_uri_path("http://127.0.0.1:9000/callback"), "callback");
        assert_eq!(redirect_uri_path("http://host/a/b"), "a/b");
    }

    #[test]
    fn token_from_string_is_immediately_expired() {
        let token = Token::from_token_string("refresh-xyz");
        assert!(token.is_expired());
        assert_eq!(token.expires_in, -1);
    }

    #[test]
    fn state_mismatch_yields_401_and_never_invokes_callback() {
        let auth = test_auth();
        let fired = Arc::new(Mutex::new(false));
        let fired2 = Arc::clone(&fired);
        let pending = PendingCallback::new(move |_| *fired2.lock().unwrap() = true);

        let mut query = HashMap::new();
        query.insert("state".to_string(), "wrong".to_string());
        query.insert("code".to_string(), "foo".to_string());
        query.insert("accepted".to_string(), "true".to_string());

        let response = handle_route(&auth, &pending, "callback", &query);
        assert_eq!(response.status, 401);
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn happy_path_invokes_callback_exactly_once_with_code() {
        let auth = test_auth();
        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let pending = PendingCallback::new(move |result| *observed2.lock().unwrap() = Some(result));

        let mut query = HashMap::new();
        query.insert("state".to_string(), auth.state.clone());
        query.insert("code".to_string(), "C".to_string());
        query.insert("accepted".to_string(), "true".to_string());

        let response = handle_route(&auth, &pending, "callback", &query);
        assert_eq!(response.status, 200);
        assert!(matches!(observed.lock().unwrap().take(), Some(Ok(code)) if code == "C"));

        // A replay with the same query must not fire the callback again —
        // it was already taken.
        let second = handle_route(&auth, &pending, "callback", &query);
        assert_eq!(second.status, 200);
        assert!(observed.lock().unwrap().is_none());
    }

    #[test]
    fn accepted_without_true_delivers_bad_error() {
        let auth = test_auth();
        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let pending = PendingCallback::new(move |result| *observed2.lock().unwrap() = Some(result));

        let mut query = HashMap::new();
        query.insert("state".to_string(), auth.state.clone());
        query.insert("accepted".to_string(), "false".to_string());
        query.insert("error".to_string(), "access_denied".to_string());

        let response = handle_route(&auth, &pending, "callback", &query);
        assert_eq!(response.status, 401);
        match observed.lock().unwrap().take() {
            Some(Err(Error::Bad(desc))) => assert_eq!(desc, "access_denied"),
            other => panic!("expected Bad error, got {other:?}"),
        }
    }

    #[test]
    fn login_route_serves_login_page() {
        let auth = test_auth();
        let pending = PendingCallback::new(|_| {});
        let mut query = HashMap::new();
        query.insert("state".to_string(), auth.state.clone());
        let response = handle_route(&auth, &pending, "callback/login", &query);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn unmatched_route_is_404() {
        let auth = test_auth();
        let pending = PendingCallback::new(|_| {});
        let mut query = HashMap::new();
        query.insert("state".to_string(), auth.state.clone());
        let response = handle_route(&auth, &pending, "callback/unknown", &query);
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn refresh_storm_performs_exactly_one_network_call() {
        use crate::event_loop::ThreadEventLoop;
        use crate::http::FakeHttp;
        use crate::thread_pool::ThreadPool;
        use std::time::Duration;

        let auth = test_auth();
        auth.set_token(Token::from_token_string("stale-refresh"));

        let fake = Arc::new(FakeHttp::new());
        fake.on(
            Method::Post,
            "https://example.com/token",
            Ok(crate::http::HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: bytes::Bytes::from(
                    r#"{"access_token":"new-access","refresh_token":"new-refresh","expires_in":3600}"#,
                ),
            }),
        );

        let ctx = RequestContext {
            http: fake,
            thread_pool: Arc::new(ThreadPool::new(4)),
            event_loop: Arc::new(ThreadEventLoop::new()),
        };

        let requests: Vec<Request<Token>> = (0..5).map(|_| auth.get_valid_token(&ctx)).collect();

        let results = Arc::new(Mutex::new(Vec::new()));
        for request in requests {
            let results = Arc::clone(&results);
            let _disposed: Request<()> = request.then(move |result| {
                results.lock().unwrap().push(result);
                Ok(())
            });
        }

        // Drain the event loop until all five replays have landed.
        for _ in 0..50 {
            ctx.event_loop.process_events();
            if results.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 5);
        for result in results.iter() {
            assert_eq!(result.as_ref().unwrap().access_token.expose_secret(), "new-access");
        }

        let recorded = match &*auth.inflight_refresh.lock().unwrap() {
            None => true,
            Some(_) => false,
        };
        assert!(recorded, "refresh coordinator must clear after completion");
    }
}
