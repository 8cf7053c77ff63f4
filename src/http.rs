//! The injected HTTP transport capability.
//!
//! The core never constructs a transport itself: every request is built
//! through an `HttpCapability`, which keeps the engine transport-agnostic
//! and lets tests run against [`FakeHttp`] instead of a real socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;

/// How often an in-flight hop polls its cancellation flag while waiting on
/// the transport. Short enough that a cancel is honored promptly without
/// burning a thread spinning.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// HTTP verb, kept narrow to what providers in this crate actually issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// A request description built by a provider's `build_request` hook.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        HttpRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            follow_redirects: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

/// The result of executing an [`HttpRequest`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Maps a non-2xx status into the uniform [`Error`] type, preserving the
    /// body text as the description.
    pub fn into_result(self) -> Result<HttpResponse, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            let description = String::from_utf8_lossy(&self.body).into_owned();
            Err(Error::HttpStatus(self.status, description))
        }
    }
}

/// The injected HTTP transport. One async call executes a fully-built
/// request and returns either a response or a transport-level failure —
/// HTTP status codes are not transport errors, they flow through
/// [`HttpResponse`].
#[async_trait]
pub trait HttpCapability: Send + Sync {
    /// `cancelled` is shared with the `Request<T>` this hop backs: if it
    /// flips to `true` before the exchange finishes, implementations should
    /// abort and return `Error::Aborted` rather than deliver a response.
    async fn execute(&self, request: HttpRequest, cancelled: Arc<AtomicBool>) -> Result<HttpResponse, Error>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Self {
        ReqwestHttp {
            client: reqwest::Client::new(),
        }
    }

    /// Races the cancellation flag against `fut`, polling it every
    /// [`CANCEL_POLL_INTERVAL`]. Returns `Err(Error::Aborted)` the moment the
    /// flag is observed set, without waiting for `fut` to finish.
    async fn race_cancellation<T>(
        cancelled: &Arc<AtomicBool>,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                result = &mut fut => return result,
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                    if cancelled.load(Ordering::SeqCst) {
                        return Err(Error::Aborted);
                    }
                }
            }
        }
    }
}

impl Default for ReqwestHttp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpCapability for ReqwestHttp {
    async fn execute(&self, request: HttpRequest, cancelled: Arc<AtomicBool>) -> Result<HttpResponse, Error> {
        if cancelled.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }

        let mut builder = self
            .client
            .request(
                reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                    .map_err(|e| Error::Bad(e.to_string()))?,
                &request.url,
            )
            .query(&request.query);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if !request.follow_redirects {
            tracing::debug!(url = %request.url, "redirect-following disabled for this request");
        }

        let response = Self::race_cancellation(
            &cancelled,
            async { builder.send().await.map_err(|e| Error::Transport(e.to_string())) },
        )
        .await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = Self::race_cancellation(
            &cancelled,
            async { response.bytes().await.map_err(|e| Error::Transport(e.to_string())) },
        )
        .await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Key under which a canned response is registered in [`FakeHttp`]: method
/// plus the exact URL a provider would build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: Method,
    url: String,
}

/// In-memory transport double. Maps `(method, url)` to a queue of canned
/// responses, consumed in FIFO order so a test can script a sequence (e.g.
/// "401 once, then 200") for the same route.
#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<RouteKey, std::collections::VecDeque<Result<HttpResponse, Error>>>>,
    recorded: Mutex<Vec<HttpRequest>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        FakeHttp {
            routes: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Registers one more canned response to be returned the next time
    /// `(method, url)` is executed.
    pub fn on(&self, method: Method, url: impl Into<String>, response: Result<HttpResponse, Error>) {
        let key = RouteKey {
            method,
            url: url.into(),
        };
        self.routes
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpCapability for FakeHttp {
    async fn execute(&self, request: HttpRequest, cancelled: Arc<AtomicBool>) -> Result<HttpResponse, Error> {
        if cancelled.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        self.recorded.lock().unwrap().push(request.clone());
        let key = RouteKey {
            method: request.method,
            url: request.url.clone(),
        };
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&key).and_then(|queue| queue.pop_front()) {
            Some(result) => result,
            None => Err(Error::Transport(format!(
                "no canned response for {} {}",
                request.method.as_str(),
                request.url
            ))),
        }
    }
}
