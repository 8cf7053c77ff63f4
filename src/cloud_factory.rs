//! `CloudFactory`: constructs providers on demand from an explicit
//! `InitData`, persists refresh tokens, and notifies the host when a
//! session becomes authorized or is discarded.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::auth::{AuthState, Token};
use crate::cloud_access::CloudAccess;
use crate::crypto::CryptoCapability;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::http::HttpCapability;
use crate::provider::{ProviderContext, ProviderVTable};
use crate::request::{Request, RequestContext};
use crate::thread_pool::ThreadPool;

/// Every capability the factory and the providers it builds depend on.
/// Nothing is read from global/ambient state except `redirect_uri_base`,
/// which the caller resolves once (e.g. from an env var) and passes in
/// here (mirroring the original's single file-scope `getenv` read)
/// rather than having the library re-read it per request.
pub struct InitData {
    pub base_url: String,
    pub http: Arc<dyn HttpCapability>,
    pub crypto: Arc<dyn CryptoCapability>,
    pub thread_pool: Arc<ThreadPool>,
    pub event_loop: Arc<dyn EventLoop>,
    /// Default redirect base (e.g. `http://127.0.0.1:12345`) applied to
    /// any provider registration that left `AuthConfig::redirect_uri`
    /// empty, as `{base}/{provider}/callback`. Stored on `CloudFactory`
    /// at construction and consulted every time an `AuthState` is built —
    /// never applied to a registration that already supplies its own
    /// `redirect_uri`.
    pub redirect_uri_base: Option<String>,
}

/// Registers how to build one provider's `AuthState`/`ProviderVTable` pair.
/// Kept separate from `ProviderVTable` itself since the vtable depends on a
/// constructed `ProviderContext`, which in turn needs the factory's shared
/// capabilities.
pub struct ProviderRegistration {
    pub name: &'static str,
    pub build_vtable: Arc<dyn Fn() -> ProviderVTable + Send + Sync>,
    pub auth_config: crate::auth::AuthConfig,
    /// Set only for providers whose auth is username/password-based (Mega)
    /// rather than an OAuth2 authorization-code exchange; drives
    /// [`CloudFactory::complete_credential_login`] instead of
    /// [`CloudFactory::complete_authorization`].
    pub credential_login:
        Option<Arc<dyn Fn(&RequestContext, String, String) -> Request<Token> + Send + Sync>>,
}

struct Session {
    access: CloudAccess,
    auth: Arc<AuthState>,
}

type CloudCallback = Arc<dyn Fn(&CloudAccess) + Send + Sync>;

/// Constructs `CloudAccess` handles on demand, tracks which providers are
/// currently authorized, and persists refresh tokens as a
/// `{provider: refresh_token}` JSON map.
pub struct CloudFactory {
    base_url: String,
    http: Arc<dyn HttpCapability>,
    crypto: Arc<dyn CryptoCapability>,
    thread_pool: Arc<ThreadPool>,
    event_loop: Arc<dyn EventLoop>,
    redirect_uri_base: Option<String>,
    registrations: HashMap<&'static str, ProviderRegistration>,
    sessions: RwLock<HashMap<String, Session>>,
    on_cloud_created: RwLock<Option<CloudCallback>>,
    on_cloud_removed: RwLock<Option<CloudCallback>>,
}

impl CloudFactory {
    pub fn new(init: InitData, registrations: Vec<ProviderRegistration>) -> Arc<Self> {
        Arc::new(CloudFactory {
            base_url: init.base_url,
            http: init.http,
            crypto: init.crypto,
            thread_pool: init.thread_pool,
            event_loop: init.event_loop,
            redirect_uri_base: init.redirect_uri_base,
            registrations: registrations.into_iter().map(|r| (r.name, r)).collect(),
            sessions: RwLock::new(HashMap::new()),
            on_cloud_created: RwLock::new(None),
            on_cloud_removed: RwLock::new(None),
        })
    }

    /// `registration.auth_config` with `redirect_uri_base` applied as a
    /// fallback default when the registration left `redirect_uri` empty,
    /// mirroring `original_source/src/Utility/Auth.cpp`'s
    /// `DEFAULT_REDIRECT_URI` seeding every `Auth`'s default before a
    /// caller-supplied value can override it.
    fn resolved_auth_config(&self, registration: &ProviderRegistration) -> crate::auth::AuthConfig {
        let mut auth_config = registration.auth_config.clone();
        if auth_config.redirect_uri.is_empty() {
            if let Some(base) = &self.redirect_uri_base {
                auth_config.redirect_uri = format!("{base}/{}/callback", registration.name);
            }
        }
        auth_config
    }

    /// Names of every compiled-in provider, regardless of authorization
    /// state.
    pub fn available_providers(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.registrations.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The consent URL for a fresh auth state on `provider`. If the
    /// provider already has an active session, returns that session's
    /// (already-generated) consent URL rather than minting a new CSRF
    /// state.
    pub fn authorization_url(&self, provider: &str) -> Result<String, Error> {
        let registration = self
            .registrations
            .get(provider)
            .ok_or_else(|| Error::NotFound(provider.to_string()))?;
        if let Some(session) = self.sessions.read().unwrap().get(provider) {
            return Ok(session.auth.authorize_library_url());
        }
        let auth = AuthState::new(self.resolved_auth_config(registration), self.crypto.as_ref());
        Ok(auth.authorize_library_url())
    }

    /// Registers a hook invoked on the event loop whenever a provider
    /// becomes authorized.
    pub fn on_cloud_created(&self, callback: impl Fn(&CloudAccess) + Send + Sync + 'static) {
        *self.on_cloud_created.write().unwrap() = Some(Arc::new(callback));
    }

    /// Registers a hook invoked on the event loop whenever a session is
    /// discarded.
    pub fn on_cloud_removed(&self, callback: impl Fn(&CloudAccess) + Send + Sync + 'static) {
        *self.on_cloud_removed.write().unwrap() = Some(Arc::new(callback));
    }

    fn request_context(&self) -> RequestContext {
        RequestContext {
            http: Arc::clone(&self.http),
            thread_pool: Arc::clone(&self.thread_pool),
            event_loop: Arc::clone(&self.event_loop),
        }
    }

    fn instantiate(&self, provider: &str, token: Token) -> Result<CloudAccess, Error> {
        let registration = self
            .registrations
            .get(provider)
            .ok_or_else(|| Error::NotFound(provider.to_string()))?;
        let auth = Arc::new(AuthState::new(
            self.resolved_auth_config(registration),
            self.crypto.as_ref(),
        ));
        auth.set_token(token);

        let ctx = ProviderContext {
            request: self.request_context(),
            auth: Arc::clone(&auth),
            base_url: self.base_url.clone(),
        };
        let vtable = Arc::new((registration.build_vtable)());
        let access = CloudAccess::new(ctx, vtable);

        self.sessions.write().unwrap().insert(
            provider.to_string(),
            Session {
                access: access.clone(),
                auth,
            },
        );

        if let Some(callback) = self.on_cloud_created.read().unwrap().clone() {
            let access_for_callback = access.clone();
            self.event_loop
                .post(Box::new(move || callback(&access_for_callback)));
        }

        Ok(access)
    }

    /// Completes an authorization-code exchange for `provider` and
    /// registers the resulting session.
    pub fn complete_authorization(
        self: &Arc<Self>,
        provider: &str,
        code: String,
    ) -> Result<Request<CloudAccess>, Error> {
        let registration = self
            .registrations
            .get(provider)
            .ok_or_else(|| Error::NotFound(provider.to_string()))?;
        let auth = Arc::new(AuthState::new(
            self.resolved_auth_config(registration),
            self.crypto.as_ref(),
        ));
        let request_ctx = self.request_context();
        let provider_owned = provider.to_string();
        let factory = Arc::clone(self);

        Ok(auth
            .exchange_authorization_code(&request_ctx, code)
            .and_then(move |result| {
                let event_loop = Arc::clone(&request_ctx.event_loop);
                match result {
                    Ok(token) => match factory.instantiate(&provider_owned, token) {
                        Ok(access) => Request::ready(event_loop, Ok(access)),
                        Err(e) => Request::ready(event_loop, Err(e)),
                    },
                    Err(e) => Request::ready(event_loop, Err(e)),
                }
            }))
    }

    /// Completes a username/password login for providers that register a
    /// `credential_login` hook (Mega) instead of an OAuth2 authorization
    /// code. Errors with `Error::Bad` if `provider` does not support it.
    pub fn complete_credential_login(
        self: &Arc<Self>,
        provider: &str,
        username: String,
        password: String,
    ) -> Result<Request<CloudAccess>, Error> {
        let registration = self
            .registrations
            .get(provider)
            .ok_or_else(|| Error::NotFound(provider.to_string()))?;
        let login = registration
            .credential_login
            .clone()
            .ok_or_else(|| Error::Bad(format!("{provider} does not support credential login")))?;
        let request_ctx = self.request_context();
        let provider_owned = provider.to_string();
        let factory = Arc::clone(self);

        Ok(login(&request_ctx, username, password).and_then(move |result| {
            let event_loop = Arc::clone(&request_ctx.event_loop);
            match result {
                Ok(token) => match factory.instantiate(&provider_owned, token) {
                    Ok(access) => Request::ready(event_loop, Ok(access)),
                    Err(e) => Request::ready(event_loop, Err(e)),
                },
                Err(e) => Request::ready(event_loop, Err(e)),
            }
        }))
    }

    pub fn session(&self, provider: &str) -> Option<CloudAccess> {
        self.sessions
            .read()
            .unwrap()
            .get(provider)
            .map(|s| s.access.clone())
    }

    /// Discards a session, invoking the `on_cloud_removed` hook on the
    /// event loop.
    pub fn remove_session(&self, provider: &str) {
        if let Some(session) = self.sessions.write().unwrap().remove(provider) {
            if let Some(callback) = self.on_cloud_removed.read().unwrap().clone() {
                self.event_loop
                    .post(Box::new(move || callback(&session.access)));
            }
        }
    }

    /// Persists every active session's refresh token as a
    /// `{provider: refresh_token}` JSON map.
    pub fn dump(&self, writer: &mut impl Write) -> Result<(), Error> {
        let sessions = self.sessions.read().unwrap();
        let mut map: HashMap<String, String> = HashMap::new();
        for (provider, session) in sessions.iter() {
            if let Some(token) = session.auth.current_token() {
                map.insert(provider.clone(), token.refresh_token.expose_secret().to_string());
            }
        }
        serde_json::to_writer(writer, &PersistedTokens(map)).map_err(|e| Error::Failure(e.to_string()))
    }

    /// Loads a `{provider: refresh_token}` JSON map, instantiating a
    /// session for every known provider name present and ignoring unknown
    /// ones.
    pub fn load(&self, reader: &mut impl Read) -> Result<(), Error> {
        let PersistedTokens(map): PersistedTokens =
            serde_json::from_reader(reader).map_err(|e| Error::ParseFailure(e.to_string()))?;
        for (provider, refresh_token) in map {
            if !self.registrations.contains_key(provider.as_str()) {
                continue;
            }
            let token = Token::from_token_string(refresh_token);
            self.instantiate(&provider, token)?;
        }
        Ok(())
    }
}

/// Serializable persisted-state shape backing `dump`/`load`: a
/// `{provider: refresh_token}` map, wrapped so the on-disk format has a
/// named type instead of a bare JSON object.
#[derive(Serialize, Deserialize)]
pub struct PersistedTokens(pub HashMap<String, String>);
