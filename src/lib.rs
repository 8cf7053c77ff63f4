//! `cloudaccess`: a unified async client library over heterogeneous
//! cloud-storage back-ends (Box, Mega, Google Drive, AnimeZone, and other
//! providers following the same shape).
//!
//! Four pieces compose the public surface:
//!
//! - [`request`] — the promise-like [`Request<T>`](request::Request) engine
//!   every verb returns, with retry, cancellation, and streaming support.
//! - [`provider`]/`providers` — the [`ProviderVTable`](provider::ProviderVTable)
//!   capability-record adapter framework and its concrete implementations.
//! - [`auth`] — the OAuth 2.0 authorization-code flow, including the
//!   loopback redirect server.
//! - [`event_loop`]/[`thread_pool`] — the cooperative scheduler and the
//!   blocking-I/O worker pool bridging into it.
//!
//! [`cloud_factory::CloudFactory`] ties these together: it builds
//! [`cloud_access::CloudAccess`] sessions on demand and persists their
//! refresh tokens.

pub mod auth;
pub mod cloud_access;
pub mod cloud_factory;
pub mod crypto;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod item;
pub mod provider;
pub mod providers;
pub mod request;
pub mod thread_pool;

pub use cloud_access::CloudAccess;
pub use cloud_factory::{CloudFactory, InitData, ProviderRegistration};
pub use crypto::{CryptoCapability, DefaultCrypto};
pub use error::Error;
pub use event_loop::{EventLoop, ThreadEventLoop};
pub use http::{HttpCapability, ReqwestHttp};
pub use item::{Item, ItemKind};
pub use provider::{GeneralData, Page, ProviderContext, ProviderVTable};
pub use request::{DownloadCallback, Request, RequestContext, UploadCallback};
pub use thread_pool::ThreadPool;
