//! AnimeZone adapter: a minimal read-only provider exercising only
//! `get_item`/`get_daemon_url` — no pagination, no upload/download byte
//! transfer. Exists to demonstrate that the engine's generic verb surface
//! doesn't require every provider to implement every verb meaningfully.
//!
//! Grounded in `examples/original_source/examples/promise/main.cpp`:
//! `d->getItem(path).then([d](IItem::Pointer item){ return
//! d->getDaemonUrl(item); })` is the entire interaction this provider's
//! consumers perform — it never calls `listDirectory`, `uploadFile`, or
//! `downloadFile`. AnimeZone requires no OAuth2 consent screen either: the
//! registered `AuthConfig` carries placeholder URLs that are never visited,
//! matching a read-only catalog with no user account concept.

use std::sync::Arc;

use serde::Deserialize;

use crate::auth::{AuthConfig, AuthUrls, HtmlPages};
use crate::cloud_factory::ProviderRegistration;
use crate::error::Error;
use crate::http::{HttpRequest, Method};
use crate::item::{Item, ItemKind};
use crate::provider::{Page, ProviderContext, ProviderVTable};
use crate::request::Request;

const API_BASE: &str = "https://animezone.example/api";

#[derive(Deserialize)]
struct CatalogEntry {
    id: String,
    title: String,
}

#[derive(Deserialize)]
struct StreamLocation {
    url: String,
}

fn get_item_data(ctx: &ProviderContext, path: String) -> Request<Item> {
    ctx.request
        .send_request(move || {
            HttpRequest::new(Method::Get, format!("{API_BASE}/item")).query_param("path", path.clone())
        })
        .then(|result| {
            let response = result?.into_result()?;
            let entry: CatalogEntry = serde_json::from_slice(&response.body)
                .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(&response.body).into_owned()))?;
            Ok(Item {
                id: entry.id,
                filename: entry.title,
                size: None,
                modified: None,
                kind: ItemKind::Video,
                content_url: None,
            })
        })
}

/// AnimeZone resolves directly to a streaming URL — there is no
/// intermediate byte transfer through this library, so the generic
/// `download_file`/`upload_file`/`list_directory` verbs have nothing
/// meaningful to do here and surface `Error::Bad`.
fn unsupported<T: Send + 'static>(ctx: &ProviderContext) -> Request<T> {
    Request::ready(
        Arc::clone(&ctx.request.event_loop),
        Err(Error::Bad("animezone is a read-only catalog".to_string())),
    )
}

fn get_item_url(ctx: &ProviderContext, item: Item) -> Request<String> {
    let id = item.id;
    ctx.request
        .send_request(move || HttpRequest::new(Method::Get, format!("{API_BASE}/stream")).query_param("id", id.clone()))
        .then(|result| {
            let response = result?.into_result()?;
            let location: StreamLocation = serde_json::from_slice(&response.body)
                .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(&response.body).into_owned()))?;
            Ok(location.url)
        })
}

fn vtable() -> ProviderVTable {
    ProviderVTable {
        name: "animezone",
        root_item: Item::directory("/", "root"),
        general_data: None,
        get_item_data: Arc::new(get_item_data),
        list_directory: Arc::new(|ctx, _item, _token| unsupported::<Page>(ctx)),
        download_file: Arc::new(|ctx, _item| unsupported::<crate::http::HttpResponse>(ctx)),
        upload_file: Arc::new(|ctx, _parent, _name, _bytes| unsupported::<Item>(ctx)),
        create_directory: Arc::new(|ctx, _parent, _name| unsupported::<Item>(ctx)),
        delete_item: Arc::new(|ctx, _item| unsupported::<()>(ctx)),
        move_item: Arc::new(|ctx, _item, _dest| unsupported::<Item>(ctx)),
        rename_item: Arc::new(|ctx, _item, _name| unsupported::<Item>(ctx)),
        get_thumbnail: Arc::new(|ctx, _item| unsupported::<Vec<u8>>(ctx)),
        get_item_url: Arc::new(get_item_url),
    }
}

/// Builds the `ProviderRegistration` for AnimeZone. No real credentials are
/// needed; the placeholder `AuthConfig` exists only to satisfy
/// `ProviderRegistration`'s shape.
pub fn registration() -> ProviderRegistration {
    ProviderRegistration {
        name: "animezone",
        build_vtable: Arc::new(vtable),
        auth_config: AuthConfig {
            client_id: String::new(),
            client_secret: String::new().into(),
            redirect_uri: String::new(),
            urls: AuthUrls {
                authorize_url: "about:blank".to_string(),
                token_url: "about:blank".to_string(),
            },
            pages: HtmlPages::default(),
        },
        credential_login: None,
    }
}
