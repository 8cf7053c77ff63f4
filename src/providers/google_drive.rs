//! Google Drive adapter: OAuth2, `nextPageToken` cursor-based pagination —
//! contrasted deliberately with Box's `offset`/`limit` to demonstrate that
//! pagination is entirely provider-defined, not baked into the engine.
//!
//! Grounded in the teacher's `providers/google_drive.rs` (`DriveFile`,
//! `DriveFileList` camelCase serde shape, `nextPageToken`).

use std::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{AuthConfig, AuthUrls, HtmlPages};
use crate::cloud_factory::ProviderRegistration;
use crate::error::Error;
use crate::http::{HttpRequest, Method};
use crate::item::{Item, ItemKind};
use crate::provider::{GeneralData, Page, ProviderContext, ProviderVTable};
use crate::request::Request;

use super::parse_timestamp;

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FIELDS: &str = "id,name,mimeType,size,modifiedTime";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    modified_time: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct DriveAbout {
    #[serde(rename = "storageQuota")]
    storage_quota: DriveStorageQuota,
    user: DriveUser,
}

#[derive(Deserialize)]
struct DriveStorageQuota {
    #[serde(default)]
    usage: Option<String>,
    #[serde(default)]
    limit: Option<String>,
}

#[derive(Deserialize)]
struct DriveUser {
    #[serde(rename = "emailAddress")]
    email_address: Option<String>,
}

fn to_item(v: &DriveFile) -> Item {
    let kind = if v.mime_type == FOLDER_MIME_TYPE {
        ItemKind::Directory
    } else {
        v.name
            .rsplit_once('.')
            .map(|(_, ext)| ItemKind::from_extension(ext))
            .unwrap_or(ItemKind::Unknown)
    };
    Item {
        id: v.id.clone(),
        filename: v.name.clone(),
        size: v.size.as_deref().and_then(|s| s.parse().ok()),
        modified: v.modified_time.as_deref().and_then(parse_timestamp),
        kind,
        content_url: None,
    }
}

fn parse_item(body: &[u8]) -> Result<Item, Error> {
    let parsed: DriveFile = serde_json::from_slice(body)
        .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(body).into_owned()))?;
    Ok(to_item(&parsed))
}

fn bearer(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

fn general_data(ctx: &ProviderContext) -> Request<GeneralData> {
    ctx.send_authorized(|token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Get, format!("{API_BASE}/about")).header(name, value).query_param(
            "fields",
            "user,storageQuota",
        )
    })
    .then(|result| {
        let response = result?.into_result()?;
        let parsed: DriveAbout = serde_json::from_slice(&response.body)
            .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(&response.body).into_owned()))?;
        Ok(GeneralData {
            username: parsed.user.email_address,
            space_used: parsed.storage_quota.usage.and_then(|s| s.parse().ok()),
            space_total: parsed.storage_quota.limit.and_then(|s| s.parse().ok()),
        })
    })
}

fn get_item_data(ctx: &ProviderContext, id: String) -> Request<Item> {
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Get, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .query_param("fields", FIELDS)
    })
    .then(|result| {
        let response = result?.into_result()?;
        parse_item(&response.body)
    })
}

fn list_directory(ctx: &ProviderContext, item: Item, page_token: Option<String>) -> Request<Page> {
    let parent = item.id.clone();
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        let mut request = HttpRequest::new(Method::Get, format!("{API_BASE}/files"))
            .header(name, value)
            .query_param("q", format!("'{parent}' in parents and trashed = false"))
            .query_param("fields", format!("nextPageToken,files({FIELDS})"));
        if let Some(token) = &page_token {
            request = request.query_param("pageToken", token.clone());
        }
        request
    })
    .then(|result| {
        let response = result?.into_result()?;
        let parsed: DriveFileList = serde_json::from_slice(&response.body)
            .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(&response.body).into_owned()))?;
        Ok(Page {
            items: parsed.files.iter().map(to_item).collect(),
            next_page_token: parsed.next_page_token,
        })
    })
}

fn download_file(ctx: &ProviderContext, item: Item) -> Request<crate::http::HttpResponse> {
    let id = item.id;
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Get, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .query_param("alt", "media")
    })
}

fn upload_file(ctx: &ProviderContext, parent: Item, name: String, bytes: Vec<u8>) -> Request<Item> {
    const BOUNDARY: &str = "CloudAccessDriveBoundaryQ9z1";
    let metadata = json!({ "name": name, "parents": [parent.id] });
    let metadata_bytes = serde_json::to_vec(&metadata).unwrap_or_default();

    let mut body = Vec::new();
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(&metadata_bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes());
    body.extend_from_slice(&bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--").as_bytes());

    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Post, format!("{UPLOAD_BASE}/files"))
            .header(name, value)
            .header("Content-Type", format!("multipart/related; boundary={BOUNDARY}"))
            .query_param("uploadType", "multipart")
            .query_param("fields", FIELDS)
            .body(body.clone())
    })
    .then(|result| {
        let response = result?.into_result()?;
        parse_item(&response.body)
    })
}

fn create_directory(ctx: &ProviderContext, parent: Item, name: String) -> Request<Item> {
    let body = serde_json::to_vec(&json!({
        "name": name,
        "mimeType": FOLDER_MIME_TYPE,
        "parents": [parent.id],
    }))
    .unwrap_or_default();
    ctx.send_authorized(move |token| {
        let (header_name, value) = bearer(token);
        HttpRequest::new(Method::Post, format!("{API_BASE}/files"))
            .header(header_name, value)
            .header("Content-Type", "application/json")
            .query_param("fields", FIELDS)
            .body(body.clone())
    })
    .then(|result| {
        let response = result?.into_result()?;
        parse_item(&response.body)
    })
}

fn delete_item(ctx: &ProviderContext, item: Item) -> Request<()> {
    let id = item.id;
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Delete, format!("{API_BASE}/files/{id}")).header(name, value)
    })
    .then(|result| {
        result?.into_result()?;
        Ok(())
    })
}

fn move_item(ctx: &ProviderContext, source: Item, destination: Item) -> Request<Item> {
    let id = source.id.clone();
    let new_parent = destination.id.clone();
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Put, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .query_param("addParents", new_parent.clone())
            .query_param("fields", FIELDS)
    })
    .then(|result| {
        let response = result?.into_result()?;
        parse_item(&response.body)
    })
}

fn rename_item(ctx: &ProviderContext, item: Item, new_name: String) -> Request<Item> {
    let id = item.id.clone();
    let body = serde_json::to_vec(&json!({ "name": new_name })).unwrap_or_default();
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Put, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .header("Content-Type", "application/json")
            .query_param("fields", FIELDS)
            .body(body.clone())
    })
    .then(|result| {
        let response = result?.into_result()?;
        parse_item(&response.body)
    })
}

fn get_thumbnail(ctx: &ProviderContext, item: Item) -> Request<Vec<u8>> {
    let id = item.id;
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Get, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .query_param("alt", "media")
            .query_param("fields", "thumbnailLink")
    })
    .then(|result| Ok(result?.into_result()?.body.to_vec()))
}

fn get_item_url(ctx: &ProviderContext, item: Item) -> Request<String> {
    let id = item.id;
    ctx.send_authorized(move |token| {
        let (name, value) = bearer(token);
        HttpRequest::new(Method::Get, format!("{API_BASE}/files/{id}"))
            .header(name, value)
            .query_param("fields", "webContentLink")
    })
    .then(|result| {
        let response = result?.into_result()?;
        #[derive(Deserialize)]
        struct Link {
            #[serde(rename = "webContentLink")]
            web_content_link: String,
        }
        let parsed: Link = serde_json::from_slice(&response.body)
            .map_err(|_| Error::ParseFailure(String::from_utf8_lossy(&response.body).into_owned()))?;
        Ok(parsed.web_content_link)
    })
}

fn vtable() -> ProviderVTable {
    ProviderVTable {
        name: "google",
        root_item: Item::directory("root", "root"),
        general_data: Some(Arc::new(general_data)),
        get_item_data: Arc::new(get_item_data),
        list_directory: Arc::new(list_directory),
        download_file: Arc::new(download_file),
        upload_file: Arc::new(upload_file),
        create_directory: Arc::new(create_directory),
        delete_item: Arc::new(delete_item),
        move_item: Arc::new(move_item),
        rename_item: Arc::new(rename_item),
        get_thumbnail: Arc::new(get_thumbnail),
        get_item_url: Arc::new(get_item_url),
    }
}

/// Builds the `ProviderRegistration` for Google Drive.
pub fn registration(
    client_id: impl Into<String>,
    client_secret: impl Into<SecretString>,
    redirect_uri: impl Into<String>,
) -> ProviderRegistration {
    ProviderRegistration {
        name: "google",
        build_vtable: Arc::new(vtable),
        auth_config: AuthConfig {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            urls: AuthUrls {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
            },
            pages: HtmlPages::default(),
        },
        credential_login: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthState, Token};
    use crate::crypto::DefaultCrypto;
    use crate::event_loop::ThreadEventLoop;
    use crate::http::FakeHttp;
    use crate::request::RequestContext;
    use crate::thread_pool::ThreadPool;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_context(fake: Arc<FakeHttp>) -> ProviderContext {
        let reg = registration("id", "secret".to_string(), "http://127.0.0.1:9001/callback");
        let auth = Arc::new(AuthState::new(reg.auth_config, &DefaultCrypto));
        auth.set_token(Token::new("access".into(), "refresh".into(), 3600));
        ProviderContext {
            request: RequestContext {
                http: fake,
                thread_pool: Arc::new(ThreadPool::new(2)),
                event_loop: Arc::new(ThreadEventLoop::new()),
            },
            auth,
            base_url: API_BASE.to_string(),
        }
    }

    fn drain<T>(ctx: &ProviderContext, observed: &Arc<Mutex<Option<T>>>) {
        for _ in 0..50 {
            ctx.request.event_loop.process_events();
            if observed.lock().unwrap().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn list_directory_follows_next_page_token() {
        let fake = Arc::new(FakeHttp::new());
        fake.on(
            Method::Get,
            format!("{API_BASE}/files"),
            Ok(crate::http::HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: bytes::Bytes::from(
                    r#"{"files":[{"id":"a","name":"A.txt","mimeType":"text/plain"}],"nextPageToken":"abc"}"#,
                ),
            }),
        );
        let ctx = test_context(fake);
        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _disposed: Request<()> = list_directory(&ctx, Item::directory("root", "root"), None)
            .then(move |result| {
                *observed2.lock().unwrap() = Some(result);
                Ok(())
            });
        drain(&ctx, &observed);
        let page = observed.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn folder_mime_type_classifies_as_directory() {
        let v = DriveFile {
            id: "1".into(),
            name: "Photos".into(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            size: None,
            modified_time: None,
        };
        assert!(to_item(&v).is_directory());
    }
}
