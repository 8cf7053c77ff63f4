//! `CloudAccess`: an authenticated session handle bound to one provider,
//! exposing the uniform verb surface every consumer programs against.

use std::sync::Arc;

use crate::error::Error;
use crate::item::Item;
use crate::provider::{GeneralData, Page, ProviderContext, ProviderVTable};
use crate::request::{DownloadCallback, Request, UploadCallback};

/// A handle binding a user's authenticated session to a provider. Owns its
/// auth state and inherits the factory's HTTP, crypto, and thread-pool
/// capabilities via [`ProviderContext`]; shared between the factory and any
/// outstanding `Request` it has produced.
#[derive(Clone)]
pub struct CloudAccess {
    ctx: ProviderContext,
    vtable: Arc<ProviderVTable>,
}

impl CloudAccess {
    pub fn new(ctx: ProviderContext, vtable: Arc<ProviderVTable>) -> Self {
        CloudAccess { ctx, vtable }
    }

    pub fn name(&self) -> &'static str {
        self.vtable.name
    }

    pub fn root(&self) -> Item {
        self.vtable.root_item.clone()
    }

    pub fn authorize_library_url(&self) -> String {
        self.ctx.auth.authorize_library_url()
    }

    /// Account-level quota/identity metadata. Resolves to
    /// `GeneralData::default()` without any network call for providers
    /// that don't expose it.
    pub fn general_data(&self) -> Request<GeneralData> {
        match &self.vtable.general_data {
            Some(f) => f(&self.ctx),
            None => Request::ready(Arc::clone(&self.ctx.request.event_loop), Ok(GeneralData::default())),
        }
    }

    /// Resolves a provider-scoped id (as returned by a prior `list_directory`
    /// or `get_item`) into a fresh `Item`.
    pub fn get_item(&self, id: impl Into<String>) -> Request<Item> {
        (self.vtable.get_item_data)(&self.ctx, id.into())
    }

    /// Lists one page of `directory`'s content. Pass the prior page's
    /// `next_page_token` to continue; `None` for the first page.
    pub fn list_directory(&self, directory: Item, page_token: Option<String>) -> Request<Page> {
        (self.vtable.list_directory)(&self.ctx, directory, page_token)
    }

    /// Lists the complete content of `directory` by following
    /// `next_page_token` until exhausted, concatenating every page in
    /// order with no item repeated.
    pub fn list_directory_all(&self, directory: Item) -> Request<Vec<Item>> {
        self.list_directory_all_from(directory, None, Vec::new())
    }

    fn list_directory_all_from(
        &self,
        directory: Item,
        page_token: Option<String>,
        mut accumulated: Vec<Item>,
    ) -> Request<Vec<Item>> {
        let access = self.clone();
        self.list_directory(directory.clone(), page_token)
            .and_then(move |result| {
                let event_loop = Arc::clone(&access.ctx.request.event_loop);
                match result {
                    Ok(page) => {
                        accumulated.extend(page.items);
                        match page.next_page_token {
                            Some(token) => {
                                access.list_directory_all_from(directory, Some(token), accumulated)
                            }
                            None => Request::ready(event_loop, Ok(accumulated)),
                        }
                    }
                    Err(e) => Request::ready(event_loop, Err(e)),
                }
            })
    }

    /// The returned `Request<()>` shares its cancellation flag with the
    /// provider's HTTP hop (see `Request::then`): cancelling it before the
    /// hop resolves aborts the in-flight transport and skips `sink` entirely
    /// rather than delivering data after the fact.
    pub fn download_file(
        &self,
        item: Item,
        mut sink: Box<dyn DownloadCallback>,
    ) -> Request<()> {
        (self.vtable.download_file)(&self.ctx, item).then(move |result| match result {
            Ok(response) => {
                let total = response
                    .header("Content-Length")
                    .and_then(|s| s.parse::<u64>().ok());
                sink.received_data(&response.body);
                sink.progress(total, response.body.len() as u64);
                sink.done();
                Ok(())
            }
            Err(e) => {
                sink.error(&e.to_string());
                Err(e)
            }
        })
    }

    pub fn upload_file(
        &self,
        parent: Item,
        name: impl Into<String>,
        mut source: Box<dyn UploadCallback>,
    ) -> Request<Item> {
        source.reset();
        let total = source.size();
        let mut buffer = vec![0u8; 64 * 1024];
        let mut bytes = Vec::new();
        loop {
            let n = source.put_data(&mut buffer);
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buffer[..n]);
            source.progress(total, bytes.len() as u64);
        }
        let vtable = Arc::clone(&self.vtable);
        let ctx = self.ctx.clone();
        (vtable.upload_file)(&ctx, parent, name.into(), bytes).then(move |result| {
            match &result {
                Ok(_) => source.done(),
                Err(e) => source.error(&e.to_string()),
            }
            result
        })
    }

    pub fn create_directory(&self, parent: Item, name: impl Into<String>) -> Request<Item> {
        (self.vtable.create_directory)(&self.ctx, parent, name.into())
    }

    pub fn delete_item(&self, item: Item) -> Request<()> {
        (self.vtable.delete_item)(&self.ctx, item)
    }

    pub fn move_item(&self, item: Item, destination: Item) -> Request<Item> {
        (self.vtable.move_item)(&self.ctx, item, destination)
    }

    /// `rename(item, item.filename)` is a no-op: the result equals the
    /// input item, without issuing a request.
    pub fn rename_item(&self, item: Item, new_name: impl Into<String>) -> Request<Item> {
        let new_name = new_name.into();
        if new_name == item.filename {
            return Request::ready(Arc::clone(&self.ctx.request.event_loop), Ok(item));
        }
        (self.vtable.rename_item)(&self.ctx, item, new_name)
    }

    pub fn get_thumbnail(&self, item: Item) -> Request<Vec<u8>> {
        (self.vtable.get_thumbnail)(&self.ctx, item)
    }

    /// Provider-local streaming URL for `item`, e.g. AnimeZone's direct
    /// media link — no byte transfer through this library.
    pub fn get_daemon_url(&self, item: Item) -> Request<String> {
        (self.vtable.get_item_url)(&self.ctx, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, AuthState, AuthUrls, HtmlPages};
    use crate::crypto::DefaultCrypto;
    use crate::event_loop::ThreadEventLoop;
    use crate::http::FakeHttp;
    use crate::request::RequestContext;
    use crate::thread_pool::ThreadPool;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_access(vtable: ProviderVTable) -> CloudAccess {
        let auth_config = AuthConfig {
            client_id: "id".into(),
            client_secret: "secret".to_string().into(),
            redirect_uri: "http://127.0.0.1:9000/callback".into(),
            urls: AuthUrls {
                authorize_url: "https://example.com/authorize".into(),
                token_url: "https://example.com/token".into(),
            },
            pages: HtmlPages::default(),
        };
        let auth = Arc::new(AuthState::new(auth_config, &DefaultCrypto));
        let ctx = ProviderContext {
            request: RequestContext {
                http: Arc::new(FakeHttp::new()),
                thread_pool: Arc::new(ThreadPool::new(2)),
                event_loop: Arc::new(ThreadEventLoop::new()),
            },
            auth,
            base_url: "https://example.com".into(),
        };
        CloudAccess::new(ctx, Arc::new(vtable))
    }

    fn paging_vtable(pages: Vec<(Vec<Item>, Option<&'static str>)>) -> ProviderVTable {
        let pages = Arc::new(Mutex::new(pages));
        ProviderVTable {
            name: "paging",
            root_item: Item::directory("0", "root"),
            general_data: None,
            get_item_data: Arc::new(|ctx, id| {
                Request::ready(Arc::clone(&ctx.request.event_loop), Ok(Item::directory(id, "x")))
            }),
            list_directory: Arc::new(move |ctx, _item, token| {
                let index = token.as_deref().and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
                let pages = pages.lock().unwrap();
                let (items, next) = pages.get(index).cloned().unwrap_or_default();
                let next_page_token = next.map(|_| (index + 1).to_string());
                Request::ready(
                    Arc::clone(&ctx.request.event_loop),
                    Ok(Page { items, next_page_token }),
                )
            }),
            download_file: Arc::new(|ctx, _item| {
                Request::ready(
                    Arc::clone(&ctx.request.event_loop),
                    Err(Error::Bad("unsupported".into())),
                )
            }),
            upload_file: Arc::new(|ctx, _parent, name, bytes| {
                Request::ready(Arc::clone(&ctx.request.event_loop), Ok(Item::file("1", name, bytes.len() as u64)))
            }),
            create_directory: Arc::new(|ctx, _parent, name| {
                Request::ready(Arc::clone(&ctx.request.event_loop), Ok(Item::directory("2", name)))
            }),
            delete_item: Arc::new(|ctx, _item| Request::ready(Arc::clone(&ctx.request.event_loop), Ok(()))),
            move_item: Arc::new(|ctx, item, _dest| Request::ready(Arc::clone(&ctx.request.event_loop), Ok(item))),
            rename_item: Arc::new(|ctx, item, name| {
                Request::ready(Arc::clone(&ctx.request.event_loop), Ok(item.renamed(name)))
            }),
            get_thumbnail: Arc::new(|ctx, _item| Request::ready(Arc::clone(&ctx.request.event_loop), Ok(Vec::new()))),
            get_item_url: Arc::new(|ctx, _item| {
                Request::ready(Arc::clone(&ctx.request.event_loop), Ok("https://example.com/x".to_string()))
            }),
        }
    }

    fn drain<T>(access: &CloudAccess, observed: &Arc<Mutex<Option<T>>>) {
        for _ in 0..50 {
            access.ctx.request.event_loop.process_events();
            if observed.lock().unwrap().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn rename_to_same_name_is_a_no_op_without_a_request() {
        let access = test_access(paging_vtable(Vec::new()));
        let item = Item::file("1", "same.txt", 4);
        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _disposed: Request<()> =
            access.rename_item(item.clone(), "same.txt").then(move |result| {
                *observed2.lock().unwrap() = Some(result);
                Ok(())
            });
        drain(&access, &observed);
        assert_eq!(observed.lock().unwrap().take(), Some(Ok(item)));
    }

    #[test]
    fn list_directory_all_concatenates_pages_with_no_repeats() {
        let a = Item::file("a", "a.txt", 1);
        let b = Item::file("b", "b.txt", 1);
        let c = Item::file("c", "c.txt", 1);
        let access = test_access(paging_vtable(vec![
            (vec![a.clone(), b.clone()], Some("more")),
            (vec![c.clone()], None),
        ]));
        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _disposed: Request<()> = access
            .list_directory_all(Item::directory("0", "root"))
            .then(move |result| {
                *observed2.lock().unwrap() = Some(result);
                Ok(())
            });
        drain(&access, &observed);
        let items = observed.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(items, vec![a, b, c]);
    }

    struct MemoryUpload {
        data: Vec<u8>,
        offset: usize,
        progress_calls: Vec<u64>,
        done_calls: usize,
    }

    impl UploadCallback for MemoryUpload {
        fn reset(&mut self) {
            self.offset = 0;
        }

        fn size(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        fn put_data(&mut self, buf: &mut [u8]) -> usize {
            let remaining = &self.data[self.offset..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.offset += n;
            n
        }

        fn progress(&mut self, _total: Option<u64>, now: u64) {
            self.progress_calls.push(now);
        }

        fn done(&mut self) {
            self.done_calls += 1;
        }

        fn error(&mut self, _description: &str) {}
    }

    struct MemoryDownload {
        received: Vec<u8>,
        final_progress: Option<u64>,
        done_calls: usize,
    }

    impl DownloadCallback for MemoryDownload {
        fn received_data(&mut self, chunk: &[u8]) {
            self.received.extend_from_slice(chunk);
        }

        fn progress(&mut self, _total: Option<u64>, now: u64) {
            self.final_progress = Some(now);
        }

        fn done(&mut self) {
            self.done_calls += 1;
        }

        fn error(&mut self, _description: &str) {}
    }

    #[test]
    fn upload_then_download_round_trips_bytes_with_single_done_callbacks() {
        let access = test_access(paging_vtable(Vec::new()));
        let payload = b"dupa".to_vec();

        let upload_source = Arc::new(Mutex::new(MemoryUpload {
            data: payload.clone(),
            offset: 0,
            progress_calls: Vec::new(),
            done_calls: 0,
        }));

        struct ProxyUpload(Arc<Mutex<MemoryUpload>>);
        impl UploadCallback for ProxyUpload {
            fn reset(&mut self) {
                self.0.lock().unwrap().reset()
            }
            fn size(&self) -> Option<u64> {
                self.0.lock().unwrap().size()
            }
            fn put_data(&mut self, buf: &mut [u8]) -> usize {
                self.0.lock().unwrap().put_data(buf)
            }
            fn progress(&mut self, total: Option<u64>, now: u64) {
                self.0.lock().unwrap().progress(total, now)
            }
            fn done(&mut self) {
                self.0.lock().unwrap().done()
            }
            fn error(&mut self, description: &str) {
                self.0.lock().unwrap().error(description)
            }
        }

        let uploaded_item = Arc::new(Mutex::new(None));
        let uploaded_item2 = Arc::clone(&uploaded_item);
        let _disposed: Request<()> = access
            .upload_file(Item::directory("0", "root"), "test", Box::new(ProxyUpload(Arc::clone(&upload_source))))
            .then(move |result| {
                *uploaded_item2.lock().unwrap() = Some(result);
                Ok(())
            });
        drain(&access, &uploaded_item);
        let item = uploaded_item.lock().unwrap().take().unwrap().unwrap();
        assert_eq!(item.size, Some(4));

        let source = upload_source.lock().unwrap();
        assert_eq!(source.done_calls, 1);
        assert_eq!(source.progress_calls.last(), Some(&4));
        drop(source);

        // Point this access's `download_file` hook at the uploaded bytes and
        // drive the real `CloudAccess::download_file` path, so the
        // `received_data`/`progress`/`done` invariants are checked against
        // production code, not the callback trait in isolation.
        let payload_for_download = payload.clone();
        let download_access = CloudAccess::new(
            access.ctx.clone(),
            Arc::new(ProviderVTable {
                download_file: Arc::new(move |ctx, _item| {
                    Request::ready(
                        Arc::clone(&ctx.request.event_loop),
                        Ok(crate::http::HttpResponse {
                            status: 200,
                            headers: vec![("Content-Length".to_string(), "4".to_string())],
                            body: bytes::Bytes::from(payload_for_download.clone()),
                        }),
                    )
                }),
                ..paging_vtable(Vec::new())
            }),
        );

        let sink = Arc::new(Mutex::new(MemoryDownload {
            received: Vec::new(),
            final_progress: None,
            done_calls: 0,
        }));

        struct ProxyDownload(Arc<Mutex<MemoryDownload>>);
        impl DownloadCallback for ProxyDownload {
            fn received_data(&mut self, chunk: &[u8]) {
                self.0.lock().unwrap().received_data(chunk)
            }
            fn progress(&mut self, total: Option<u64>, now: u64) {
                self.0.lock().unwrap().progress(total, now)
            }
            fn done(&mut self) {
                self.0.lock().unwrap().done()
            }
            fn error(&mut self, description: &str) {
                self.0.lock().unwrap().error(description)
            }
        }

        let download_done = Arc::new(Mutex::new(None));
        let download_done2 = Arc::clone(&download_done);
        let _disposed: Request<()> = download_access
            .download_file(item, Box::new(ProxyDownload(Arc::clone(&sink))))
            .then(move |result| {
                *download_done2.lock().unwrap() = Some(result);
                Ok(())
            });
        drain(&download_access, &download_done);
        download_done.lock().unwrap().take().unwrap().unwrap();

        let sink = sink.lock().unwrap();
        assert_eq!(sink.received, payload);
        assert_eq!(sink.final_progress, Some(4));
        assert_eq!(sink.done_calls, 1);
    }

    #[test]
    fn download_cancelled_before_hop_resolves_skips_sink_and_reports_aborted() {
        let access = test_access(paging_vtable(Vec::new()));
        let event_loop = Arc::clone(&access.ctx.request.event_loop);
        let (hop, hop_completer) = Request::<crate::http::HttpResponse>::pending(Arc::clone(&event_loop));
        let hop_clone = hop.clone();
        let hop_holder = Arc::new(Mutex::new(Some(hop)));

        let download_access = CloudAccess::new(
            access.ctx.clone(),
            Arc::new(ProviderVTable {
                download_file: Arc::new(move |_ctx, _item| hop_holder.lock().unwrap().take().unwrap()),
                ..paging_vtable(Vec::new())
            }),
        );

        let sink = Arc::new(Mutex::new(MemoryDownload {
            received: Vec::new(),
            final_progress: None,
            done_calls: 0,
        }));

        struct ProxyDownload(Arc<Mutex<MemoryDownload>>);
        impl DownloadCallback for ProxyDownload {
            fn received_data(&mut self, chunk: &[u8]) {
                self.0.lock().unwrap().received_data(chunk)
            }
            fn progress(&mut self, total: Option<u64>, now: u64) {
                self.0.lock().unwrap().progress(total, now)
            }
            fn done(&mut self) {
                self.0.lock().unwrap().done()
            }
            fn error(&mut self, description: &str) {
                self.0.lock().unwrap().error(description)
            }
        }

        let item = Item::file("1", "stalled.bin", 4);
        let outer = download_access.download_file(item, Box::new(ProxyDownload(Arc::clone(&sink))));

        // Cancel before the stalled hop ever resolves — this is the flag
        // `HttpCapability::execute` polls on a real transport.
        outer.cancel();
        assert!(hop_clone.is_cancelled());

        let observed = Arc::new(Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        let _disposed: Request<()> = outer.then(move |result| {
            *observed2.lock().unwrap() = Some(result);
            Ok(())
        });

        // The hop "arrives late" after cancellation, as a stalled transport
        // finally delivering bytes nobody wants anymore.
        hop_completer.complete(Ok(crate::http::HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: bytes::Bytes::from(b"too late".to_vec()),
        }));

        drain(&download_access, &observed);
        assert!(matches!(observed.lock().unwrap().take(), Some(Err(Error::Aborted))));

        let sink = sink.lock().unwrap();
        assert!(sink.received.is_empty());
        assert_eq!(sink.done_calls, 0);
    }
}
