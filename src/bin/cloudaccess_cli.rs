//! cloudaccess CLI — drives a `CloudFactory` through one command at a time,
//! printing the result of whatever `.then()` chain the command builds.
//!
//! Usage:
//!   cloudaccess-cli providers                       List providers + consent URLs
//!   cloudaccess-cli authorize <provider> <code>      Complete an OAuth2 exchange
//!   cloudaccess-cli login <provider> <user> <pass>   Complete a credential login (Mega)
//!   cloudaccess-cli ls <provider> [item-id]          List a directory's full content
//!   cloudaccess-cli get-url <provider> <item-id>     Resolve a direct/streaming URL
//!   cloudaccess-cli get <provider> <item-id> <local>  Download a file
//!   cloudaccess-cli put <provider> <parent-id> <local> [name]  Upload a file
//!
//! Box and Google Drive only appear in `providers` once their OAuth2 client
//! id/secret are present in the environment (`BOX_CLIENT_ID`/
//! `BOX_CLIENT_SECRET`, `GOOGLE_CLIENT_ID`/`GOOGLE_CLIENT_SECRET`); Mega and
//! AnimeZone need no such configuration. `BOX_REDIRECT_URI`/
//! `GOOGLE_REDIRECT_URI` override each provider's redirect URI explicitly;
//! `CLOUDACCESS_REDIRECT_URI_BASE` instead sets the factory-wide
//! `InitData::redirect_uri_base` fallback used by any registration that
//! doesn't supply its own. Sessions persist across runs in `config.json`,
//! the same `{provider: refresh_token}` shape the original library's
//! samples use.

use std::fs::File;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};

use cloudaccess::crypto::DefaultCrypto;
use cloudaccess::error::Error;
use cloudaccess::event_loop::{EventLoop, ThreadEventLoop};
use cloudaccess::http::ReqwestHttp;
use cloudaccess::providers::{animezone, box_provider, google_drive, mega};
use cloudaccess::request::Request;
use cloudaccess::thread_pool::ThreadPool;
use cloudaccess::{CloudAccess, CloudFactory, InitData};

const CONFIG_PATH: &str = "config.json";

#[derive(Parser)]
#[command(
    name = "cloudaccess-cli",
    about = "cloudaccess CLI — drive cloud-storage providers through one promise-style interface",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every compiled-in provider and its consent URL
    Providers,
    /// Complete an OAuth2 authorization-code exchange for `provider`
    Authorize {
        provider: String,
        code: String,
    },
    /// Complete a username/password login for `provider` (Mega)
    Login {
        provider: String,
        username: String,
        password: String,
    },
    /// List a directory's full content (defaults to the provider's root)
    Ls {
        provider: String,
        item_id: Option<String>,
    },
    /// Resolve an item's direct/streaming URL
    GetUrl {
        provider: String,
        item_id: String,
    },
    /// Download an item to a local file
    Get {
        provider: String,
        item_id: String,
        local: PathBuf,
    },
    /// Upload a local file into `parent_id`
    Put {
        provider: String,
        parent_id: String,
        local: PathBuf,
        remote_name: Option<String>,
    },
}

fn build_factory(event_loop: Arc<ThreadEventLoop>) -> Arc<CloudFactory> {
    let init = InitData {
        base_url: std::env::var("CLOUDACCESS_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:12345".to_string()),
        http: Arc::new(ReqwestHttp::new()),
        crypto: Arc::new(DefaultCrypto),
        thread_pool: Arc::new(ThreadPool::new(4)),
        event_loop,
        redirect_uri_base: std::env::var("CLOUDACCESS_REDIRECT_URI_BASE").ok(),
    };

    let mut registrations = vec![animezone::registration(), mega::registration()];
    if let (Ok(id), Ok(secret)) = (std::env::var("BOX_CLIENT_ID"), std::env::var("BOX_CLIENT_SECRET")) {
        let redirect = std::env::var("BOX_REDIRECT_URI")
            .unwrap_or_else(|_| "http://127.0.0.1:12345/box/callback".to_string());
        registrations.push(box_provider::registration(id, secret, redirect));
    }
    if let (Ok(id), Ok(secret)) = (
        std::env::var("GOOGLE_CLIENT_ID"),
        std::env::var("GOOGLE_CLIENT_SECRET"),
    ) {
        let redirect = std::env::var("GOOGLE_REDIRECT_URI")
            .unwrap_or_else(|_| "http://127.0.0.1:12345/google/callback".to_string());
        registrations.push(google_drive::registration(id, secret, redirect));
    }

    let factory = CloudFactory::new(init, registrations);
    factory.on_cloud_created(|access: &CloudAccess| {
        tracing::info!(provider = access.name(), "session authorized");
    });
    factory.on_cloud_removed(|access: &CloudAccess| {
        tracing::info!(provider = access.name(), "session removed");
    });

    match File::open(CONFIG_PATH) {
        Ok(mut file) => {
            if let Err(e) = factory.load(&mut file) {
                tracing::warn!(error = %e, path = CONFIG_PATH, "failed to load persisted sessions");
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, path = CONFIG_PATH, "failed to open config"),
    }

    factory
}

fn save_factory(factory: &CloudFactory) {
    match File::create(CONFIG_PATH) {
        Ok(mut file) => {
            if let Err(e) = factory.dump(&mut file) {
                tracing::warn!(error = %e, path = CONFIG_PATH, "failed to persist sessions");
            }
        }
        Err(e) => tracing::warn!(error = %e, path = CONFIG_PATH, "failed to create config"),
    }
}

/// Pumps the event loop until `request` resolves or five minutes elapse —
/// a synchronous front end over the otherwise callback-driven engine,
/// standing in for `examples/promise/main.cpp`'s `loop.exec()` poll since
/// this CLI runs one command and exits rather than staying resident.
fn block_on<T: Send + 'static>(event_loop: &ThreadEventLoop, request: Request<T>) -> Result<T, Error> {
    let observed = Arc::new(Mutex::new(None));
    let observed2 = Arc::clone(&observed);
    let _disposed: Request<()> = request.then(move |result| {
        *observed2.lock().unwrap() = Some(result);
        Ok(())
    });
    for _ in 0..3000 {
        event_loop.process_events();
        if let Some(result) = observed.lock().unwrap().take() {
            return result;
        }
        event_loop.wait(Duration::from_millis(100));
    }
    Err(Error::Aborted)
}

fn session_or_exit(factory: &CloudFactory, provider: &str) -> CloudAccess {
    match factory.session(provider) {
        Some(access) => access,
        None => {
            eprintln!("no authorized session for '{provider}' — run `authorize` or `login` first");
            std::process::exit(1);
        }
    }
}

fn print_result<T: std::fmt::Debug>(result: Result<T, Error>) {
    match result {
        Ok(value) => println!("{value:#?}"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let event_loop = Arc::new(ThreadEventLoop::new());
    let factory = build_factory(Arc::clone(&event_loop));

    match cli.command {
        Commands::Providers => {
            for provider in factory.available_providers() {
                match factory.authorization_url(provider) {
                    Ok(url) => println!("{provider}: {url}"),
                    Err(e) => println!("{provider}: <no consent url: {e}>"),
                }
            }
        }
        Commands::Authorize { provider, code } => {
            match factory.complete_authorization(&provider, code) {
                Ok(request) => print_result(block_on(&event_loop, request).map(|access| access.name())),
                Err(e) => print_result::<()>(Err(e)),
            }
            save_factory(&factory);
        }
        Commands::Login {
            provider,
            username,
            password,
        } => {
            match factory.complete_credential_login(&provider, username, password) {
                Ok(request) => print_result(block_on(&event_loop, request).map(|access| access.name())),
                Err(e) => print_result::<()>(Err(e)),
            }
            save_factory(&factory);
        }
        Commands::Ls { provider, item_id } => {
            let access = session_or_exit(&factory, &provider);
            let root = access.root();
            let directory = match item_id {
                Some(id) => block_on(&event_loop, access.get_item(id)).unwrap_or(root),
                None => root,
            };
            print_result(block_on(&event_loop, access.list_directory_all(directory)));
        }
        Commands::GetUrl { provider, item_id } => {
            let access = session_or_exit(&factory, &provider);
            let item = match block_on(&event_loop, access.get_item(item_id)) {
                Ok(item) => item,
                Err(e) => return print_result::<()>(Err(e)),
            };
            print_result(block_on(&event_loop, access.get_daemon_url(item)));
        }
        Commands::Get {
            provider,
            item_id,
            local,
        } => {
            let access = session_or_exit(&factory, &provider);
            let item = match block_on(&event_loop, access.get_item(item_id)) {
                Ok(item) => item,
                Err(e) => return print_result::<()>(Err(e)),
            };
            let sink = FileDownload::create(local);
            print_result(block_on(&event_loop, access.download_file(item, Box::new(sink))));
        }
        Commands::Put {
            provider,
            parent_id,
            local,
            remote_name,
        } => {
            let access = session_or_exit(&factory, &provider);
            let parent = match block_on(&event_loop, access.get_item(parent_id)) {
                Ok(item) => item,
                Err(e) => return print_result::<()>(Err(e)),
            };
            let name = remote_name.unwrap_or_else(|| {
                local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string())
            });
            let source = match FileUpload::open(local) {
                Ok(source) => source,
                Err(e) => return print_result::<()>(Err(e)),
            };
            print_result(block_on(
                &event_loop,
                access.upload_file(parent, name, Box::new(source)),
            ));
        }
    }
}

/// Writes a download straight to a local file, logging progress the way
/// the original samples' `streamDownloader` callbacks do.
struct FileDownload {
    file: std::fs::File,
}

impl FileDownload {
    fn create(path: PathBuf) -> Self {
        let file = std::fs::File::create(&path)
            .unwrap_or_else(|e| panic!("cannot create {}: {e}", path.display()));
        FileDownload { file }
    }
}

impl cloudaccess::request::DownloadCallback for FileDownload {
    fn received_data(&mut self, chunk: &[u8]) {
        use std::io::Write;
        let _ = self.file.write_all(chunk);
    }

    fn progress(&mut self, total: Option<u64>, now: u64) {
        tracing::debug!(now, ?total, "download progress");
    }

    fn done(&mut self) {
        tracing::info!("download complete");
    }

    fn error(&mut self, description: &str) {
        tracing::warn!(description, "download failed");
    }
}

/// Reads a local file in fixed-size chunks as an upload source, the
/// counterpart to `FileDownload` above.
struct FileUpload {
    file: std::fs::File,
    size: Option<u64>,
}

impl FileUpload {
    fn open(path: PathBuf) -> Result<Self, Error> {
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::Bad(format!("cannot open {}: {e}", path.display())))?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(FileUpload { file, size })
    }
}

impl cloudaccess::request::UploadCallback for FileUpload {
    fn reset(&mut self) {
        use std::io::Seek;
        let _ = self.file.seek(std::io::SeekFrom::Start(0));
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn put_data(&mut self, buf: &mut [u8]) -> usize {
        use std::io::Read;
        self.file.read(buf).unwrap_or(0)
    }

    fn progress(&mut self, total: Option<u64>, now: u64) {
        tracing::debug!(now, ?total, "upload progress");
    }

    fn done(&mut self) {
        tracing::info!("upload complete");
    }

    fn error(&mut self, description: &str) {
        tracing::warn!(description, "upload failed");
    }
}
