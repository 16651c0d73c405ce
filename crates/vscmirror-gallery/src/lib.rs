//! Marketplace- and update-compatible HTTP surface over the artifact store.
//!
//! Routes match what the editor's client library requests: the extension
//! query endpoint (both spellings), rewritten asset downloads, the update
//! API, commit-addressed binary redirects, and the recommendation/malicious
//! artifact passthroughs. Query answers come from the immutable snapshot
//! index; file serves stream straight from disk, which is safe against a
//! concurrent synchronizer because visible files are only ever renamed into
//! place.
//!
//! The [`TestServer`] helper starts a gallery on a random port for
//! integration testing.

pub mod index;
pub mod query;

pub use index::{build_snapshot, rewrite_asset_uris, Snapshot, StoreIndex};
pub use query::{execute, update_check, QueryOutcome, UpdateCheck};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, warn};
use vscmirror_schema::{asset, ExtensionId, ExtensionQuery, Quality, QueryResponse};
use vscmirror_store::StoreLayout;

const MAX_QUERY_BODY: usize = 1 << 20;

/// Parsed request target.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    Query,
    Asset {
        id: String,
        version: String,
        target_platform: Option<String>,
        asset_type: String,
    },
    Update {
        platform: String,
        quality: Quality,
        commit: String,
    },
    CommitRedirect {
        commit: String,
        platform: String,
        quality: Quality,
    },
    Binary {
        quality: Quality,
        platform: String,
        commit: String,
        filename: String,
    },
    Recommendations,
    MaliciousArtifact,
    Stats,
    Liveness,
}

fn safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
}

/// Map method + path to a route. Returns `None` for anything unrecognized;
/// the caller answers 404.
pub fn parse_route(method: &Method, path: &str) -> Option<Route> {
    let path = path.split(['?', '#']).next().unwrap_or(path);

    match (method, path) {
        (Method::Post, "/extensionquery" | "/_apis/public/gallery/extensionquery") => {
            return Some(Route::Query);
        }
        (Method::Post, "/stats") => return Some(Route::Stats),
        (Method::Get, "/") => return Some(Route::Liveness),
        (Method::Get, "/extensions/workspaceRecommendations.json.gz") => {
            return Some(Route::Recommendations);
        }
        (Method::Get, "/extensions/marketplace.json") => return Some(Route::MaliciousArtifact),
        _ => {}
    }
    if *method != Method::Get {
        return None;
    }

    if let Some(rest) = path.strip_prefix("/assets/") {
        let segments: Vec<&str> = rest.split('/').collect();
        if !segments.iter().all(|s| safe_segment(s)) {
            return None;
        }
        let (id, version, target_platform, asset_type) = match segments.as_slice() {
            [id, version, asset_type] => (*id, *version, None, *asset_type),
            [id, version, target, asset_type] => (*id, *version, Some(*target), *asset_type),
            _ => return None,
        };
        ExtensionId::parse(id).ok()?;
        return Some(Route::Asset {
            id: id.to_owned(),
            version: version.to_owned(),
            target_platform: target_platform.map(str::to_owned),
            asset_type: asset_type.to_owned(),
        });
    }

    if let Some(rest) = path.strip_prefix("/api/update/") {
        let segments: Vec<&str> = rest.split('/').collect();
        let [platform, quality, commit] = segments.as_slice() else {
            return None;
        };
        if !safe_segment(platform) || !safe_segment(commit) {
            return None;
        }
        return Some(Route::Update {
            platform: (*platform).to_owned(),
            quality: quality.parse().ok()?,
            commit: (*commit).to_owned(),
        });
    }

    if let Some(rest) = path.strip_prefix("/commit:") {
        let segments: Vec<&str> = rest.split('/').collect();
        let [commit, platform, quality] = segments.as_slice() else {
            return None;
        };
        if !safe_segment(commit) || !safe_segment(platform) {
            return None;
        }
        return Some(Route::CommitRedirect {
            commit: (*commit).to_owned(),
            platform: (*platform).to_owned(),
            quality: quality.parse().ok()?,
        });
    }

    if let Some(rest) = path.strip_prefix("/binaries/") {
        let segments: Vec<&str> = rest.split('/').collect();
        let [quality, platform, commit, filename] = segments.as_slice() else {
            return None;
        };
        if ![platform, commit, filename].iter().all(|s| safe_segment(s)) {
            return None;
        }
        return Some(Route::Binary {
            quality: quality.parse().ok()?,
            platform: (*platform).to_owned(),
            commit: (*commit).to_owned(),
            filename: (*filename).to_owned(),
        });
    }

    None
}

/// Content type for an asset stream, keyed off the asset-type string.
fn asset_content_type(asset_type: &str) -> &'static str {
    if asset_type.contains(".Icons.") {
        "image/png"
    } else if asset_type == asset::CODE_MANIFEST {
        "application/json"
    } else if asset_type.contains(".Content.") {
        "text/markdown"
    } else {
        "application/octet-stream"
    }
}

/// `bytes=a-b` / `bytes=a-` / `bytes=-n` against a known length; inclusive
/// bounds. Anything unparseable means "serve the whole file".
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?.trim();
    let (start, end) = spec.split_once('-')?;
    match (start.is_empty(), end.is_empty()) {
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            (start <= end && start < len).then(|| (start, end.min(len - 1)))
        }
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            (start < len).then(|| (start, len - 1))
        }
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            let suffix = suffix.min(len);
            (suffix > 0).then(|| (len - suffix, len - 1))
        }
        (true, true) => None,
    }
}

fn json_header() -> Header {
    Header::from_bytes("Content-Type", "application/json").expect("valid header")
}

fn respond_json(req: tiny_http::Request, body: impl Into<Vec<u8>>) {
    let _ = req.respond(Response::from_data(body.into()).with_header(json_header()));
}

fn respond_error(req: tiny_http::Request, code: u16, message: &str) {
    let body = serde_json::json!({ "error": message }).to_string();
    let _ = req.respond(
        Response::from_string(body)
            .with_header(json_header())
            .with_status_code(StatusCode(code)),
    );
}

/// The gallery service: snapshot index plus direct store access for file
/// serves.
pub struct Gallery {
    layout: StoreLayout,
    index: Arc<StoreIndex>,
    /// External base URL prefixed to rewritten download locations; empty
    /// yields relative URLs.
    base: String,
}

impl Gallery {
    pub fn new(layout: StoreLayout, index: Arc<StoreIndex>, base: impl Into<String>) -> Self {
        Self {
            layout,
            index,
            base: base.into(),
        }
    }

    pub fn index(&self) -> &Arc<StoreIndex> {
        &self.index
    }

    pub fn handle(&self, mut req: tiny_http::Request) {
        let method = req.method().clone();
        let url = req.url().to_owned();
        debug!("{method} {url}");

        let Some(route) = parse_route(&method, &url) else {
            respond_error(req, 404, "not found");
            return;
        };

        match route {
            Route::Query => self.handle_query(req),
            Route::Asset {
                id,
                version,
                target_platform,
                asset_type,
            } => self.handle_asset(req, &id, &version, target_platform.as_deref(), &asset_type),
            Route::Update {
                platform,
                quality,
                commit,
            } => self.handle_update(req, &platform, quality, &commit),
            Route::CommitRedirect {
                commit,
                platform,
                quality,
            } => self.handle_commit_redirect(req, &commit, &platform, quality),
            Route::Binary {
                quality,
                platform,
                commit,
                filename,
            } => {
                let path = self
                    .layout
                    .binary_commit_dir(quality, &platform, &commit)
                    .join(&filename);
                serve_file(req, &path, "application/octet-stream");
            }
            Route::Recommendations => {
                serve_file(req, &self.layout.recommended_path(), "application/octet-stream");
            }
            Route::MaliciousArtifact => {
                serve_file(req, &self.layout.malicious_path(), "application/octet-stream");
            }
            Route::Stats => {
                // Telemetry beacons are accepted and dropped.
                let mut sink = Vec::new();
                let _ = req.as_reader().take(MAX_QUERY_BODY as u64).read_to_end(&mut sink);
                let _ = req.respond(Response::empty(200));
            }
            Route::Liveness => {
                let snapshot = self.index.snapshot();
                respond_json(
                    req,
                    serde_json::json!({
                        "status": "ok",
                        "extensions": snapshot.len(),
                        "releases": snapshot.releases().count(),
                    })
                    .to_string(),
                );
            }
        }
    }

    fn handle_query(&self, mut req: tiny_http::Request) {
        let mut body = Vec::new();
        if req
            .as_reader()
            .take(MAX_QUERY_BODY as u64)
            .read_to_end(&mut body)
            .is_err()
        {
            respond_error(req, 400, "unreadable request body");
            return;
        }
        let parsed: ExtensionQuery = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("malformed extension query: {e}");
                respond_error(req, 400, "malformed extension query");
                return;
            }
        };

        let snapshot = self.index.snapshot();
        let outcome = query::execute(&snapshot, &parsed);
        let response = QueryResponse::page(outcome.extensions, outcome.total);
        match serde_json::to_vec(&response) {
            Ok(bytes) => respond_json(req, bytes),
            Err(e) => {
                warn!("query response encoding failed: {e}");
                respond_error(req, 500, "internal error");
            }
        }
    }

    fn handle_asset(
        &self,
        req: tiny_http::Request,
        id: &str,
        version: &str,
        target_platform: Option<&str>,
        asset_type: &str,
    ) {
        // parse_route validated every segment; this lookup cannot escape the
        // extension's own directory.
        let Ok(id) = ExtensionId::parse(id) else {
            respond_error(req, 404, "not found");
            return;
        };
        let path = self
            .layout
            .version_dir(&id, version, target_platform)
            .join(asset_type);
        serve_file(req, &path, asset_content_type(asset_type));
    }

    fn handle_update(
        &self,
        req: tiny_http::Request,
        platform: &str,
        quality: Quality,
        commit: &str,
    ) {
        let snapshot = self.index.snapshot();
        match query::update_check(&snapshot, quality, platform, commit, &self.base) {
            UpdateCheck::Unknown => respond_error(req, 404, "no release mirrored"),
            UpdateCheck::UpToDate => {
                let _ = req.respond(Response::empty(204));
            }
            UpdateCheck::Update(manifest) => match serde_json::to_vec(&*manifest) {
                Ok(bytes) => respond_json(req, bytes),
                Err(e) => {
                    warn!("manifest encoding failed: {e}");
                    respond_error(req, 500, "internal error");
                }
            },
        }
    }

    fn handle_commit_redirect(
        &self,
        req: tiny_http::Request,
        commit: &str,
        platform: &str,
        quality: Quality,
    ) {
        let store = vscmirror_store::BinaryStore::new(self.layout.clone());
        let Ok(release) = store.get_release(quality, platform, commit) else {
            respond_error(req, 404, "unknown build");
            return;
        };
        let location = format!(
            "{}/binaries/{quality}/{platform}/{commit}/{}",
            self.base,
            release.payload_filename()
        );
        let response = Response::empty(302)
            .with_header(Header::from_bytes("Location", location).expect("valid header"));
        let _ = req.respond(response);
    }
}

/// Stream a file, honoring single-range requests. Missing file answers 404.
fn serve_file(req: tiny_http::Request, path: &Path, content_type: &str) {
    let Ok(mut file) = File::open(path) else {
        respond_error(req, 404, "not found");
        return;
    };
    let len = match file.metadata() {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            respond_error(req, 404, "not found");
            return;
        }
    };

    let range = req
        .headers()
        .iter()
        .find(|h| h.field.equiv("Range"))
        .and_then(|h| parse_range(h.value.as_str(), len));

    let content_type_header =
        Header::from_bytes("Content-Type", content_type).expect("valid header");
    let accept_ranges = Header::from_bytes("Accept-Ranges", "bytes").expect("valid header");

    match range {
        Some((start, end)) => {
            if file.seek(SeekFrom::Start(start)).is_err() {
                respond_error(req, 500, "seek failed");
                return;
            }
            let span = end - start + 1;
            let content_range =
                Header::from_bytes("Content-Range", format!("bytes {start}-{end}/{len}"))
                    .expect("valid header");
            let response = Response::new(
                StatusCode(206),
                vec![content_type_header, accept_ranges, content_range],
                file.take(span),
                Some(span as usize),
                None,
            );
            let _ = req.respond(response);
        }
        None => {
            let response = Response::new(
                StatusCode(200),
                vec![content_type_header, accept_ranges],
                file,
                Some(len as usize),
                None,
            );
            let _ = req.respond(response);
        }
    }
}

/// Accept loop shared by N worker threads; blocks the calling thread.
pub fn run_server(gallery: &Arc<Gallery>, addr: &str, workers: usize) {
    let server = Arc::new(Server::http(addr).expect("failed to bind HTTP server"));
    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let server = Arc::clone(&server);
        let gallery = Arc::clone(gallery);
        handles.push(std::thread::spawn(move || {
            for request in server.incoming_requests() {
                gallery.handle(request);
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
}

/// An in-process gallery on a random port, serving `artifact_root`.
/// Drop stops the accept loop via `Server::unblock`.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub gallery: Arc<Gallery>,
    server: Arc<Server>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(artifact_root: PathBuf) -> Self {
        let layout = StoreLayout::new(&artifact_root);
        layout.initialize().expect("failed to initialize store");

        let server = Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let index = Arc::new(StoreIndex::new(layout.clone(), url.clone()));
        index.rebuild().expect("initial index build failed");
        let gallery = Arc::new(Gallery::new(layout, index, url.clone()));

        let mut workers = Vec::new();
        for _ in 0..2 {
            let server = Arc::clone(&server);
            let gallery = Arc::clone(&gallery);
            workers.push(std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    gallery.handle(request);
                }
            }));
        }

        Self {
            url,
            port,
            gallery,
            server,
            _workers: workers,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}
