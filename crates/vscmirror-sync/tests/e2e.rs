//! End-to-end sync passes against a scripted in-memory upstream: the
//! specified-extension flow, idempotent re-runs, malicious purge, binary
//! publishing, retention, and consistency when downloads fail.

use serde_json::Map;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use vscmirror_schema::{
    asset, ExtensionId, GalleryAsset, GalleryExtension, GalleryExtensionVersion, GalleryProperty,
    GalleryPublisher, Quality, ReleaseManifest,
};
use vscmirror_store::{ExtensionStore, StoreLayout};
use vscmirror_sync::{SyncConfig, SyncError, SyncMode, SyncOps, Synchronizer};
use vscmirror_upstream::{AssetBody, UpstreamError, UpstreamSource};

#[derive(Default)]
struct MockUpstream {
    releases: HashMap<(String, Quality), ReleaseManifest>,
    extensions: Mutex<HashMap<String, GalleryExtension>>,
    assets: HashMap<String, Vec<u8>>,
    recommendations: Vec<Vec<String>>,
    malicious: Vec<String>,
    asset_fetches: AtomicUsize,
    unreachable: bool,
}

impl MockUpstream {
    fn add_extension(&mut self, ext: GalleryExtension) {
        self.extensions
            .lock()
            .unwrap()
            .insert(ext.identity().normalized(), ext);
    }
}

impl UpstreamSource for MockUpstream {
    fn release_manifest(
        &self,
        platform: &str,
        quality: Quality,
    ) -> Result<Option<ReleaseManifest>, UpstreamError> {
        if self.unreachable {
            return Err(UpstreamError::Unavailable("mock outage".to_owned()));
        }
        Ok(self.releases.get(&(platform.to_owned(), quality)).cloned())
    }

    fn extension_by_name(
        &self,
        name: &str,
        _include_prerelease: bool,
    ) -> Result<Option<GalleryExtension>, UpstreamError> {
        if self.unreachable {
            return Err(UpstreamError::Unavailable("mock outage".to_owned()));
        }
        Ok(self
            .extensions
            .lock()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned())
    }

    fn extension_by_id(&self, id: &str) -> Result<Option<GalleryExtension>, UpstreamError> {
        Ok(self
            .extensions
            .lock()
            .unwrap()
            .values()
            .find(|e| e.extension_id == id)
            .cloned())
    }

    fn search(&self, _text: &str, _limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError> {
        if self.unreachable {
            return Err(UpstreamError::Unavailable("mock outage".to_owned()));
        }
        Ok(self.extensions.lock().unwrap().values().cloned().collect())
    }

    fn top_by_installs(&self, limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError> {
        let mut all = self.search("", 0)?;
        all.sort_by(|a, b| b.install_count().total_cmp(&a.install_count()));
        all.truncate(limit);
        Ok(all)
    }

    fn recommendation_groups(&self) -> Result<Vec<Vec<String>>, UpstreamError> {
        if self.unreachable {
            return Err(UpstreamError::Unavailable("mock outage".to_owned()));
        }
        Ok(self.recommendations.clone())
    }

    fn malicious_identifiers(&self) -> Result<Vec<String>, UpstreamError> {
        if self.unreachable {
            return Err(UpstreamError::Unavailable("mock outage".to_owned()));
        }
        Ok(self.malicious.clone())
    }

    fn fetch_asset(&self, url: &str) -> Result<AssetBody, UpstreamError> {
        self.asset_fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .assets
            .get(url)
            .cloned()
            .ok_or_else(|| UpstreamError::Status {
                status: 404,
                url: url.to_owned(),
            })?;
        Ok(AssetBody {
            declared_len: Some(bytes.len() as u64),
            content_type: None,
            reader: Box::new(Cursor::new(bytes)),
        })
    }
}

fn gallery_version(v: &str, urls: &[(&str, &str)], prerelease: bool) -> GalleryExtensionVersion {
    let properties = if prerelease {
        vec![GalleryProperty {
            key: asset::PRERELEASE_PROPERTY.to_owned(),
            value: "true".to_owned(),
            extra: Map::new(),
        }]
    } else {
        Vec::new()
    };
    GalleryExtensionVersion {
        version: v.to_owned(),
        target_platform: None,
        flags: "validated".to_owned(),
        last_updated: "2024-05-01T00:00:00Z".to_owned(),
        files: urls
            .iter()
            .map(|(asset_type, url)| GalleryAsset {
                asset_type: (*asset_type).to_owned(),
                source: (*url).to_owned(),
                size: None,
                extra: Map::new(),
            })
            .collect(),
        properties,
        asset_uri: String::new(),
        fallback_asset_uri: String::new(),
        extra: Map::new(),
    }
}

fn gallery_extension(publisher: &str, name: &str, versions: Vec<GalleryExtensionVersion>) -> GalleryExtension {
    GalleryExtension {
        extension_id: format!("{publisher}.{name}.uuid"),
        extension_name: name.to_owned(),
        display_name: name.to_owned(),
        short_description: format!("{name} things"),
        publisher: GalleryPublisher {
            publisher_name: publisher.to_owned(),
            display_name: publisher.to_owned(),
            ..Default::default()
        },
        versions,
        statistics: Vec::new(),
        categories: vec!["Programming Languages".to_owned()],
        tags: vec![name.to_owned()],
        flags: "validated, public".to_owned(),
        last_updated: "2024-05-01T00:00:00Z".to_owned(),
        published_date: "2020-01-01T00:00:00Z".to_owned(),
        recommended: false,
        extra: Map::new(),
    }
}

fn python_upstream() -> MockUpstream {
    let mut upstream = MockUpstream::default();
    upstream.add_extension(gallery_extension(
        "ms-python",
        "python",
        vec![gallery_version(
            "2024.6.0",
            &[
                (asset::VSIX_PACKAGE, "https://up/python/2024.6.0.vsix"),
                (asset::CODE_MANIFEST, "https://up/python/2024.6.0.manifest"),
            ],
            false,
        )],
    ));
    upstream
        .assets
        .insert("https://up/python/2024.6.0.vsix".to_owned(), vec![7u8; 2048]);
    upstream.assets.insert(
        "https://up/python/2024.6.0.manifest".to_owned(),
        br#"{"name": "python"}"#.to_vec(),
    );
    upstream
}

fn config_for(dir: &tempfile::TempDir) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.artifact_root = dir.path().to_path_buf();
    config.total_recommended = 0;
    config
}

#[test]
fn specified_sync_materializes_extension() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let upstream = python_upstream();

    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    assert_eq!(summary.downloaded, 2);
    assert_eq!(summary.failed, 0);

    let version_dir = dir.path().join("extensions/ms-python.python/2024.6.0");
    assert!(version_dir
        .join("Microsoft.VisualStudio.Services.VSIXPackage")
        .is_file());

    let latest: GalleryExtension = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/ms-python.python/latest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(latest.versions[0].version, "2024.6.0");
    // asset sizes are stamped for the integrity invariant
    assert_eq!(latest.versions[0].files[0].size, Some(2048));

    let index: Vec<GalleryExtension> = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/extensions.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(index.len(), 1);
    assert!(dir.path().join("updated.json").is_file());

    let report = vscmirror_store::verify_store(&StoreLayout::new(dir.path())).unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
}

#[test]
fn second_pass_downloads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let upstream = python_upstream();
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    sync.run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    let after_first = upstream.asset_fetches.load(Ordering::SeqCst);

    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    assert_eq!(
        upstream.asset_fetches.load(Ordering::SeqCst),
        after_first,
        "identical upstream state must cost zero downloads"
    );
    assert_eq!(summary.downloaded, 0);
    assert!(summary.skipped >= 2);
}

#[test]
fn malicious_extension_is_purged_and_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let mut upstream = python_upstream();
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    // First pass mirrors it.
    {
        let sync = Synchronizer::new(&config, &upstream);
        sync.run_pass(SyncOps::extensions_only(SyncMode::Specified))
            .unwrap();
    }
    assert!(dir.path().join("extensions/ms-python.python").exists());

    // Upstream then flags it malicious.
    upstream.malicious = vec!["ms-python.python".to_owned()];
    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    assert_eq!(summary.purged, 1);
    assert!(!dir.path().join("extensions/ms-python.python").exists());

    let index: Vec<GalleryExtension> = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/extensions.json")).unwrap(),
    )
    .unwrap();
    assert!(index.is_empty());
}

#[test]
fn binaries_pass_publishes_manifest_and_payload() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&dir);
    config.platforms = vec!["linux-x64".to_owned()];

    let payload = b"pretend this is a tarball".to_vec();
    let sha: String = {
        use sha2::{Digest, Sha256};
        Sha256::digest(&payload)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    };
    let release: ReleaseManifest = serde_json::from_value(serde_json::json!({
        "url": "https://up/stable/linux-x64/code.tar.gz",
        "name": "1.92.1",
        "version": "commitaaa",
        "productVersion": "1.92.1",
        "timestamp": 1723000000000i64,
        "sha256hash": sha,
        "platform": "linux-x64",
        "quality": "stable"
    }))
    .unwrap();

    let mut upstream = MockUpstream::default();
    upstream
        .releases
        .insert(("linux-x64".to_owned(), Quality::Stable), release);
    upstream
        .assets
        .insert("https://up/stable/linux-x64/code.tar.gz".to_owned(), payload);

    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync.run_pass(SyncOps::binaries_only()).unwrap();
    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.binaries_published, 1);

    let base = dir.path().join("binaries/stable/linux-x64");
    assert!(base.join("commitaaa/vscode-1.92.1.tar.gz").is_file());
    assert!(base.join("commitaaa/release.json").is_file());
    let latest: ReleaseManifest =
        serde_json::from_str(&fs::read_to_string(base.join("latest.json")).unwrap()).unwrap();
    assert_eq!(latest.version.as_str(), "commitaaa");
}

#[test]
fn corrupted_payload_is_redownloaded() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let upstream = python_upstream();
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    sync.run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();

    // Corrupt the committed package to a wrong size.
    let vsix = dir
        .path()
        .join("extensions/ms-python.python/2024.6.0/Microsoft.VisualStudio.Services.VSIXPackage");
    fs::write(&vsix, b"stub").unwrap();

    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    assert_eq!(summary.downloaded, 1, "size mismatch must re-download");
    assert_eq!(fs::metadata(&vsix).unwrap().len(), 2048);
}

#[test]
fn failed_download_withholds_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let mut upstream = python_upstream();
    // The package URL will 404.
    upstream.assets.remove("https://up/python/2024.6.0.vsix");
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(
        !dir.path()
            .join("extensions/ms-python.python/latest.json")
            .exists(),
        "an incomplete version must never be pointed at"
    );
    let index: Vec<GalleryExtension> = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/extensions.json")).unwrap(),
    )
    .unwrap();
    assert!(index.is_empty());
}

#[test]
fn retention_keeps_newest_versions_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&dir);
    config.keep_versions = 1;

    let upstream = python_upstream();
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    // Seed the store with an older, fully materialized version and a record
    // listing it.
    let layout = StoreLayout::new(dir.path());
    layout.initialize().unwrap();
    let id = ExtensionId::parse("ms-python.python").unwrap();
    let old_dir = layout.version_dir(&id, "2024.4.0", None);
    fs::create_dir_all(&old_dir).unwrap();
    fs::write(old_dir.join("Microsoft.VisualStudio.Services.VSIXPackage"), b"old").unwrap();
    let old_record = gallery_extension(
        "ms-python",
        "python",
        vec![gallery_version("2024.4.0", &[], false)],
    );
    ExtensionStore::new(layout.clone()).put(&old_record).unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    sync.run_pass(SyncOps::extensions_only(SyncMode::Specified))
        .unwrap();

    assert!(
        !layout.version_dir(&id, "2024.4.0", None).exists(),
        "retention must trim versions beyond the keep budget"
    );
    let latest: GalleryExtension = serde_json::from_str(
        &fs::read_to_string(layout.extension_latest_path(&id)).unwrap(),
    )
    .unwrap();
    let versions: Vec<&str> = latest.versions.iter().map(|v| v.version.as_str()).collect();
    assert_eq!(versions, ["2024.6.0"]);
}

#[test]
fn unreachable_upstream_fails_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let upstream = MockUpstream {
        unreachable: true,
        ..Default::default()
    };
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    match sync.run_pass(SyncOps::full()) {
        Err(SyncError::UpstreamUnreachable) => {}
        other => panic!("expected UpstreamUnreachable, got {other:?}"),
    }
}

#[test]
fn recommended_mode_unions_groups_and_specified() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let mut upstream = python_upstream();
    upstream.add_extension(gallery_extension(
        "rust-lang",
        "rust-analyzer",
        vec![gallery_version(
            "0.4.0",
            &[(asset::VSIX_PACKAGE, "https://up/ra/0.4.0.vsix")],
            false,
        )],
    ));
    upstream
        .assets
        .insert("https://up/ra/0.4.0.vsix".to_owned(), vec![1u8; 64]);
    upstream.recommendations = vec![vec!["rust-lang.rust-analyzer".to_owned()]];
    fs::write(
        dir.path().join("specified.json"),
        r#"{"extensions": ["ms-python.python"]}"#,
    )
    .unwrap();

    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Recommended))
        .unwrap();
    assert_eq!(summary.extensions_published, 2);

    assert!(dir.path().join("extensions/ms-python.python/latest.json").exists());
    let ra: GalleryExtension = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/rust-lang.rust-analyzer/latest.json"))
            .unwrap(),
    )
    .unwrap();
    assert!(ra.recommended, "group members carry the recommended marker");

    let recommended: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("extensions/recommended.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        recommended["workspaceRecommendations"][0]["extensionIds"][0],
        "rust-lang.rust-analyzer"
    );
}

#[test]
fn stale_recommendation_is_soft_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&dir);
    let mut upstream = python_upstream();
    upstream.recommendations = vec![vec![
        "ms-python.python".to_owned(),
        "gone.extension".to_owned(),
    ]];

    let sync = Synchronizer::new(&config, &upstream);
    let summary = sync
        .run_pass(SyncOps::extensions_only(SyncMode::Recommended))
        .unwrap();
    assert_eq!(summary.extensions_published, 1);
    assert!(!dir.path().join("extensions/gone.extension").exists());
}
