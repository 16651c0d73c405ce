//! The in-memory reflection of the artifact store the gallery answers from.
//!
//! A [`Snapshot`] is an immutable view built from one full store scan:
//! extension records with their asset URIs already rewritten onto the
//! gallery, secondary indices for tag/category/publisher/text lookups, and
//! the binary releases keyed by (quality, platform). Snapshots publish
//! behind an `RwLock<Arc<_>>`: readers clone the `Arc` once per request and
//! keep a consistent view however long they take; the refresher builds a
//! fresh snapshot off to the side and swaps the pointer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use vscmirror_schema::{
    extension_flag_bits, GalleryExtension, Quality, ReleaseManifest,
};
use vscmirror_store::{BinaryStore, ExtensionStore, StoreError, StoreLayout};

/// One extension in the snapshot, with everything query execution needs
/// precomputed.
#[derive(Debug)]
pub struct IndexedExtension {
    pub record: GalleryExtension,
    pub norm_id: String,
    pub install_count: f64,
    pub average_rating: f64,
    pub weighted_rating: f64,
    pub flag_bits: u64,
    /// Lowercased searchable fields, kept separate so scoring can weight them.
    pub name_text: String,
    pub description_text: String,
    pub publisher_text: String,
}

#[derive(Debug, Default)]
pub struct Snapshot {
    pub extensions: Vec<Arc<IndexedExtension>>,
    by_norm_id: HashMap<String, usize>,
    by_tag: HashMap<String, Vec<usize>>,
    by_category: HashMap<String, Vec<usize>>,
    binaries: HashMap<(Quality, String), ReleaseManifest>,
    pub built_at: Option<SystemTime>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn by_identifier(&self, identifier: &str) -> Option<&Arc<IndexedExtension>> {
        self.by_norm_id
            .get(&identifier.to_ascii_lowercase())
            .map(|&i| &self.extensions[i])
    }

    pub fn with_tag(&self, tag: &str) -> &[usize] {
        self.by_tag
            .get(&tag.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn with_category(&self, category: &str) -> &[usize] {
        self.by_category
            .get(&category.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn release(&self, quality: Quality, platform: &str) -> Option<&ReleaseManifest> {
        self.binaries.get(&(quality, platform.to_owned()))
    }

    pub fn releases(&self) -> impl Iterator<Item = &ReleaseManifest> {
        self.binaries.values()
    }
}

/// Rewrite every asset URI in a record onto this gallery, so clients never
/// contact the upstream marketplace:
/// `{base}/assets/<publisher.name>/<version>[/<targetPlatform>]/<assetType>`.
pub fn rewrite_asset_uris(record: &mut GalleryExtension, base: &str) {
    let id = record.identity();
    for version in &mut record.versions {
        let mut uri = format!("{base}/assets/{}/{}", id.as_str(), version.version);
        if let Some(ref target) = version.target_platform {
            uri.push('/');
            uri.push_str(target);
        }
        version.asset_uri = uri.clone();
        version.fallback_asset_uri = uri.clone();
        for file in &mut version.files {
            file.source = format!("{uri}/{}", file.asset_type);
        }
    }
}

fn index_one(mut record: GalleryExtension, base: &str) -> IndexedExtension {
    rewrite_asset_uris(&mut record, base);
    let norm_id = record.identity().normalized();
    let name_text = format!(
        "{} {}",
        record.extension_name.to_ascii_lowercase(),
        record.display_name.to_ascii_lowercase()
    );
    IndexedExtension {
        norm_id,
        install_count: record.install_count(),
        average_rating: record.average_rating(),
        weighted_rating: record.weighted_rating(),
        flag_bits: extension_flag_bits(&record.flags),
        name_text,
        description_text: record.short_description.to_ascii_lowercase(),
        publisher_text: record.publisher.publisher_name.to_ascii_lowercase(),
        record,
    }
}

/// Build a snapshot from a full store scan. Entries mid-write are skipped by
/// the store's tolerant listing, so the result always reflects some past
/// consistent disk state.
pub fn build_snapshot(layout: &StoreLayout, base: &str) -> Result<Snapshot, StoreError> {
    let started = std::time::Instant::now();
    let mut snapshot = Snapshot {
        built_at: Some(SystemTime::now()),
        ..Default::default()
    };

    for record in ExtensionStore::new(layout.clone()).list()? {
        let indexed = index_one(record, base);
        let idx = snapshot.extensions.len();
        snapshot.by_norm_id.insert(indexed.norm_id.clone(), idx);
        for tag in &indexed.record.tags {
            snapshot
                .by_tag
                .entry(tag.to_ascii_lowercase())
                .or_default()
                .push(idx);
        }
        for category in &indexed.record.categories {
            snapshot
                .by_category
                .entry(category.to_ascii_lowercase())
                .or_default()
                .push(idx);
        }
        snapshot.extensions.push(Arc::new(indexed));
    }

    for release in BinaryStore::new(layout.clone()).list()? {
        let (Some(platform), Some(quality)) = (release.platform.clone(), release.quality) else {
            continue;
        };
        snapshot.binaries.insert((quality, platform), release);
    }

    tracing::info!(
        "indexed {} extensions and {} releases in {:?}",
        snapshot.extensions.len(),
        snapshot.binaries.len(),
        started.elapsed()
    );
    Ok(snapshot)
}

/// The published index: one atomic pointer swap per rebuild, no locking in
/// the read path beyond the pointer clone.
pub struct StoreIndex {
    layout: StoreLayout,
    base: String,
    current: RwLock<Arc<Snapshot>>,
}

impl StoreIndex {
    pub fn new(layout: StoreLayout, base: impl Into<String>) -> Self {
        Self {
            layout,
            base: base.into(),
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().expect("index lock poisoned"))
    }

    pub fn rebuild(&self) -> Result<(), StoreError> {
        let fresh = Arc::new(build_snapshot(&self.layout, &self.base)?);
        *self.current.write().expect("index lock poisoned") = fresh;
        Ok(())
    }

    /// Rebuild on the interval, and sooner whenever a sync pass rewrites the
    /// completion marker.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> std::thread::JoinHandle<()> {
        let index = Arc::clone(self);
        std::thread::spawn(move || {
            let mut last_marker = marker_mtime(&index.layout);
            let mut since_rebuild = Duration::ZERO;
            loop {
                std::thread::sleep(Duration::from_secs(1));
                since_rebuild += Duration::from_secs(1);
                let marker = marker_mtime(&index.layout);
                let marker_changed = marker != last_marker;
                if marker_changed || since_rebuild >= interval {
                    last_marker = marker;
                    since_rebuild = Duration::ZERO;
                    if let Err(e) = index.rebuild() {
                        tracing::warn!("index rebuild failed: {e}");
                    }
                }
            }
        })
    }
}

fn marker_mtime(layout: &StoreLayout) -> Option<SystemTime> {
    layout.updated_path().metadata().and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use vscmirror_schema::{GalleryAsset, GalleryExtensionVersion, GalleryPublisher};

    fn record(publisher: &str, name: &str, tags: &[&str]) -> GalleryExtension {
        GalleryExtension {
            extension_id: format!("{publisher}-{name}"),
            extension_name: name.to_owned(),
            display_name: name.to_owned(),
            short_description: format!("the {name} extension"),
            publisher: GalleryPublisher {
                publisher_name: publisher.to_owned(),
                ..Default::default()
            },
            versions: vec![GalleryExtensionVersion {
                version: "1.0.0".to_owned(),
                target_platform: None,
                flags: String::new(),
                last_updated: "2024-01-01T00:00:00Z".to_owned(),
                files: vec![GalleryAsset {
                    asset_type: "Microsoft.VisualStudio.Services.VSIXPackage".to_owned(),
                    source: "https://upstream/some.vsix".to_owned(),
                    size: Some(3),
                    extra: Map::new(),
                }],
                properties: Vec::new(),
                asset_uri: "https://upstream/assets".to_owned(),
                fallback_asset_uri: "https://upstream/assets".to_owned(),
                extra: Map::new(),
            }],
            statistics: vec![],
            categories: vec!["Linters".to_owned()],
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            flags: "validated, public".to_owned(),
            last_updated: String::new(),
            published_date: String::new(),
            recommended: false,
            extra: Map::new(),
        }
    }

    fn seeded_layout() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = ExtensionStore::new(layout.clone());
        store.put(&record("ms-python", "python", &["python", "linting"])).unwrap();
        store.put(&record("golang", "go", &["go"])).unwrap();
        (dir, layout)
    }

    #[test]
    fn rewrite_points_assets_at_gallery() {
        let mut rec = record("pub", "ext", &[]);
        rewrite_asset_uris(&mut rec, "http://mirror:9000");
        let version = &rec.versions[0];
        assert_eq!(version.asset_uri, "http://mirror:9000/assets/pub.ext/1.0.0");
        assert_eq!(version.fallback_asset_uri, version.asset_uri);
        assert_eq!(
            version.files[0].source,
            "http://mirror:9000/assets/pub.ext/1.0.0/Microsoft.VisualStudio.Services.VSIXPackage"
        );
    }

    #[test]
    fn rewrite_includes_target_platform_segment() {
        let mut rec = record("pub", "ext", &[]);
        rec.versions[0].target_platform = Some("linux-x64".to_owned());
        rewrite_asset_uris(&mut rec, "");
        assert_eq!(rec.versions[0].asset_uri, "/assets/pub.ext/1.0.0/linux-x64");
    }

    #[test]
    fn snapshot_lookup_is_case_insensitive() {
        let (_dir, layout) = seeded_layout();
        let snapshot = build_snapshot(&layout, "").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.by_identifier("MS-Python.Python").is_some());
        assert!(snapshot.by_identifier("nobody.here").is_none());
    }

    #[test]
    fn snapshot_secondary_indices() {
        let (_dir, layout) = seeded_layout();
        let snapshot = build_snapshot(&layout, "").unwrap();
        assert_eq!(snapshot.with_tag("Python").len(), 1);
        assert_eq!(snapshot.with_category("linters").len(), 2);
        assert!(snapshot.with_tag("rust").is_empty());
    }

    #[test]
    fn snapshot_includes_releases() {
        let (_dir, layout) = seeded_layout();
        let release: ReleaseManifest = serde_json::from_value(serde_json::json!({
            "url": "https://u/code.tar.gz", "name": "1.92.1", "version": "c1",
            "productVersion": "1.92.1", "timestamp": 1,
            "platform": "linux-x64", "quality": "stable"
        }))
        .unwrap();
        BinaryStore::new(layout.clone())
            .put_latest(Quality::Stable, "linux-x64", &release)
            .unwrap();

        let snapshot = build_snapshot(&layout, "").unwrap();
        assert!(snapshot.release(Quality::Stable, "linux-x64").is_some());
        assert!(snapshot.release(Quality::Insider, "linux-x64").is_none());
    }

    #[test]
    fn old_snapshot_stays_valid_after_swap() {
        let (_dir, layout) = seeded_layout();
        let index = StoreIndex::new(layout.clone(), "");
        index.rebuild().unwrap();
        let held = index.snapshot();
        assert_eq!(held.len(), 2);

        // A concurrent pass removes a record and the index rebuilds.
        ExtensionStore::new(layout.clone())
            .remove(&vscmirror_schema::ExtensionId::parse("golang.go").unwrap())
            .unwrap();
        index.rebuild().unwrap();

        // The in-flight reader still sees its consistent view.
        assert_eq!(held.len(), 2);
        assert_eq!(index.snapshot().len(), 1);
    }

    #[test]
    fn flag_bits_are_precomputed() {
        let (_dir, layout) = seeded_layout();
        let snapshot = build_snapshot(&layout, "").unwrap();
        let ext = snapshot.by_identifier("ms-python.python").unwrap();
        assert_eq!(ext.flag_bits, 0x104); // validated | public
    }
}
