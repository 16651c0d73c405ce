use crate::config::SyncConfig;
use crate::SyncError;
use std::collections::{HashMap, HashSet};
use vscmirror_schema::{ExtensionId, GalleryExtension, GalleryExtensionVersion, Quality, ReleaseManifest};
use vscmirror_store::{satisfies, ExtensionStore, MaliciousList, StoreLayout};

/// Which slice of the marketplace a sync pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Enumerate the full marketplace.
    All,
    /// Upstream recommendation groups ∪ operator allow list ∪ top-N slice.
    Recommended,
    /// Strictly the operator allow list.
    Specified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Binary,
    ExtensionAsset,
}

/// One resolved unit of download for the pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: WorkKind,
    /// Human-readable identity for logs and failure records.
    pub identity: String,
    pub url: String,
    /// Destination, relative to the artifact root.
    pub relpath: String,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
    /// Completion group: all items of a group must commit before the group's
    /// record may be published.
    pub group: String,
}

/// Upstream state gathered by the synchronizer before resolution.
#[derive(Debug, Default)]
pub struct Catalog {
    pub releases: Vec<ReleaseManifest>,
    pub extensions: Vec<GalleryExtension>,
    pub malicious: MaliciousList,
    pub recommendation_groups: Vec<Vec<String>>,
}

/// An extension whose selected versions the pass intends to publish.
#[derive(Debug)]
pub struct ExtensionTarget {
    /// The candidate record, versions trimmed to the selection.
    pub record: GalleryExtension,
    pub groups: Vec<String>,
}

#[derive(Debug)]
pub struct BinaryTarget {
    pub quality: Quality,
    pub platform: String,
    pub release: ReleaseManifest,
    pub group: String,
}

#[derive(Debug, Default)]
pub struct ResolvedCatalog {
    pub work: Vec<WorkItem>,
    pub binaries: Vec<BinaryTarget>,
    pub extensions: Vec<ExtensionTarget>,
    /// Version keys that must survive retention.
    pub retain: HashSet<String>,
    /// Malicious identifiers currently present in the store.
    pub purge: Vec<ExtensionId>,
    /// Work subtracted because the store already satisfies it.
    pub satisfied: usize,
}

/// Key identifying one (extension, version, targetPlatform) for grouping and
/// retention decisions.
pub fn version_key(id: &ExtensionId, version: &str, target: Option<&str>) -> String {
    format!(
        "{}/{version}/{}",
        id.normalized(),
        target.unwrap_or("universal")
    )
}

/// Diff the catalog against the store: emit the work set, the publish
/// targets, the retain set and the purge set.
pub fn resolve(
    catalog: &Catalog,
    layout: &StoreLayout,
    config: &SyncConfig,
) -> Result<ResolvedCatalog, SyncError> {
    let mut resolved = ResolvedCatalog::default();
    resolve_binaries(catalog, layout, &mut resolved);
    resolve_extensions(catalog, layout, config, &mut resolved)?;

    let ext_store = ExtensionStore::new(layout.clone());
    for raw in &catalog.malicious.malicious {
        let Ok(id) = ExtensionId::parse(raw) else {
            tracing::debug!("ignoring malformed malicious identifier '{raw}'");
            continue;
        };
        if ext_store.exists(&id) {
            resolved.purge.push(id);
        }
    }

    Ok(resolved)
}

fn resolve_binaries(catalog: &Catalog, layout: &StoreLayout, out: &mut ResolvedCatalog) {
    for release in &catalog.releases {
        let (Some(platform), Some(quality)) = (release.platform.clone(), release.quality) else {
            tracing::warn!(
                "release {} lacks platform/quality bookkeeping, skipping",
                release.version
            );
            continue;
        };
        let commit = release.version.as_str();
        let group = format!("bin:{quality}/{platform}/{commit}");
        let filename = release.payload_filename();
        let dest = layout.binary_commit_dir(quality, &platform, commit).join(&filename);

        if satisfies(&dest, None, release.sha256.as_deref()) {
            out.satisfied += 1;
        } else {
            out.work.push(WorkItem {
                kind: WorkKind::Binary,
                identity: format!("{quality}/{platform} {}", release.name),
                url: release.url.clone(),
                relpath: format!("binaries/{quality}/{platform}/{commit}/{filename}"),
                expected_size: None,
                expected_sha256: release.sha256.clone(),
                group: group.clone(),
            });
        }
        out.binaries.push(BinaryTarget {
            quality,
            platform,
            release: release.clone(),
            group,
        });
    }
}

fn resolve_extensions(
    catalog: &Catalog,
    layout: &StoreLayout,
    config: &SyncConfig,
    out: &mut ResolvedCatalog,
) -> Result<(), SyncError> {
    let ext_store = ExtensionStore::new(layout.clone());

    for candidate in &catalog.extensions {
        let id = candidate.identity();
        if ExtensionId::parse(id.as_str()).is_err() {
            tracing::warn!("skipping extension with unusable identity '{id}'");
            continue;
        }
        if catalog.malicious.contains(&id) {
            tracing::warn!("suppressing malicious extension {id}");
            continue;
        }

        let selected = select_versions(candidate, config);
        if selected.is_empty() {
            tracing::debug!("no eligible versions for {id}, skipping");
            continue;
        }

        // Sizes stamped into the previously published record let the probe
        // catch truncated or corrupted files, not just missing ones.
        let known_sizes = stored_asset_sizes(&ext_store, &id);

        let mut groups = Vec::new();
        for version in &selected {
            let target = version.target_platform.as_deref();
            let group = format!("ext:{}", version_key(&id, &version.version, target));
            out.retain.insert(version_key(&id, &version.version, target));

            let version_dir = layout.version_dir(&id, &version.version, target);
            for asset in &version.files {
                if asset.asset_type.contains('/') || asset.asset_type.contains('\\') {
                    tracing::warn!(
                        "{id} {}: asset type '{}' is not a safe file name, skipping",
                        version.version,
                        asset.asset_type
                    );
                    continue;
                }
                if asset.source.is_empty() {
                    tracing::warn!(
                        "{id} {}: asset '{}' has no source url, skipping",
                        version.version,
                        asset.asset_type
                    );
                    continue;
                }
                let expected_size = known_sizes
                    .get(&(
                        version.version.clone(),
                        target.map(str::to_owned),
                        asset.asset_type.clone(),
                    ))
                    .copied();
                let dest = version_dir.join(&asset.asset_type);
                if satisfies(&dest, expected_size, None) {
                    out.satisfied += 1;
                    continue;
                }
                let mut relpath = format!("extensions/{}/{}", id.as_str(), version.version);
                if let Some(target) = target {
                    relpath.push('/');
                    relpath.push_str(target);
                }
                relpath.push('/');
                relpath.push_str(&asset.asset_type);

                out.work.push(WorkItem {
                    kind: WorkKind::ExtensionAsset,
                    identity: format!("{id} {} {}", version.version, asset.asset_type),
                    url: asset.source.clone(),
                    relpath,
                    expected_size,
                    expected_sha256: None,
                    group: group.clone(),
                });
            }
            groups.push(group);
        }

        let mut record = candidate.clone();
        record.versions = selected;
        out.extensions.push(ExtensionTarget { record, groups });
    }
    Ok(())
}

/// Newest-N distinct versions of a candidate, every target platform of each
/// chosen version included; pre-releases only when opted in.
fn select_versions(candidate: &GalleryExtension, config: &SyncConfig) -> Vec<GalleryExtensionVersion> {
    let mut sorted = candidate.clone();
    sorted.sort_versions();

    let mut distinct: Vec<String> = Vec::new();
    let mut selected = Vec::new();
    for version in &sorted.versions {
        if !config.include_prerelease && version.is_prerelease() {
            continue;
        }
        if !distinct.iter().any(|v| v == &version.version) {
            if distinct.len() >= config.versions_per_extension {
                continue;
            }
            distinct.push(version.version.clone());
        }
        selected.push(version.clone());
    }
    selected
}

type AssetSizeKey = (String, Option<String>, String);

fn stored_asset_sizes(store: &ExtensionStore, id: &ExtensionId) -> HashMap<AssetSizeKey, u64> {
    let mut sizes = HashMap::new();
    let Ok(record) = store.get(id) else {
        return sizes;
    };
    for version in &record.versions {
        for asset in &version.files {
            if let Some(size) = asset.size {
                sizes.insert(
                    (
                        version.version.clone(),
                        version.target_platform.clone(),
                        asset.asset_type.clone(),
                    ),
                    size,
                );
            }
        }
    }
    sizes
}
