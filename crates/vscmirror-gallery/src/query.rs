//! Marketplace query execution over a snapshot: filter clauses, relevance
//! scoring, sorting, 1-based pagination, and flag-gated response shaping.

use crate::index::{IndexedExtension, Snapshot};
use std::collections::{HashMap, HashSet};
use vscmirror_schema::{
    asset, ExtensionQuery, FilterType, GalleryExtension, Quality, QueryFilter, QueryFlags,
    ReleaseManifest, SortBy, SortOrder,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Debug)]
pub struct QueryOutcome {
    pub extensions: Vec<GalleryExtension>,
    pub total: u64,
}

/// Execute one `/extensionquery` request against a snapshot.
pub fn execute(snapshot: &Snapshot, query: &ExtensionQuery) -> QueryOutcome {
    let flags = query.flags();
    let default_filter = QueryFilter::default();
    let filter = query.primary_filter().unwrap_or(&default_filter);

    let mut candidates: Vec<usize> = (0..snapshot.extensions.len()).collect();
    let mut scores: HashMap<usize, f64> = HashMap::new();
    // Clauses that narrow the result beyond the standing Target /
    // ExcludeWithFlags pair the editor always sends.
    let mut narrowed = false;
    let mut scored = false;

    for criterion in &filter.criteria {
        let value = criterion.value.trim();
        match criterion.kind() {
            FilterType::Target => {
                if !value.is_empty() && !value.eq_ignore_ascii_case(asset::TARGET_PRODUCT) {
                    candidates.clear();
                }
            }
            FilterType::ExcludeWithFlags => {
                let bits = value.parse::<u64>().unwrap_or(0);
                candidates.retain(|&i| snapshot.extensions[i].flag_bits & bits == 0);
            }
            FilterType::Tag => {
                narrowed = true;
                let matching: HashSet<usize> = snapshot.with_tag(value).iter().copied().collect();
                candidates.retain(|i| matching.contains(i));
            }
            FilterType::Category => {
                narrowed = true;
                let matching: HashSet<usize> =
                    snapshot.with_category(value).iter().copied().collect();
                candidates.retain(|i| matching.contains(i));
            }
            FilterType::ExtensionName => {
                narrowed = true;
                let wanted = value.to_ascii_lowercase();
                candidates.retain(|&i| snapshot.extensions[i].norm_id == wanted);
            }
            FilterType::ExtensionId => {
                narrowed = true;
                candidates.retain(|&i| {
                    snapshot.extensions[i]
                        .record
                        .extension_id
                        .eq_ignore_ascii_case(value)
                });
            }
            FilterType::Featured => {
                narrowed = true;
                candidates.retain(|&i| {
                    let ext = &snapshot.extensions[i];
                    ext.record.recommended
                        || ext.record.flags.to_ascii_lowercase().contains("featured")
                });
            }
            FilterType::SearchText => {
                if value.is_empty() {
                    continue;
                }
                narrowed = true;
                scored = true;
                let tokens: Vec<String> = tokenize(value);
                candidates.retain(|&i| {
                    match score(&snapshot.extensions[i], &tokens) {
                        Some(s) => {
                            scores.insert(i, s);
                            true
                        }
                        None => false,
                    }
                });
            }
            FilterType::Unknown(code) => {
                tracing::debug!("ignoring unknown filter type {code}");
            }
        }
    }

    // A query that narrows nothing is the editor's home page: answer with
    // the recommended set when one exists.
    if !narrowed {
        let recommended: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| snapshot.extensions[i].record.recommended)
            .collect();
        if !recommended.is_empty() {
            candidates = recommended;
        }
    }

    let sort_by = filter.sort_by.map(SortBy::from_code).unwrap_or_default();
    let sort_order = filter
        .sort_order
        .map(SortOrder::from_code)
        .unwrap_or_default();
    sort_candidates(snapshot, &mut candidates, &scores, scored, sort_by, sort_order);

    let total = candidates.len() as u64;
    let page_size = filter
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE) as usize;
    let page_number = filter.page_number.unwrap_or(1).max(1) as usize;
    let extensions = candidates
        .into_iter()
        .skip((page_number - 1) * page_size)
        .take(page_size)
        .map(|i| shape(&snapshot.extensions[i].record, flags))
        .collect();

    QueryOutcome { extensions, total }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Weighted field match: every token must hit at least one field; the sum of
/// field weights ranks the result. `None` means no match.
fn score(ext: &IndexedExtension, tokens: &[String]) -> Option<f64> {
    let mut total = 0.0;
    for token in tokens {
        let mut hit = 0.0f64;
        if ext.norm_id.contains(token.as_str()) {
            hit += 12.0;
        }
        if ext.name_text.contains(token.as_str()) {
            hit += 10.0;
        }
        if ext
            .record
            .tags
            .iter()
            .any(|t| t.to_ascii_lowercase().contains(token.as_str()))
        {
            hit += 6.0;
        }
        if ext.publisher_text.contains(token.as_str()) {
            hit += 5.0;
        }
        if ext.description_text.contains(token.as_str()) {
            hit += 2.0;
        }
        if hit == 0.0 {
            return None;
        }
        total += hit;
    }
    Some(total)
}

fn sort_candidates(
    snapshot: &Snapshot,
    candidates: &mut [usize],
    scores: &HashMap<usize, f64>,
    scored: bool,
    sort_by: SortBy,
    sort_order: SortOrder,
) {
    let ext = |i: usize| -> &IndexedExtension { &snapshot.extensions[i] };

    if scored && sort_by == SortBy::NoneOrRelevance {
        candidates.sort_by(|&a, &b| {
            let sa = scores.get(&a).copied().unwrap_or(0.0);
            let sb = scores.get(&b).copied().unwrap_or(0.0);
            sb.total_cmp(&sa)
                .then_with(|| ext(b).install_count.total_cmp(&ext(a).install_count))
        });
        return;
    }

    match sort_by {
        SortBy::Title => {
            candidates.sort_by(|&a, &b| ext(a).record.display_name.cmp(&ext(b).record.display_name));
            if sort_order == SortOrder::Descending {
                candidates.reverse();
            }
        }
        SortBy::PublisherName => {
            candidates.sort_by(|&a, &b| ext(a).publisher_text.cmp(&ext(b).publisher_text));
            if sort_order == SortOrder::Descending {
                candidates.reverse();
            }
        }
        SortBy::AverageRating => {
            candidates.sort_by(|&a, &b| ext(b).average_rating.total_cmp(&ext(a).average_rating));
            if sort_order == SortOrder::Ascending {
                candidates.reverse();
            }
        }
        SortBy::WeightedRating => {
            candidates.sort_by(|&a, &b| ext(b).weighted_rating.total_cmp(&ext(a).weighted_rating));
            if sort_order == SortOrder::Ascending {
                candidates.reverse();
            }
        }
        SortBy::LastUpdatedDate => {
            candidates.sort_by(|&a, &b| ext(b).record.last_updated.cmp(&ext(a).record.last_updated));
            if sort_order == SortOrder::Ascending {
                candidates.reverse();
            }
        }
        SortBy::PublishedDate => {
            candidates
                .sort_by(|&a, &b| ext(b).record.published_date.cmp(&ext(a).record.published_date));
            if sort_order == SortOrder::Ascending {
                candidates.reverse();
            }
        }
        // Without search relevance the marketplace default is popularity.
        SortBy::NoneOrRelevance | SortBy::InstallCount => {
            candidates.sort_by(|&a, &b| ext(b).install_count.total_cmp(&ext(a).install_count));
            if sort_order == SortOrder::Ascending {
                candidates.reverse();
            }
        }
    }
}

/// Populate only the sub-objects the request's flag bitset asked for.
fn shape(record: &GalleryExtension, flags: QueryFlags) -> GalleryExtension {
    let mut out = record.clone();

    if flags.contains(QueryFlags::INCLUDE_LATEST_VERSION_ONLY)
        && !flags.contains(QueryFlags::INCLUDE_VERSIONS)
    {
        if let Some(head) = out.versions.first().map(|v| v.version.clone()) {
            out.versions.retain(|v| v.version == head);
        }
    } else if !flags.contains(QueryFlags::INCLUDE_VERSIONS) {
        out.versions.clear();
    }

    for version in &mut out.versions {
        if !flags.contains(QueryFlags::INCLUDE_FILES) {
            version.files.clear();
        }
        if !flags.contains(QueryFlags::INCLUDE_VERSION_PROPERTIES) {
            version.properties.clear();
        }
        if !flags.contains(QueryFlags::INCLUDE_ASSET_URI) {
            version.asset_uri.clear();
            version.fallback_asset_uri.clear();
        }
    }

    if !flags.contains(QueryFlags::INCLUDE_STATISTICS) {
        out.statistics.clear();
    }
    if !flags.contains(QueryFlags::INCLUDE_CATEGORY_AND_TAGS) {
        out.categories.clear();
        out.tags.clear();
    }
    if flags.contains(QueryFlags::INCLUDE_INSTALLATION_TARGETS) {
        out.extra.insert(
            "installationTargets".to_owned(),
            serde_json::json!([{ "target": asset::TARGET_PRODUCT, "targetVersion": "" }]),
        );
    }
    out
}

#[derive(Debug)]
pub enum UpdateCheck {
    /// No release mirrored for this (quality, platform).
    Unknown,
    /// The client already runs the mirrored commit.
    UpToDate,
    /// A different build is available; `url` points back at this gallery.
    Update(Box<ReleaseManifest>),
}

pub fn update_check(
    snapshot: &Snapshot,
    quality: Quality,
    platform: &str,
    commit: &str,
    base: &str,
) -> UpdateCheck {
    let Some(release) = snapshot.release(quality, platform) else {
        return UpdateCheck::Unknown;
    };
    if release.version.as_str() == commit {
        return UpdateCheck::UpToDate;
    }
    let mut manifest = release.clone();
    manifest.url = format!(
        "{base}/binaries/{quality}/{platform}/{}/{}",
        release.version,
        release.payload_filename()
    );
    UpdateCheck::Update(Box::new(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build_snapshot;
    use serde_json::{json, Map};
    use vscmirror_schema::{
        GalleryAsset, GalleryExtensionVersion, GalleryPublisher, GalleryStatistic,
    };
    use vscmirror_store::{BinaryStore, ExtensionStore, StoreLayout};

    fn record(
        publisher: &str,
        name: &str,
        installs: f64,
        tags: &[&str],
        flags: &str,
    ) -> GalleryExtension {
        GalleryExtension {
            extension_id: format!("{publisher}-{name}-id"),
            extension_name: name.to_owned(),
            display_name: name.replace('-', " "),
            short_description: format!("a {name} helper"),
            publisher: GalleryPublisher {
                publisher_name: publisher.to_owned(),
                ..Default::default()
            },
            versions: vec![
                GalleryExtensionVersion {
                    version: "2.0.0".to_owned(),
                    target_platform: None,
                    flags: String::new(),
                    last_updated: "2024-06-01T00:00:00Z".to_owned(),
                    files: vec![GalleryAsset {
                        asset_type: "Microsoft.VisualStudio.Services.VSIXPackage".to_owned(),
                        source: "https://upstream/x.vsix".to_owned(),
                        size: Some(10),
                        extra: Map::new(),
                    }],
                    properties: Vec::new(),
                    asset_uri: String::new(),
                    fallback_asset_uri: String::new(),
                    extra: Map::new(),
                },
                GalleryExtensionVersion {
                    version: "1.0.0".to_owned(),
                    target_platform: None,
                    flags: String::new(),
                    last_updated: "2024-01-01T00:00:00Z".to_owned(),
                    files: Vec::new(),
                    properties: Vec::new(),
                    asset_uri: String::new(),
                    fallback_asset_uri: String::new(),
                    extra: Map::new(),
                },
            ],
            statistics: vec![GalleryStatistic {
                statistic_name: "install".to_owned(),
                value: installs,
                extra: Map::new(),
            }],
            categories: vec!["Programming Languages".to_owned()],
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            flags: flags.to_owned(),
            last_updated: "2024-06-01T00:00:00Z".to_owned(),
            published_date: "2021-01-01T00:00:00Z".to_owned(),
            recommended: false,
            extra: Map::new(),
        }
    }

    fn snapshot() -> (tempfile::TempDir, Snapshot) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = ExtensionStore::new(layout.clone());
        store
            .put(&record("ms-python", "python", 90_000_000.0, &["python", "linting"], "validated, public"))
            .unwrap();
        store
            .put(&record("rust-lang", "rust-analyzer", 3_000_000.0, &["rust"], "validated, public"))
            .unwrap();
        store
            .put(&record("acme", "python-preview", 10.0, &["python"], "public, preview"))
            .unwrap();
        let snapshot = build_snapshot(&layout, "http://mirror").unwrap();
        (dir, snapshot)
    }

    fn query_json(criteria: serde_json::Value, flags: u32) -> ExtensionQuery {
        serde_json::from_value(json!({
            "filters": [{
                "criteria": criteria,
                "pageNumber": 1, "pageSize": 50,
                "sortBy": 0, "sortOrder": 0
            }],
            "assetTypes": [],
            "flags": flags
        }))
        .unwrap()
    }

    #[test]
    fn extension_name_filter_is_exact() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 7, "value": "MS-PYTHON.PYTHON"}]), 0x1);
        let outcome = execute(&snap, &q);
        assert_eq!(outcome.total, 1);
        assert_eq!(outcome.extensions[0].extension_name, "python");

        let q = query_json(json!([{"filterType": 7, "value": "ms-python.nothing"}]), 0);
        assert_eq!(execute(&snap, &q).total, 0);
    }

    #[test]
    fn tag_and_category_filters_restrict() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 1, "value": "rust"}]), 0);
        assert_eq!(execute(&snap, &q).total, 1);

        let q = query_json(json!([{"filterType": 5, "value": "Programming Languages"}]), 0);
        assert_eq!(execute(&snap, &q).total, 3);

        let q = query_json(json!([{"filterType": 5, "value": "Themes"}]), 0);
        assert_eq!(execute(&snap, &q).total, 0);
    }

    #[test]
    fn exclude_with_flags_drops_matching_records() {
        let (_dir, snap) = snapshot();
        // 0x200 = preview
        let q = query_json(
            json!([
                {"filterType": 10, "value": "python"},
                {"filterType": 12, "value": "512"}
            ]),
            0,
        );
        let outcome = execute(&snap, &q);
        assert_eq!(outcome.total, 1);
        assert_eq!(outcome.extensions[0].extension_name, "python");
    }

    #[test]
    fn search_text_matches_and_ranks() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 10, "value": "python"}]), 0x100);
        let outcome = execute(&snap, &q);
        assert_eq!(outcome.total, 2);
        // exact-name hit with massive installs ranks first
        assert_eq!(outcome.extensions[0].extension_name, "python");
    }

    #[test]
    fn search_requires_every_token() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 10, "value": "python zebra"}]), 0);
        assert_eq!(execute(&snap, &q).total, 0);
    }

    #[test]
    fn target_mismatch_empties_result() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 8, "value": "SomeOther.Product"}]), 0);
        assert_eq!(execute(&snap, &q).total, 0);
    }

    #[test]
    fn default_sort_is_install_count_desc() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 8, "value": "Microsoft.VisualStudio.Code"}]), 0);
        let outcome = execute(&snap, &q);
        let names: Vec<&str> = outcome
            .extensions
            .iter()
            .map(|e| e.extension_name.as_str())
            .collect();
        assert_eq!(names, ["python", "rust-analyzer", "python-preview"]);
    }

    #[test]
    fn pagination_is_one_based() {
        let (_dir, snap) = snapshot();
        let q: ExtensionQuery = serde_json::from_value(json!({
            "filters": [{
                "criteria": [{"filterType": 8, "value": "Microsoft.VisualStudio.Code"}],
                "pageNumber": 2, "pageSize": 2
            }],
            "flags": 0
        }))
        .unwrap();
        let outcome = execute(&snap, &q);
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.extensions.len(), 1);
        assert_eq!(outcome.extensions[0].extension_name, "python-preview");
    }

    #[test]
    fn flags_gate_subobjects() {
        let (_dir, snap) = snapshot();
        // no version flag at all
        let q = query_json(json!([{"filterType": 7, "value": "ms-python.python"}]), 0);
        let bare = &execute(&snap, &q).extensions[0];
        assert!(bare.versions.is_empty());
        assert!(bare.statistics.is_empty());
        assert!(bare.categories.is_empty() && bare.tags.is_empty());

        // versions + files + stats + category/tags + asset uri
        let q = query_json(
            json!([{"filterType": 7, "value": "ms-python.python"}]),
            0x1 | 0x2 | 0x4 | 0x80 | 0x100,
        );
        let full = &execute(&snap, &q).extensions[0];
        assert_eq!(full.versions.len(), 2);
        assert!(!full.versions[0].files.is_empty());
        assert!(!full.statistics.is_empty());
        assert!(!full.tags.is_empty());
        assert!(full.versions[0].asset_uri.starts_with("http://mirror/assets/"));
    }

    #[test]
    fn latest_version_only_keeps_head() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 7, "value": "ms-python.python"}]), 0x200 | 0x2);
        let ext = &execute(&snap, &q).extensions[0];
        assert_eq!(ext.versions.len(), 1);
        assert_eq!(ext.versions[0].version, "2.0.0");
    }

    #[test]
    fn installation_targets_added_on_request() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 7, "value": "ms-python.python"}]), 0x40);
        let ext = &execute(&snap, &q).extensions[0];
        assert_eq!(
            ext.extra["installationTargets"][0]["target"],
            "Microsoft.VisualStudio.Code"
        );
    }

    #[test]
    fn rewritten_sources_point_at_gallery() {
        let (_dir, snap) = snapshot();
        let q = query_json(json!([{"filterType": 7, "value": "ms-python.python"}]), 0x1 | 0x2);
        let ext = &execute(&snap, &q).extensions[0];
        for version in &ext.versions {
            for file in &version.files {
                assert!(
                    file.source.starts_with("http://mirror/assets/ms-python.python/"),
                    "{}",
                    file.source
                );
            }
        }
    }

    #[test]
    fn unknown_filter_types_are_ignored() {
        let (_dir, snap) = snapshot();
        let q = query_json(
            json!([
                {"filterType": 14, "value": "whatever"},
                {"filterType": 7, "value": "ms-python.python"}
            ]),
            0,
        );
        assert_eq!(execute(&snap, &q).total, 1);
    }

    #[test]
    fn update_check_states() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let release: ReleaseManifest = serde_json::from_value(json!({
            "url": "https://upstream/code.tar.gz", "name": "1.92.1", "version": "newcommit",
            "productVersion": "1.92.1", "timestamp": 5,
            "platform": "linux-x64", "quality": "stable"
        }))
        .unwrap();
        BinaryStore::new(layout.clone())
            .put_latest(Quality::Stable, "linux-x64", &release)
            .unwrap();
        let snap = build_snapshot(&layout, "http://mirror").unwrap();

        assert!(matches!(
            update_check(&snap, Quality::Stable, "darwin", "x", "http://mirror"),
            UpdateCheck::Unknown
        ));
        assert!(matches!(
            update_check(&snap, Quality::Stable, "linux-x64", "newcommit", "http://mirror"),
            UpdateCheck::UpToDate
        ));
        match update_check(&snap, Quality::Stable, "linux-x64", "oldcommit", "http://mirror") {
            UpdateCheck::Update(manifest) => {
                assert_eq!(
                    manifest.url,
                    "http://mirror/binaries/stable/linux-x64/newcommit/vscode-1.92.1.tar.gz"
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
    }
}
