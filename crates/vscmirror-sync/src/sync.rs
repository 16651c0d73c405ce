use crate::concurrency::{shutdown_requested, StoreLock};
use crate::config::SyncConfig;
use crate::pool::{DownloadPool, PoolReport, Progress};
use crate::resolver::{self, version_key, Catalog, ResolvedCatalog, SyncMode};
use crate::SyncError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use vscmirror_schema::GalleryExtension;
use vscmirror_store::{
    satisfies, write_json_atomic, BinaryStore, ExtensionStore, MaliciousList, SpecifiedList,
    StoreLayout,
};
use vscmirror_upstream::{UpstreamError, UpstreamSource};

/// What a pass covers. The CLI maps its subcommands onto this.
#[derive(Debug, Clone, Copy)]
pub struct SyncOps {
    pub binaries: bool,
    pub extensions: Option<SyncMode>,
    pub refresh_malicious: bool,
}

impl SyncOps {
    /// The standing full pass: binaries, recommended+specified extensions,
    /// malicious refresh.
    pub fn full() -> Self {
        Self {
            binaries: true,
            extensions: Some(SyncMode::Recommended),
            refresh_malicious: true,
        }
    }

    pub fn binaries_only() -> Self {
        Self {
            binaries: true,
            extensions: None,
            refresh_malicious: false,
        }
    }

    pub fn extensions_only(mode: SyncMode) -> Self {
        Self {
            binaries: false,
            extensions: Some(mode),
            refresh_malicious: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
    pub binaries_published: usize,
    pub extensions_published: usize,
    pub extensions_removed: usize,
    pub versions_trimmed: usize,
    pub builds_trimmed: usize,
    pub purged: usize,
    /// Per-item soft failures, for the operator's eyes; they never fail the
    /// pass.
    pub item_errors: Vec<String>,
    pub cancelled: bool,
}

impl PassSummary {
    fn note(&mut self, what: impl Into<String>) {
        let what = what.into();
        tracing::warn!("{what}");
        self.item_errors.push(what);
    }
}

/// Orchestrates one pass: refresh catalogs, resolve, fetch, publish,
/// retention, purge, aggregates, signal.
pub struct Synchronizer<'a> {
    config: &'a SyncConfig,
    upstream: &'a dyn UpstreamSource,
    layout: StoreLayout,
    progress: Arc<Progress>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(config: &'a SyncConfig, upstream: &'a dyn UpstreamSource) -> Self {
        Self {
            layout: StoreLayout::new(&config.artifact_root),
            config,
            upstream,
            progress: Arc::new(Progress::default()),
        }
    }

    /// Counters a UI thread can poll during [`run_pass`].
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Run passes on the configured interval until shutdown; one-shot when
    /// no interval is configured.
    pub fn run_loop(&self, ops: SyncOps) -> Result<PassSummary, SyncError> {
        loop {
            let summary = self.run_pass(ops)?;
            let Some(interval) = self.config.interval else {
                return Ok(summary);
            };
            tracing::info!("pass complete, sleeping {interval:?}");
            let mut slept = Duration::ZERO;
            while slept < interval {
                if shutdown_requested() {
                    return Ok(summary);
                }
                let step = Duration::from_secs(1).min(interval - slept);
                std::thread::sleep(step);
                slept += step;
            }
        }
    }

    /// One complete pass. Always leaves the store consistent: every
    /// `latest.json` written reflects only fully committed versions.
    pub fn run_pass(&self, ops: SyncOps) -> Result<PassSummary, SyncError> {
        if shutdown_requested() {
            return Err(SyncError::Cancelled);
        }
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let mut summary = PassSummary::default();

        // 1. Refresh upstream catalogs.
        let catalog = self.fetch_catalog(ops, &mut summary)?;

        // 2. Resolve work, retain and purge sets against the store.
        let resolved = resolver::resolve(&catalog, &self.layout, self.config)?;
        tracing::info!(
            "resolved {} downloads ({} already satisfied), {} purges",
            resolved.work.len(),
            resolved.satisfied,
            resolved.purge.len()
        );

        // 3+4. Fetch everything through the pool.
        let cancel = || shutdown_requested();
        let pool = DownloadPool::new(self.config.pool_width, self.config.upstream.retry);
        let report = pool.run(
            self.upstream,
            &self.layout,
            resolved.work.clone(),
            &cancel,
            &self.progress,
        );
        summary.downloaded = report.downloaded;
        summary.skipped = report.skipped + resolved.satisfied;
        summary.failed = report.failed;
        summary.bytes = report.bytes;
        summary.cancelled = cancel();
        for failure in &report.failures {
            summary
                .item_errors
                .push(format!("{}: {}", failure.identity, failure.error));
        }

        // 5. Publish binaries whose payloads fully committed.
        self.publish_binaries(&resolved, &report, &mut summary)?;

        // 6. Publish extension records; per-extension retention rides along.
        self.publish_extensions(&resolved, &report, &mut summary)?;

        // Retention over everything already in the store.
        self.retain_extensions(&resolved.retain, &mut summary)?;
        self.retain_binaries(&mut summary)?;

        // 7. Purge malicious entries.
        let ext_store = ExtensionStore::new(self.layout.clone());
        for id in &resolved.purge {
            tracing::warn!("purging malicious extension {id}");
            ext_store.remove(id)?;
            summary.purged += 1;
        }

        // 8. Rewrite aggregates, then signal readers.
        ext_store.write_index(&ext_store.list()?)?;
        self.write_recommended(&catalog)?;
        write_json_atomic(
            &self.layout.updated_path(),
            &serde_json::json!({ "updated": chrono::Utc::now().to_rfc3339() }),
        )?;

        tracing::info!(
            "pass done: {} downloaded, {} skipped, {} failed, {} bytes",
            summary.downloaded,
            summary.skipped,
            summary.failed,
            summary.bytes
        );
        Ok(summary)
    }

    /// Gather upstream state for the requested operations. Per-item failures
    /// are soft; only a fully unreachable upstream is fatal.
    fn fetch_catalog(&self, ops: SyncOps, summary: &mut PassSummary) -> Result<Catalog, SyncError> {
        let mut catalog = Catalog::default();
        let mut attempted = 0usize;
        let mut reachable = 0usize;

        let mut malicious = MaliciousList::load(&self.layout)?;
        if ops.refresh_malicious {
            attempted += 1;
            match self.upstream.malicious_identifiers() {
                Ok(ids) => {
                    reachable += 1;
                    for id in ids {
                        if !malicious.malicious.iter().any(|m| m.eq_ignore_ascii_case(&id)) {
                            malicious.malicious.push(id);
                        }
                    }
                    malicious.save(&self.layout)?;
                }
                Err(e) => summary.note(format!("malicious list refresh failed: {e}")),
            }
        }
        catalog.malicious = malicious;

        if ops.binaries {
            for &quality in &self.config.qualities {
                for platform in &self.config.platforms {
                    attempted += 1;
                    match self.upstream.release_manifest(platform, quality) {
                        Ok(Some(release)) => {
                            reachable += 1;
                            catalog.releases.push(release);
                        }
                        Ok(None) => {
                            reachable += 1;
                            tracing::debug!("no release listed for {quality}/{platform}");
                        }
                        Err(e) => summary.note(format!("{quality}/{platform}: {e}")),
                    }
                }
            }
        }

        if let Some(mode) = ops.extensions {
            let (count, ok) = self.fetch_extension_candidates(mode, &mut catalog, summary)?;
            attempted += count;
            reachable += ok;
        }

        if attempted > 0 && reachable == 0 {
            return Err(SyncError::UpstreamUnreachable);
        }
        Ok(catalog)
    }

    fn fetch_extension_candidates(
        &self,
        mode: SyncMode,
        catalog: &mut Catalog,
        summary: &mut PassSummary,
    ) -> Result<(usize, usize), SyncError> {
        let mut attempted = 0usize;
        let mut reachable = 0usize;
        // Dedup by identity; a later recommended marking sticks.
        let mut candidates: HashMap<String, GalleryExtension> = HashMap::new();
        let mut add = |ext: GalleryExtension, recommended: bool| {
            let key = ext.identity().normalized();
            match candidates.get_mut(&key) {
                Some(existing) => existing.recommended |= recommended,
                None => {
                    let mut ext = ext;
                    ext.recommended = recommended;
                    candidates.insert(key, ext);
                }
            }
        };

        match mode {
            SyncMode::All => {
                attempted += 1;
                match self.upstream.search("", 0) {
                    Ok(all) => {
                        reachable += 1;
                        tracing::info!("marketplace enumeration returned {} extensions", all.len());
                        for ext in all {
                            add(ext, false);
                        }
                    }
                    Err(e) => summary.note(format!("marketplace enumeration failed: {e}")),
                }
            }
            SyncMode::Specified => {
                let (a, r) = self.fetch_specified(&mut add, summary)?;
                attempted += a;
                reachable += r;
            }
            SyncMode::Recommended => {
                attempted += 1;
                match self.upstream.recommendation_groups() {
                    Ok(groups) => {
                        reachable += 1;
                        for id in groups.iter().flatten() {
                            attempted += 1;
                            match self
                                .upstream
                                .extension_by_name(id, self.config.include_prerelease)
                            {
                                Ok(Some(ext)) => {
                                    reachable += 1;
                                    add(ext, true);
                                }
                                Ok(None) => {
                                    reachable += 1;
                                    // Stale recommendation; skip without caching.
                                    tracing::debug!("recommended extension '{id}' no longer exists upstream");
                                }
                                Err(e) => summary.note(format!("recommended '{id}': {e}")),
                            }
                        }
                        catalog.recommendation_groups = groups;
                    }
                    Err(e) => summary.note(format!("recommendations fetch failed: {e}")),
                }

                let (a, r) = self.fetch_specified(&mut add, summary)?;
                attempted += a;
                reachable += r;

                if self.config.total_recommended > 0 {
                    attempted += 1;
                    match self.upstream.top_by_installs(self.config.total_recommended) {
                        Ok(top) => {
                            reachable += 1;
                            for ext in top {
                                let ext = self.backfill_release_versions(ext, summary);
                                add(ext, true);
                            }
                        }
                        Err(e) => summary.note(format!("top-installed slice failed: {e}")),
                    }
                }
            }
        }

        catalog.extensions = candidates.into_values().collect();
        catalog
            .extensions
            .sort_by_key(|e| e.identity().normalized());
        Ok((attempted, reachable))
    }

    fn fetch_specified(
        &self,
        add: &mut dyn FnMut(GalleryExtension, bool),
        summary: &mut PassSummary,
    ) -> Result<(usize, usize), SyncError> {
        let mut attempted = 0usize;
        let mut reachable = 0usize;
        let specified = SpecifiedList::load_or_create(&self.layout)?;
        for id in &specified.extensions {
            attempted += 1;
            match self
                .upstream
                .extension_by_name(id, self.config.include_prerelease)
            {
                Ok(Some(ext)) => {
                    reachable += 1;
                    tracing::info!("mirroring specified extension {id}");
                    add(ext, false);
                }
                Ok(None) => {
                    reachable += 1;
                    summary.note(format!("specified extension '{id}' not found upstream"));
                }
                Err(e) => summary.note(format!("specified '{id}': {e}")),
            }
        }
        Ok((attempted, reachable))
    }

    /// The top-installed slice arrives latest-version-only; when that latest
    /// is a pre-release and pre-releases are excluded, refetch the full
    /// history by id and fall back to the newest release versions.
    fn backfill_release_versions(
        &self,
        ext: GalleryExtension,
        summary: &mut PassSummary,
    ) -> GalleryExtension {
        if self.config.include_prerelease || !ext.is_prerelease_only() || ext.extension_id.is_empty()
        {
            return ext;
        }
        match self.upstream.extension_by_id(&ext.extension_id) {
            Ok(Some(full)) => {
                let releases: Vec<_> = full
                    .latest_release_versions()
                    .into_iter()
                    .cloned()
                    .collect();
                if releases.is_empty() {
                    return ext;
                }
                let mut ext = ext;
                ext.versions = releases;
                ext
            }
            Ok(None) => ext,
            Err(e) => {
                summary.note(format!("release lookup for {}: {e}", ext.identity()));
                ext
            }
        }
    }

    fn publish_binaries(
        &self,
        resolved: &ResolvedCatalog,
        report: &PoolReport,
        summary: &mut PassSummary,
    ) -> Result<(), SyncError> {
        let store = BinaryStore::new(self.layout.clone());
        for target in &resolved.binaries {
            if !report.group_complete(&target.group) {
                tracing::debug!("{} incomplete, not publishing", target.group);
                continue;
            }
            let payload = self
                .layout
                .binary_commit_dir(target.quality, &target.platform, target.release.version.as_str())
                .join(target.release.payload_filename());
            if !satisfies(&payload, None, None) {
                summary.note(format!(
                    "{}/{}: payload absent after pool run, not publishing",
                    target.quality, target.platform
                ));
                continue;
            }

            // Monotonic: never point latest.json at something older.
            if let Ok(existing) = store.get_latest(target.quality, &target.platform) {
                if existing.version == target.release.version {
                    continue;
                }
                if existing.timestamp > target.release.timestamp {
                    tracing::warn!(
                        "{}/{}: upstream offered older build ({} < {}), keeping current",
                        target.quality,
                        target.platform,
                        target.release.timestamp,
                        existing.timestamp
                    );
                    continue;
                }
            }

            store.put_release(target.quality, &target.platform, &target.release)?;
            store.put_latest(target.quality, &target.platform, &target.release)?;
            summary.binaries_published += 1;
            tracing::info!(
                "published {}/{} {}",
                target.quality,
                target.platform,
                target.release.name
            );
        }
        Ok(())
    }

    fn publish_extensions(
        &self,
        resolved: &ResolvedCatalog,
        report: &PoolReport,
        summary: &mut PassSummary,
    ) -> Result<(), SyncError> {
        let store = ExtensionStore::new(self.layout.clone());
        for target in &resolved.extensions {
            let id = target.record.identity();

            // Keep only versions whose whole asset group committed and whose
            // files are really on disk.
            let mut publishable = Vec::new();
            for version in &target.record.versions {
                let target_platform = version.target_platform.as_deref();
                let group = format!("ext:{}", version_key(&id, &version.version, target_platform));
                if !report.group_complete(&group) {
                    tracing::debug!("{id} {}: incomplete, withheld", version.version);
                    continue;
                }
                let dir = self.layout.version_dir(&id, &version.version, target_platform);
                let mut version = version.clone();
                let mut all_present = true;
                for asset in &mut version.files {
                    let path = dir.join(&asset.asset_type);
                    match path.metadata() {
                        Ok(meta) if meta.is_file() => asset.size = Some(meta.len()),
                        _ => {
                            all_present = false;
                            break;
                        }
                    }
                }
                if all_present {
                    publishable.push(version);
                } else {
                    tracing::debug!("{id} {}: assets missing, withheld", version.version);
                }
            }

            // Merge with the published record so an interrupted pass never
            // shrinks what clients already see.
            let mut merged = publishable;
            let mut seen: HashSet<(String, Option<String>)> = merged
                .iter()
                .map(|v| (v.version.clone(), v.target_platform.clone()))
                .collect();
            if let Ok(existing) = store.get(&id) {
                for version in existing.versions {
                    let key = (version.version.clone(), version.target_platform.clone());
                    if seen.contains(&key) {
                        continue;
                    }
                    let dir = self.layout.version_dir(
                        &id,
                        &version.version,
                        version.target_platform.as_deref(),
                    );
                    if dir.is_dir() {
                        seen.insert(key);
                        merged.push(version);
                    }
                }
            }

            if merged.is_empty() {
                if store.exists(&id) {
                    store.remove(&id)?;
                    summary.extensions_removed += 1;
                }
                continue;
            }

            let mut record = target.record.clone();
            record.versions = merged;
            record.sort_versions();
            store.put(&record)?;
            summary.extensions_published += 1;
        }
        Ok(())
    }

    /// Keep the newest `keep_versions` distinct versions per extension, plus
    /// anything the retain set names; delete the rest and rewrite records.
    fn retain_extensions(
        &self,
        retain: &HashSet<String>,
        summary: &mut PassSummary,
    ) -> Result<(), SyncError> {
        let store = ExtensionStore::new(self.layout.clone());
        for mut record in store.list()? {
            let id = record.identity();
            record.sort_versions();

            let mut kept_versions: Vec<String> = Vec::new();
            let mut keep = Vec::new();
            let mut dropped = Vec::new();
            for version in record.versions {
                let key = version_key(&id, &version.version, version.target_platform.as_deref());
                let already_kept = kept_versions.iter().any(|v| v == &version.version);
                if already_kept
                    || kept_versions.len() < self.config.keep_versions
                    || retain.contains(&key)
                {
                    if !already_kept {
                        kept_versions.push(version.version.clone());
                    }
                    keep.push(version);
                } else {
                    dropped.push(version);
                }
            }

            if dropped.is_empty() {
                continue;
            }
            for version in &dropped {
                store.remove_version_dir(&id, &version.version, version.target_platform.as_deref())?;
                // The parent version directory may now be empty of targets.
                if version.target_platform.is_some() {
                    let parent = self.layout.version_dir(&id, &version.version, None);
                    let _ = std::fs::remove_dir(parent);
                }
                summary.versions_trimmed += 1;
                tracing::debug!("retention trimmed {id} {}", version.version);
            }
            record.versions = keep;
            if record.versions.is_empty() {
                store.remove(&id)?;
                summary.extensions_removed += 1;
            } else {
                store.put(&record)?;
            }
        }
        Ok(())
    }

    /// Keep the newest `keep_builds` commits per (quality, platform), never
    /// dropping the one `latest.json` points at.
    fn retain_binaries(&self, summary: &mut PassSummary) -> Result<(), SyncError> {
        let store = BinaryStore::new(self.layout.clone());
        for &quality in &self.config.qualities {
            for platform in &self.config.platforms {
                let current = store.get_latest(quality, platform).ok();
                let mut dirs = Vec::new();
                for (commit, path) in store.commit_dirs(quality, platform)? {
                    let timestamp = store
                        .get_release(quality, platform, &commit)
                        .map(|r| r.timestamp)
                        .unwrap_or(0);
                    dirs.push((timestamp, commit, path));
                }
                dirs.sort_by(|a, b| b.0.cmp(&a.0));

                for (_, commit, path) in dirs.into_iter().skip(self.config.keep_builds) {
                    if current
                        .as_ref()
                        .is_some_and(|latest| latest.version.as_str() == commit)
                    {
                        continue;
                    }
                    vscmirror_store::write::remove_recursive(&path)?;
                    summary.builds_trimmed += 1;
                    tracing::debug!("retention trimmed {quality}/{platform}/{commit}");
                }
            }
        }
        Ok(())
    }

    /// Rewrite `recommended.json` in the upstream artifact shape so the
    /// gallery can serve it back verbatim.
    fn write_recommended(&self, catalog: &Catalog) -> Result<(), SyncError> {
        let groups: Vec<Vec<String>> = if catalog.recommendation_groups.is_empty() {
            let recommended: Vec<String> = catalog
                .extensions
                .iter()
                .filter(|e| e.recommended)
                .map(|e| e.identity().as_str().to_owned())
                .collect();
            if recommended.is_empty() {
                return Ok(());
            }
            vec![recommended]
        } else {
            catalog.recommendation_groups.clone()
        };
        let shaped = serde_json::json!({
            "workspaceRecommendations": groups
                .iter()
                .map(|g| serde_json::json!({ "extensionIds": g }))
                .collect::<Vec<_>>()
        });
        write_json_atomic(&self.layout.recommended_path(), &shaped)?;
        Ok(())
    }
}

/// Map catalog-level upstream failures to an exit decision: a pass with any
/// reachable endpoint succeeds with item errors; totally unreachable fails.
pub fn is_fatal(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::UpstreamUnreachable
            | SyncError::Store(_)
            | SyncError::LockHeld(_)
            | SyncError::Upstream(UpstreamError::Io(_))
    )
}
