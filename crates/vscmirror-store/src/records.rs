use crate::layout::StoreLayout;
use crate::write::{remove_recursive, write_json_atomic};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use vscmirror_schema::{ExtensionId, GalleryExtension, Quality, ReleaseManifest};

/// Persistence for extension records under `/extensions`.
///
/// A record becomes visible only when its `latest.json` is renamed into
/// place, which the synchronizer does after every referenced version
/// directory is fully materialized. Scans tolerate concurrent writers by
/// skipping entries whose `latest.json` is missing or unreadable at that
/// instant.
pub struct ExtensionStore {
    layout: StoreLayout,
}

impl ExtensionStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Atomically publish the record's `latest.json`.
    pub fn put(&self, record: &GalleryExtension) -> Result<(), StoreError> {
        let id = ExtensionId::parse(record.identity().as_str())?;
        write_json_atomic(&self.layout.extension_latest_path(&id), record)
    }

    pub fn get(&self, id: &ExtensionId) -> Result<GalleryExtension, StoreError> {
        let path = self.layout.extension_latest_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn exists(&self, id: &ExtensionId) -> bool {
        self.layout.extension_latest_path(id).exists()
    }

    /// Remove the whole extension directory, versions included.
    pub fn remove(&self, id: &ExtensionId) -> Result<(), StoreError> {
        remove_recursive(&self.layout.extension_dir(id))
    }

    pub fn remove_version_dir(
        &self,
        id: &ExtensionId,
        version: &str,
        target_platform: Option<&str>,
    ) -> Result<(), StoreError> {
        remove_recursive(&self.layout.version_dir(id, version, target_platform))
    }

    /// Scan all extension records. Directories without a readable
    /// `latest.json` are skipped: they are either mid-write or garbage, and
    /// in both cases invisible by contract.
    pub fn list(&self) -> Result<Vec<GalleryExtension>, StoreError> {
        let dir = self.layout.extensions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let latest = entry.path().join("latest.json");
            let content = match fs::read_to_string(&latest) {
                Ok(content) => content,
                Err(e) => {
                    tracing::debug!("skipping {}: {e}", latest.display());
                    continue;
                }
            };
            match serde_json::from_str::<GalleryExtension>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("skipping unreadable record {}: {e}", latest.display());
                }
            }
        }
        records.sort_by_key(|r| r.identity().normalized());
        Ok(records)
    }

    /// Identifiers of every extension directory holding a `latest.json`.
    pub fn list_identities(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .list()?
            .iter()
            .map(|r| r.identity().normalized())
            .collect())
    }

    /// Version directories of one extension: `(dir_name, path)` pairs.
    pub fn version_dirs(&self, id: &ExtensionId) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let dir = self.layout.extension_dir(id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push((name.to_owned(), entry.path()));
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Atomically rewrite the flat `extensions.json` aggregate.
    pub fn write_index(&self, records: &[GalleryExtension]) -> Result<(), StoreError> {
        write_json_atomic(&self.layout.extensions_index_path(), &records)
    }

    pub fn read_index(&self) -> Result<Vec<GalleryExtension>, StoreError> {
        let path = self.layout.extensions_index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Persistence for binary releases under `/binaries`.
pub struct BinaryStore {
    layout: StoreLayout,
}

impl BinaryStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Publish the per-commit manifest inside the commit directory.
    pub fn put_release(
        &self,
        quality: Quality,
        platform: &str,
        release: &ReleaseManifest,
    ) -> Result<(), StoreError> {
        write_json_atomic(
            &self
                .layout
                .binary_release_path(quality, platform, release.version.as_str()),
            release,
        )
    }

    /// Point the platform's `latest.json` at this release.
    pub fn put_latest(
        &self,
        quality: Quality,
        platform: &str,
        release: &ReleaseManifest,
    ) -> Result<(), StoreError> {
        write_json_atomic(&self.layout.binary_latest_path(quality, platform), release)
    }

    pub fn get_latest(
        &self,
        quality: Quality,
        platform: &str,
    ) -> Result<ReleaseManifest, StoreError> {
        let path = self.layout.binary_latest_path(quality, platform);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("{quality}/{platform}")));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    pub fn get_release(
        &self,
        quality: Quality,
        platform: &str,
        commit: &str,
    ) -> Result<ReleaseManifest, StoreError> {
        let path = self.layout.binary_release_path(quality, platform, commit);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("{quality}/{platform}/{commit}")));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// Scan every platform's `latest.json`, skipping unreadable entries.
    pub fn list(&self) -> Result<Vec<ReleaseManifest>, StoreError> {
        let mut releases = Vec::new();
        let binaries = self.layout.binaries_dir();
        if !binaries.exists() {
            return Ok(releases);
        }
        for quality_entry in fs::read_dir(&binaries)? {
            let quality_entry = quality_entry?;
            if !quality_entry.file_type()?.is_dir() {
                continue;
            }
            for platform_entry in fs::read_dir(quality_entry.path())? {
                let platform_entry = platform_entry?;
                if !platform_entry.file_type()?.is_dir() {
                    continue;
                }
                let latest = platform_entry.path().join("latest.json");
                match fs::read_to_string(&latest) {
                    Ok(content) => match serde_json::from_str::<ReleaseManifest>(&content) {
                        Ok(release) => releases.push(release),
                        Err(e) => {
                            tracing::warn!("skipping unreadable release {}: {e}", latest.display());
                        }
                    },
                    Err(e) => {
                        tracing::debug!("skipping {}: {e}", latest.display());
                    }
                }
            }
        }
        Ok(releases)
    }

    /// Commit directories of one (quality, platform): `(commit, path)` pairs.
    pub fn commit_dirs(
        &self,
        quality: Quality,
        platform: &str,
    ) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let dir = self.layout.binary_platform_dir(quality, platform);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push((name.to_owned(), entry.path()));
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Operator-supplied allow list (`/specified.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecifiedList {
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl SpecifiedList {
    /// Load the allow list; a missing file is created empty so operators
    /// find a template to edit.
    pub fn load_or_create(layout: &StoreLayout) -> Result<Self, StoreError> {
        let path = layout.specified_path();
        if !path.exists() {
            let empty = SpecifiedList::default();
            write_json_atomic(&path, &empty)?;
            tracing::info!("created empty allow list at {}", path.display());
            return Ok(empty);
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(list) => Ok(list),
            Err(e) => {
                tracing::warn!("malformed {}: {e}; treating as empty", path.display());
                Ok(SpecifiedList::default())
            }
        }
    }
}

/// Deny list of malicious extension identifiers (`/extensions/malicious.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaliciousList {
    #[serde(default)]
    pub malicious: Vec<String>,
}

impl MaliciousList {
    pub fn load(layout: &StoreLayout) -> Result<Self, StoreError> {
        let path = layout.malicious_path();
        if !path.exists() {
            return Ok(MaliciousList::default());
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(list) => Ok(list),
            Err(e) => {
                tracing::warn!("malformed {}: {e}; treating as empty", path.display());
                Ok(MaliciousList::default())
            }
        }
    }

    pub fn save(&self, layout: &StoreLayout) -> Result<(), StoreError> {
        write_json_atomic(&layout.malicious_path(), self)
    }

    pub fn contains(&self, id: &ExtensionId) -> bool {
        let norm = id.normalized();
        self.malicious.iter().any(|m| m.eq_ignore_ascii_case(&norm))
    }
}
