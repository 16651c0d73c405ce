use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use vscmirror_schema::{ExtensionId, Quality};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of the artifact root.
///
/// ```text
/// /binaries/<quality>/<platform>/<commit>/<payload>
/// /binaries/<quality>/<platform>/<commit>/release.json
/// /binaries/<quality>/<platform>/latest.json
/// /extensions/<publisher.name>/<version>[/<targetPlatform>]/<assets>
/// /extensions/<publisher.name>/latest.json
/// /extensions/extensions.json
/// /extensions/recommended.json
/// /extensions/malicious.json
/// /specified.json
/// /updated.json
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn binaries_dir(&self) -> PathBuf {
        self.root.join("binaries")
    }

    #[inline]
    pub fn binary_platform_dir(&self, quality: Quality, platform: &str) -> PathBuf {
        self.binaries_dir().join(quality.as_str()).join(platform)
    }

    #[inline]
    pub fn binary_commit_dir(&self, quality: Quality, platform: &str, commit: &str) -> PathBuf {
        self.binary_platform_dir(quality, platform).join(commit)
    }

    #[inline]
    pub fn binary_latest_path(&self, quality: Quality, platform: &str) -> PathBuf {
        self.binary_platform_dir(quality, platform).join("latest.json")
    }

    #[inline]
    pub fn binary_release_path(&self, quality: Quality, platform: &str, commit: &str) -> PathBuf {
        self.binary_commit_dir(quality, platform, commit)
            .join("release.json")
    }

    #[inline]
    pub fn extensions_dir(&self) -> PathBuf {
        self.root.join("extensions")
    }

    #[inline]
    pub fn extension_dir(&self, id: &ExtensionId) -> PathBuf {
        self.extensions_dir().join(id.as_str())
    }

    pub fn version_dir(
        &self,
        id: &ExtensionId,
        version: &str,
        target_platform: Option<&str>,
    ) -> PathBuf {
        let mut dir = self.extension_dir(id).join(version);
        if let Some(target) = target_platform {
            dir = dir.join(target);
        }
        dir
    }

    #[inline]
    pub fn extension_latest_path(&self, id: &ExtensionId) -> PathBuf {
        self.extension_dir(id).join("latest.json")
    }

    #[inline]
    pub fn extensions_index_path(&self) -> PathBuf {
        self.extensions_dir().join("extensions.json")
    }

    #[inline]
    pub fn recommended_path(&self) -> PathBuf {
        self.extensions_dir().join("recommended.json")
    }

    #[inline]
    pub fn malicious_path(&self) -> PathBuf {
        self.extensions_dir().join("malicious.json")
    }

    #[inline]
    pub fn specified_path(&self) -> PathBuf {
        self.root.join("specified.json")
    }

    /// Completion marker rewritten at the end of every sync pass; the gallery
    /// watches its mtime to trigger index rebuilds.
    #[inline]
    pub fn updated_path(&self) -> PathBuf {
        self.root.join("updated.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Resolve a relative path against the root, rejecting anything that
    /// would step outside it. All download destinations go through here.
    pub fn resolve(&self, relpath: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(relpath);
        if rel.is_absolute() {
            return Err(StoreError::PathEscape(relpath.to_owned()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StoreError::PathEscape(relpath.to_owned())),
            }
        }
        Ok(self.root.join(rel))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.binaries_dir())?;
        fs::create_dir_all(self.extensions_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
