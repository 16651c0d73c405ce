use std::path::PathBuf;
use std::time::Duration;
use vscmirror_schema::Quality;
use vscmirror_upstream::UpstreamConfig;

/// Everything a sync pass needs, constructed once at startup from CLI flags
/// (with env fallbacks) and passed down explicitly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub artifact_root: PathBuf,
    pub upstream: UpstreamConfig,
    /// Release channels mirrored for binaries.
    pub qualities: Vec<Quality>,
    /// Platform tags mirrored for binaries (e.g. `linux-x64`,
    /// `win32-x64-archive`).
    pub platforms: Vec<String>,
    /// Download pool width.
    pub pool_width: usize,
    /// Newest versions fetched per extension in a pass.
    pub versions_per_extension: usize,
    /// Retention: newest versions kept per extension.
    pub keep_versions: usize,
    /// Retention: newest builds kept per (quality, platform).
    pub keep_builds: usize,
    /// Size of the top-installed marketplace slice folded into the
    /// recommended set; 0 disables it.
    pub total_recommended: usize,
    pub include_prerelease: bool,
    /// Sleep between passes in periodic mode; `None` is one-shot.
    pub interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("./artifacts"),
            upstream: UpstreamConfig::default(),
            qualities: vec![Quality::Stable],
            platforms: vec![
                "win32-x64-archive".to_owned(),
                "linux-x64".to_owned(),
                "darwin-universal".to_owned(),
            ],
            pool_width: 8,
            versions_per_extension: 1,
            keep_versions: 2,
            keep_builds: 2,
            total_recommended: 500,
            include_prerelease: false,
            interval: None,
        }
    }
}

impl SyncConfig {
    /// Artifact root from `VSCMIRROR_ARTIFACTS` when the flag is absent.
    pub fn artifact_root_from_env() -> Option<PathBuf> {
        std::env::var_os("VSCMIRROR_ARTIFACTS").map(PathBuf::from)
    }
}
