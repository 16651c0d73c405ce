//! Binary-release manifest, wire-compatible with the editor's update API.

use crate::types::{CommitId, Quality};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One platform build of the editor, as described by the upstream update
/// endpoint and persisted as `latest.json` / `release.json` in the store.
///
/// On the wire `version` is the commit id and `name` is the human-readable
/// version string. The `platform` and `quality` fields are mirror-side
/// bookkeeping absent from upstream responses; unknown upstream fields are
/// carried in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub url: String,
    pub name: String,
    pub version: CommitId,
    #[serde(rename = "productVersion", default)]
    pub product_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "sha256hash", default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(rename = "supportsFastUpdate", default)]
    pub supports_fast_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReleaseManifest {
    /// Filename the payload is stored under, derived from the upstream URL so
    /// archives keep their real extension (`.tar.gz`, `.zip`, `.exe`, …).
    pub fn payload_filename(&self) -> String {
        let tail = self
            .url
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        let suffix = match tail.find('.') {
            Some(idx) => &tail[idx..],
            None => "",
        };
        format!("vscode-{}{}", self.name, suffix)
    }
}
