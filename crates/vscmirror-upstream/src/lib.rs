//! Typed, configuration-driven client for the upstream endpoints the mirror
//! consumes: the per-quality release-manifest API, the marketplace query API,
//! and the recommendation / malicious-list artifacts.
//!
//! Calls are stateless, carry per-call deadlines, and retry connection
//! errors and 5xx responses with exponential backoff; 4xx responses surface
//! as typed failures without retry. The [`UpstreamSource`] trait is the seam
//! the synchronizer is tested through.

pub mod client;
pub mod config;

pub use client::UpstreamClient;
pub use config::{RetryPolicy, UpstreamConfig};

use std::io::Read;
use thiserror::Error;
use vscmirror_schema::{GalleryExtension, Quality, ReleaseManifest};

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection failures, timeouts, and 5xx responses that survived the
    /// retry budget.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// Definitive upstream refusal (4xx); never retried.
    #[error("upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A streaming asset download: the body reader plus whatever the upstream
/// declared about it.
pub struct AssetBody {
    pub reader: Box<dyn Read + Send>,
    pub declared_len: Option<u64>,
    pub content_type: Option<String>,
}

/// The upstream operations the synchronizer depends on.
pub trait UpstreamSource: Send + Sync {
    /// Latest release for one (platform, quality); `None` when the upstream
    /// answers 204 (nothing newer than the probe commit).
    fn release_manifest(
        &self,
        platform: &str,
        quality: Quality,
    ) -> Result<Option<ReleaseManifest>, UpstreamError>;

    /// Look one extension up by exact `publisher.name`. `None` when the
    /// marketplace no longer lists it.
    fn extension_by_name(
        &self,
        name: &str,
        include_prerelease: bool,
    ) -> Result<Option<GalleryExtension>, UpstreamError>;

    /// Look one extension up by its upstream id, full version history.
    fn extension_by_id(&self, extension_id: &str)
        -> Result<Option<GalleryExtension>, UpstreamError>;

    /// Free-text marketplace search; `limit == 0` means unbounded.
    fn search(&self, text: &str, limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError>;

    /// The top-N marketplace slice by install count.
    fn top_by_installs(&self, limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError>;

    /// Upstream recommendation groups (lists of `publisher.name` ids).
    fn recommendation_groups(&self) -> Result<Vec<Vec<String>>, UpstreamError>;

    /// The upstream deny list.
    fn malicious_identifiers(&self) -> Result<Vec<String>, UpstreamError>;

    /// Open a streaming download of an asset or binary payload.
    fn fetch_asset(&self, url: &str) -> Result<AssetBody, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_is_typed() {
        let e = UpstreamError::Status {
            status: 404,
            url: "https://x".to_owned(),
        };
        assert!(e.to_string().contains("404"));
    }
}
