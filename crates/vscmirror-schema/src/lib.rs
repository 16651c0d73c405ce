//! Shared data model for the vscmirror workspace.
//!
//! This crate defines the identity newtypes, the marketplace wire types
//! (extensions, versions, assets), the release-manifest shape of the update
//! API, and the query protocol (filter types, query flags, sort orders).
//! Wire types tolerate unknown fields on decode and carry them through on
//! re-encode, so the mirror never drops data the upstream added.

pub mod gallery;
pub mod query;
pub mod release;
pub mod types;

pub use gallery::{
    GalleryAsset, GalleryExtension, GalleryExtensionVersion, GalleryProperty, GalleryPublisher,
    GalleryStatistic,
};
pub use query::{
    extension_flag_bits, Criterion, ExtensionQuery, FilterType, QueryFilter, QueryFlags,
    QueryResponse, SortBy, SortOrder,
};
pub use release::ReleaseManifest;
pub use types::{compare_versions, CommitId, ExtensionId, Quality};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid extension identifier '{0}': expected publisher.name")]
    InvalidExtensionId(String),
    #[error("unknown quality channel '{0}'")]
    UnknownQuality(String),
}

/// Well-known asset-type and property strings used on the marketplace wire.
pub mod asset {
    /// The installable extension package.
    pub const VSIX_PACKAGE: &str = "Microsoft.VisualStudio.Services.VSIXPackage";
    /// The extension manifest (may declare an extension pack).
    pub const CODE_MANIFEST: &str = "Microsoft.VisualStudio.Code.Manifest";
    pub const VSIX_MANIFEST: &str = "Microsoft.VisualStudio.Services.VsixManifest";
    pub const DETAILS: &str = "Microsoft.VisualStudio.Services.Content.Details";
    pub const CHANGELOG: &str = "Microsoft.VisualStudio.Services.Content.Changelog";
    pub const LICENSE: &str = "Microsoft.VisualStudio.Services.Content.License";
    pub const ICON_DEFAULT: &str = "Microsoft.VisualStudio.Services.Icons.Default";
    pub const ICON_SMALL: &str = "Microsoft.VisualStudio.Services.Icons.Small";

    /// Version property marking publisher-flagged pre-releases.
    pub const PRERELEASE_PROPERTY: &str = "Microsoft.VisualStudio.Code.PreRelease";
    /// Version property carrying the engine-compatibility constraint.
    pub const ENGINE_PROPERTY: &str = "Microsoft.VisualStudio.Code.Engine";

    /// Product identifier the editor sends in Target filter criteria.
    pub const TARGET_PRODUCT: &str = "Microsoft.VisualStudio.Code";
}
