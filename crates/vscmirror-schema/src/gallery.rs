//! Marketplace wire types for extensions, versions and assets.
//!
//! These shapes mirror what the upstream gallery returns from an extension
//! query; the same structs are persisted as each extension's `latest.json`.
//! Every struct keeps unrecognized fields in a flattened `extra` map so the
//! mirror re-serves whatever the upstream schema grows next.

use crate::asset;
use crate::types::{compare_versions, ExtensionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryPublisher {
    #[serde(rename = "publisherId", default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    #[serde(rename = "publisherName", default)]
    pub publisher_name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single file of an extension version, addressed by its asset-type string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryAsset {
    #[serde(rename = "assetType")]
    pub asset_type: String,
    #[serde(default)]
    pub source: String,
    /// On-disk payload size, stamped by the mirror after download. Absent in
    /// upstream responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryProperty {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryStatistic {
    #[serde(rename = "statisticName")]
    pub statistic_name: String,
    #[serde(default)]
    pub value: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryExtensionVersion {
    pub version: String,
    #[serde(
        rename = "targetPlatform",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_platform: Option<String>,
    #[serde(default)]
    pub flags: String,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: String,
    #[serde(default)]
    pub files: Vec<GalleryAsset>,
    #[serde(default)]
    pub properties: Vec<GalleryProperty>,
    #[serde(rename = "assetUri", default)]
    pub asset_uri: String,
    #[serde(rename = "fallbackAssetUri", default)]
    pub fallback_asset_uri: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GalleryExtensionVersion {
    /// Publisher-flagged pre-release, per the version's property bag.
    pub fn is_prerelease(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.key == asset::PRERELEASE_PROPERTY && p.value == "true")
    }

    pub fn asset(&self, asset_type: &str) -> Option<&GalleryAsset> {
        self.files.iter().find(|f| f.asset_type == asset_type)
    }

    /// Engine-compatibility constraint, if the publisher declared one.
    pub fn engine(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == asset::ENGINE_PROPERTY)
            .map(|p| p.value.as_str())
    }

    /// Identity of a version within its extension.
    pub fn identity(&self) -> (&str, Option<&str>) {
        (&self.version, self.target_platform.as_deref())
    }
}

/// The aggregate extension record: canonical metadata plus its versions,
/// newest first. This is both the query-response element and the persisted
/// `latest.json` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryExtension {
    #[serde(rename = "extensionId", default)]
    pub extension_id: String,
    #[serde(rename = "extensionName")]
    pub extension_name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "shortDescription", default)]
    pub short_description: String,
    #[serde(default)]
    pub publisher: GalleryPublisher,
    #[serde(default)]
    pub versions: Vec<GalleryExtensionVersion>,
    #[serde(default)]
    pub statistics: Vec<GalleryStatistic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: String,
    #[serde(rename = "lastUpdated", default)]
    pub last_updated: String,
    #[serde(rename = "publishedDate", default)]
    pub published_date: String,
    /// Mirror-side marker: the record came in through a recommendation set.
    #[serde(default)]
    pub recommended: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GalleryExtension {
    /// `publisher.name` identity of this record.
    pub fn identity(&self) -> ExtensionId {
        ExtensionId::from_parts(&self.publisher.publisher_name, &self.extension_name)
            .expect("gallery extension identity must be a valid publisher.name pair")
    }

    pub fn statistic(&self, name: &str) -> f64 {
        self.statistics
            .iter()
            .find(|s| s.statistic_name == name)
            .map(|s| s.value)
            .unwrap_or(0.0)
    }

    pub fn install_count(&self) -> f64 {
        self.statistic("install")
    }

    pub fn average_rating(&self) -> f64 {
        self.statistic("averagerating")
    }

    pub fn weighted_rating(&self) -> f64 {
        self.statistic("weightedRating")
    }

    /// Sort the version list newest first: version order descending, upload
    /// timestamp descending as the tie-break.
    pub fn sort_versions(&mut self) {
        self.versions.sort_by(|a, b| {
            compare_versions(&b.version, &a.version)
                .then_with(|| b.last_updated.cmp(&a.last_updated))
        });
    }

    /// Head of the sorted version list, skipping pre-releases unless opted in.
    pub fn latest_version(&self, include_prerelease: bool) -> Option<&GalleryExtensionVersion> {
        self.versions
            .iter()
            .find(|v| include_prerelease || !v.is_prerelease())
    }

    /// All entries of the newest non-prerelease version (one per target
    /// platform). Empty when every version is a pre-release.
    pub fn latest_release_versions(&self) -> Vec<&GalleryExtensionVersion> {
        let mut releases: Vec<&GalleryExtensionVersion> =
            self.versions.iter().filter(|v| !v.is_prerelease()).collect();
        releases.sort_by(|a, b| {
            compare_versions(&b.version, &a.version)
                .then_with(|| b.last_updated.cmp(&a.last_updated))
        });
        let Some(first) = releases.first() else {
            return Vec::new();
        };
        let latest = first.version.clone();
        releases.retain(|v| v.version == latest);
        releases
    }

    /// True when every listed version is a pre-release.
    pub fn is_prerelease_only(&self) -> bool {
        !self.versions.is_empty() && self.versions.iter().all(GalleryExtensionVersion::is_prerelease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(v: &str, updated: &str, prerelease: bool) -> GalleryExtensionVersion {
        let properties = if prerelease {
            vec![GalleryProperty {
                key: asset::PRERELEASE_PROPERTY.to_owned(),
                value: "true".to_owned(),
                extra: Map::new(),
            }]
        } else {
            Vec::new()
        };
        GalleryExtensionVersion {
            version: v.to_owned(),
            target_platform: None,
            flags: "validated".to_owned(),
            last_updated: updated.to_owned(),
            files: Vec::new(),
            properties,
            asset_uri: String::new(),
            fallback_asset_uri: String::new(),
            extra: Map::new(),
        }
    }

    fn extension(versions: Vec<GalleryExtensionVersion>) -> GalleryExtension {
        GalleryExtension {
            extension_id: "uuid-1".to_owned(),
            extension_name: "python".to_owned(),
            display_name: "Python".to_owned(),
            short_description: "Linting and more".to_owned(),
            publisher: GalleryPublisher {
                publisher_name: "ms-python".to_owned(),
                display_name: "Microsoft".to_owned(),
                ..Default::default()
            },
            versions,
            statistics: vec![GalleryStatistic {
                statistic_name: "install".to_owned(),
                value: 1000.0,
                extra: Map::new(),
            }],
            categories: vec!["Programming Languages".to_owned()],
            tags: vec!["python".to_owned()],
            flags: "validated, public".to_owned(),
            last_updated: String::new(),
            published_date: String::new(),
            recommended: false,
            extra: Map::new(),
        }
    }

    #[test]
    fn identity_joins_publisher_and_name() {
        let ext = extension(vec![]);
        assert_eq!(ext.identity().as_str(), "ms-python.python");
    }

    #[test]
    fn sort_versions_is_newest_first() {
        let mut ext = extension(vec![
            version("2024.1.0", "2024-01-01T00:00:00Z", false),
            version("2024.10.0", "2024-10-01T00:00:00Z", false),
            version("2024.2.0", "2024-02-01T00:00:00Z", false),
        ]);
        ext.sort_versions();
        let order: Vec<&str> = ext.versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, ["2024.10.0", "2024.2.0", "2024.1.0"]);
    }

    #[test]
    fn latest_version_skips_prerelease_by_default() {
        let mut ext = extension(vec![
            version("2024.9.0", "2024-09-01T00:00:00Z", true),
            version("2024.8.0", "2024-08-01T00:00:00Z", false),
        ]);
        ext.sort_versions();
        assert_eq!(ext.latest_version(false).unwrap().version, "2024.8.0");
        assert_eq!(ext.latest_version(true).unwrap().version, "2024.9.0");
    }

    #[test]
    fn latest_release_versions_keeps_all_target_platforms() {
        let mut win = version("1.5.0", "2024-05-01T00:00:00Z", false);
        win.target_platform = Some("win32-x64".to_owned());
        let mut linux = version("1.5.0", "2024-05-01T00:00:00Z", false);
        linux.target_platform = Some("linux-x64".to_owned());
        let ext = extension(vec![
            version("1.6.0", "2024-06-01T00:00:00Z", true),
            win,
            linux,
            version("1.4.0", "2024-04-01T00:00:00Z", false),
        ]);
        let latest = ext.latest_release_versions();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|v| v.version == "1.5.0"));
    }

    #[test]
    fn prerelease_only_detection() {
        let ext = extension(vec![version("0.1.0", "t", true), version("0.2.0", "t", true)]);
        assert!(ext.is_prerelease_only());
        assert!(ext.latest_release_versions().is_empty());
    }

    #[test]
    fn statistics_lookup_defaults_to_zero() {
        let ext = extension(vec![]);
        assert_eq!(ext.install_count(), 1000.0);
        assert_eq!(ext.average_rating(), 0.0);
    }

    #[test]
    fn unknown_fields_roundtrip() {
        let raw = serde_json::json!({
            "extensionName": "thing",
            "publisher": {"publisherName": "pub", "newPublisherField": 7},
            "versions": [{"version": "1.0.0", "newVersionField": "kept"}],
            "deploymentType": 0
        });
        let ext: GalleryExtension = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&ext).unwrap();
        assert_eq!(back["deploymentType"], 0);
        assert_eq!(back["publisher"]["newPublisherField"], 7);
        assert_eq!(back["versions"][0]["newVersionField"], "kept");
    }
}
