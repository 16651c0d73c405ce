//! The marketplace query protocol: filter types, query flags, sort orders,
//! and the request/response envelope shapes.
//!
//! The upstream protocol codes filter types as integers and flags as a
//! bitset; both are modeled here with named constants so handlers never
//! compare raw numbers. Unknown filter codes and flag bits pass through
//! without effect.

use crate::gallery::GalleryExtension;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tagged filter-clause type with the upstream integer coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Tag,
    ExtensionId,
    Category,
    ExtensionName,
    Target,
    Featured,
    SearchText,
    ExcludeWithFlags,
    Unknown(i64),
}

impl FilterType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => FilterType::Tag,
            4 => FilterType::ExtensionId,
            5 => FilterType::Category,
            7 => FilterType::ExtensionName,
            8 => FilterType::Target,
            9 => FilterType::Featured,
            10 => FilterType::SearchText,
            12 => FilterType::ExcludeWithFlags,
            other => FilterType::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            FilterType::Tag => 1,
            FilterType::ExtensionId => 4,
            FilterType::Category => 5,
            FilterType::ExtensionName => 7,
            FilterType::Target => 8,
            FilterType::Featured => 9,
            FilterType::SearchText => 10,
            FilterType::ExcludeWithFlags => 12,
            FilterType::Unknown(code) => code,
        }
    }
}

/// Named bitset gating which sub-objects a query response populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(pub u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    pub const INCLUDE_VERSIONS: QueryFlags = QueryFlags(0x1);
    pub const INCLUDE_FILES: QueryFlags = QueryFlags(0x2);
    pub const INCLUDE_CATEGORY_AND_TAGS: QueryFlags = QueryFlags(0x4);
    pub const INCLUDE_SHARED_ACCOUNTS: QueryFlags = QueryFlags(0x8);
    pub const INCLUDE_VERSION_PROPERTIES: QueryFlags = QueryFlags(0x10);
    pub const EXCLUDE_NON_VALIDATED: QueryFlags = QueryFlags(0x20);
    pub const INCLUDE_INSTALLATION_TARGETS: QueryFlags = QueryFlags(0x40);
    pub const INCLUDE_ASSET_URI: QueryFlags = QueryFlags(0x80);
    pub const INCLUDE_STATISTICS: QueryFlags = QueryFlags(0x100);
    pub const INCLUDE_LATEST_VERSION_ONLY: QueryFlags = QueryFlags(0x200);
    pub const UNPUBLISHED: QueryFlags = QueryFlags(0x1000);

    /// Flag set the sync client sends when asking for the latest version only.
    pub const DEFAULT_QUERY: QueryFlags = QueryFlags(
        Self::INCLUDE_FILES.0
            | Self::INCLUDE_VERSION_PROPERTIES.0
            | Self::INCLUDE_ASSET_URI.0
            | Self::INCLUDE_STATISTICS.0
            | Self::INCLUDE_LATEST_VERSION_ONLY.0,
    );

    /// Flag set used when the full version history is needed to pick a
    /// non-prerelease candidate.
    pub const RELEASE_QUERY: QueryFlags = QueryFlags(
        Self::INCLUDE_FILES.0
            | Self::INCLUDE_VERSION_PROPERTIES.0
            | Self::INCLUDE_ASSET_URI.0
            | Self::INCLUDE_STATISTICS.0
            | Self::INCLUDE_VERSIONS.0,
    );

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Decode the request's `flags` field, which clients send either as a
    /// number or a numeric string. Anything unparseable is treated as zero;
    /// bits with no assigned meaning are simply never tested.
    pub fn from_json(value: &Value) -> QueryFlags {
        let bits = match value {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
            _ => 0,
        };
        QueryFlags(bits as u32)
    }
}

impl std::ops::BitOr for QueryFlags {
    type Output = QueryFlags;
    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

/// Gallery-side extension flags, carried on the wire as a comma-separated
/// name string (`"validated, public"`). The bit values match the upstream
/// gallery's coding, which is what ExcludeWithFlags criteria count in.
pub fn extension_flag_bits(flags_csv: &str) -> u64 {
    flags_csv
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| match name.to_ascii_lowercase().as_str() {
            "disabled" => 0x1,
            "builtin" => 0x2,
            "validated" => 0x4,
            "trusted" => 0x8,
            "paid" => 0x10,
            "public" => 0x100,
            "preview" => 0x200,
            "unpublished" => 0x1000,
            _ => 0,
        })
        .fold(0, |acc, bit| acc | bit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    NoneOrRelevance,
    LastUpdatedDate,
    Title,
    PublisherName,
    InstallCount,
    PublishedDate,
    AverageRating,
    WeightedRating,
}

impl SortBy {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => SortBy::LastUpdatedDate,
            2 => SortBy::Title,
            3 => SortBy::PublisherName,
            4 => SortBy::InstallCount,
            5 => SortBy::PublishedDate,
            6 => SortBy::AverageRating,
            12 => SortBy::WeightedRating,
            _ => SortBy::NoneOrRelevance,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            SortBy::NoneOrRelevance => 0,
            SortBy::LastUpdatedDate => 1,
            SortBy::Title => 2,
            SortBy::PublisherName => 3,
            SortBy::InstallCount => 4,
            SortBy::PublishedDate => 5,
            SortBy::AverageRating => 6,
            SortBy::WeightedRating => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Default,
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => SortOrder::Ascending,
            2 => SortOrder::Descending,
            _ => SortOrder::Default,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            SortOrder::Default => 0,
            SortOrder::Ascending => 1,
            SortOrder::Descending => 2,
        }
    }
}

/// One `{filterType, value}` clause of a query filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    #[serde(rename = "filterType")]
    pub filter_type: i64,
    #[serde(default)]
    pub value: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Criterion {
    pub fn new(filter_type: FilterType, value: impl Into<String>) -> Self {
        Self {
            filter_type: filter_type.code(),
            value: value.into(),
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> FilterType {
        FilterType::from_code(self.filter_type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(rename = "pageNumber", default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    #[serde(rename = "pageSize", default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i64>,
    #[serde(rename = "sortBy", default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<i64>,
    #[serde(rename = "sortOrder", default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `/extensionquery` request envelope. Unknown request fields are
/// accepted and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionQuery {
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub flags: Value,
    #[serde(rename = "assetTypes", default)]
    pub asset_types: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExtensionQuery {
    pub fn flags(&self) -> QueryFlags {
        QueryFlags::from_json(&self.flags)
    }

    /// The first filter block, which is the one the editor populates.
    pub fn primary_filter(&self) -> Option<&QueryFilter> {
        self.filters.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(rename = "metadataType")]
    pub metadata_type: String,
    #[serde(rename = "metadataItems")]
    pub metadata_items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultSet {
    pub extensions: Vec<GalleryExtension>,
    #[serde(rename = "pagingToken")]
    pub paging_token: Option<String>,
    #[serde(rename = "resultMetadata")]
    pub result_metadata: Vec<ResultMetadata>,
}

/// The `/extensionquery` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResultSet>,
}

impl QueryResponse {
    /// Wrap one page of records with the ResultCount metadata the editor
    /// reads to drive pagination.
    pub fn page(extensions: Vec<GalleryExtension>, total: u64) -> Self {
        QueryResponse {
            results: vec![QueryResultSet {
                extensions,
                paging_token: None,
                result_metadata: vec![ResultMetadata {
                    metadata_type: "ResultCount".to_owned(),
                    metadata_items: vec![MetadataItem {
                        name: "TotalCount".to_owned(),
                        count: total,
                    }],
                }],
            }],
        }
    }

    /// Extract the TotalCount a server reported, if any.
    pub fn total_count(&self) -> Option<u64> {
        self.results.iter().find_map(|set| {
            set.result_metadata
                .iter()
                .filter(|md| md.metadata_type.contains("ResultCount"))
                .flat_map(|md| md.metadata_items.iter())
                .find(|item| item.name == "TotalCount")
                .map(|item| item.count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_type_codes_roundtrip() {
        for code in [1, 4, 5, 7, 8, 9, 10, 12] {
            assert_eq!(FilterType::from_code(code).code(), code);
        }
        assert_eq!(FilterType::from_code(14), FilterType::Unknown(14));
        assert_eq!(FilterType::Unknown(14).code(), 14);
    }

    #[test]
    fn query_flags_contains() {
        let flags = QueryFlags::INCLUDE_FILES | QueryFlags::INCLUDE_STATISTICS;
        assert!(flags.contains(QueryFlags::INCLUDE_FILES));
        assert!(!flags.contains(QueryFlags::INCLUDE_VERSIONS));
    }

    #[test]
    fn query_flags_from_number_or_string() {
        assert_eq!(QueryFlags::from_json(&serde_json::json!(0x183)).bits(), 0x183);
        assert_eq!(QueryFlags::from_json(&serde_json::json!("914")).bits(), 914);
        assert_eq!(QueryFlags::from_json(&serde_json::json!(null)).bits(), 0);
        assert_eq!(QueryFlags::from_json(&serde_json::json!("junk")).bits(), 0);
    }

    #[test]
    fn unknown_flag_bits_are_preserved_but_inert() {
        let flags = QueryFlags::from_json(&serde_json::json!(0x8000_0000u32));
        assert!(!flags.contains(QueryFlags::INCLUDE_VERSIONS));
    }

    #[test]
    fn extension_flag_bits_parses_csv() {
        assert_eq!(extension_flag_bits("validated, public"), 0x104);
        assert_eq!(extension_flag_bits("unpublished"), 0x1000);
        assert_eq!(extension_flag_bits(""), 0);
        assert_eq!(extension_flag_bits("somethingNew"), 0);
    }

    #[test]
    fn sort_codes_have_install_count() {
        assert_eq!(SortBy::from_code(4), SortBy::InstallCount);
        assert_eq!(SortOrder::from_code(2), SortOrder::Descending);
        assert_eq!(SortBy::from_code(99), SortBy::NoneOrRelevance);
    }

    #[test]
    fn request_envelope_tolerates_unknowns() {
        let raw = serde_json::json!({
            "filters": [{
                "criteria": [
                    {"filterType": 8, "value": "Microsoft.VisualStudio.Code"},
                    {"filterType": 10, "value": "python"}
                ],
                "pageNumber": 1, "pageSize": 50, "sortBy": 0, "sortOrder": 0,
                "pagingToken": null
            }],
            "assetTypes": [],
            "flags": 914,
            "futureTopLevel": true
        });
        let q: ExtensionQuery = serde_json::from_value(raw).unwrap();
        assert_eq!(q.flags().bits(), 914);
        let filter = q.primary_filter().unwrap();
        assert_eq!(filter.criteria.len(), 2);
        assert_eq!(filter.criteria[1].kind(), FilterType::SearchText);
    }

    #[test]
    fn response_page_shape_matches_client_expectation() {
        let resp = QueryResponse::page(Vec::new(), 0);
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v["results"][0]["extensions"].as_array().unwrap().is_empty());
        assert!(v["results"][0]["pagingToken"].is_null());
        assert_eq!(
            v["results"][0]["resultMetadata"][0]["metadataType"],
            "ResultCount"
        );
        assert_eq!(
            v["results"][0]["resultMetadata"][0]["metadataItems"][0]["name"],
            "TotalCount"
        );
    }

    #[test]
    fn total_count_extraction() {
        let resp = QueryResponse::page(Vec::new(), 1234);
        assert_eq!(resp.total_count(), Some(1234));
    }
}
