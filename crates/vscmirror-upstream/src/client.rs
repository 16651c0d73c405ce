use crate::config::UpstreamConfig;
use crate::{AssetBody, UpstreamError, UpstreamSource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::io::Read;
use vscmirror_schema::{
    asset, Criterion, ExtensionQuery, FilterType, GalleryExtension, Quality, QueryFilter,
    QueryFlags, QueryResponse, ReleaseManifest, SortBy, SortOrder,
};

/// Ancient commit used to probe the update API; upstream answers with its
/// current latest release, or 204 if this somehow ever becomes current.
const PROBE_COMMIT: &str = "7c4205b5c6e52a53b81c69d2b2dc8a627abaa0ba";

const PAGE_SIZE: usize = 500;

/// Blocking HTTP client over a shared `ureq` agent.
pub struct UpstreamClient {
    config: UpstreamConfig,
    agent: ureq::Agent,
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    Get,
    PostJson(&'a [u8]),
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .max_redirects(5)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            config,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Issue one request with the configured retry budget. Connection errors
    /// and 5xx retry with exponential backoff; 4xx returns immediately as a
    /// typed failure.
    fn request(&self, url: &str, payload: Payload<'_>) -> Result<(u16, Vec<u8>), UpstreamError> {
        let mut last_err = String::new();
        for attempt in 0..self.config.retry.max_attempts {
            if attempt > 0 {
                let delay = self.config.retry.backoff(attempt - 1);
                tracing::debug!("retrying {url} in {delay:?} (attempt {})", attempt + 1);
                std::thread::sleep(delay);
            }

            let result = match payload {
                Payload::Get => self.agent.get(url).call(),
                Payload::PostJson(body) => self
                    .agent
                    .post(url)
                    .header("Content-Type", "application/json")
                    .header("Accept", "application/json;api-version=3.0-preview.1")
                    .header("User-Agent", &self.config.user_agent())
                    .header("X-Market-Client-Id", &self.config.user_agent())
                    .send(body),
            };

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let mut reader = resp.into_body().into_reader();
                    let mut buf = Vec::new();
                    reader
                        .read_to_end(&mut buf)
                        .map_err(|e| UpstreamError::Unavailable(format!("{url}: {e}")))?;
                    return Ok((status, buf));
                }
                Err(ureq::Error::StatusCode(code)) if code >= 500 => {
                    last_err = format!("HTTP {code} for {url}");
                    tracing::warn!("{last_err}");
                }
                Err(ureq::Error::StatusCode(code)) => {
                    return Err(UpstreamError::Status {
                        status: code,
                        url: url.to_owned(),
                    });
                }
                Err(e) => {
                    last_err = format!("{url}: {e}");
                    tracing::warn!("request failed: {last_err}");
                }
            }
        }
        Err(UpstreamError::Unavailable(last_err))
    }

    fn decode<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, UpstreamError> {
        serde_json::from_slice(bytes).map_err(|e| UpstreamError::Malformed(format!("{url}: {e}")))
    }

    /// Build the query envelope the editor itself sends: the caller's clause
    /// plus the standing Target and exclude-unpublished criteria.
    fn build_query(
        filter_type: FilterType,
        value: &str,
        page_number: usize,
        page_size: usize,
        flags: QueryFlags,
        sort_by: SortBy,
        sort_order: SortOrder,
    ) -> ExtensionQuery {
        let mut criteria = vec![
            Criterion::new(FilterType::Target, asset::TARGET_PRODUCT),
            Criterion::new(
                FilterType::ExcludeWithFlags,
                QueryFlags::UNPUBLISHED.bits().to_string(),
            ),
        ];
        if !value.is_empty() {
            criteria.push(Criterion::new(filter_type, value));
        }
        ExtensionQuery {
            filters: vec![QueryFilter {
                criteria,
                page_number: Some(page_number as i64),
                page_size: Some(page_size as i64),
                sort_by: Some(sort_by.code()),
                sort_order: Some(sort_order.code()),
                extra: serde_json::Map::new(),
            }],
            flags: Value::from(flags.bits()),
            asset_types: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// POST one query page.
    pub fn query_page(&self, query: &ExtensionQuery) -> Result<QueryResponse, UpstreamError> {
        let body = serde_json::to_vec(query)
            .map_err(|e| UpstreamError::Malformed(format!("query encode: {e}")))?;
        let (status, bytes) = self.request(&self.config.marketplace_url, Payload::PostJson(&body))?;
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                url: self.config.marketplace_url.clone(),
            });
        }
        Self::decode(&self.config.marketplace_url, &bytes)
    }

    /// Walk the marketplace pagination until the reported total, the caller's
    /// limit, or the first page that adds nothing new. Records are
    /// deduplicated by identity across pages.
    fn query_paged(
        &self,
        filter_type: FilterType,
        value: &str,
        flags: QueryFlags,
        sort_by: SortBy,
        sort_order: SortOrder,
        limit: usize,
        page_size: usize,
    ) -> Result<Vec<GalleryExtension>, UpstreamError> {
        let mut results: Vec<GalleryExtension> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_number = 1usize;

        loop {
            let query = Self::build_query(
                filter_type,
                value,
                page_number,
                page_size,
                flags,
                sort_by,
                sort_order,
            );
            let response = self.query_page(&query)?;
            let total = response.total_count();

            let mut grew = false;
            for ext in response.results.into_iter().flat_map(|set| set.extensions) {
                if seen.insert(ext.identity().normalized()) {
                    results.push(ext);
                    grew = true;
                }
            }
            tracing::debug!(
                "marketplace page {page_number}: {} unique so far (total reported: {total:?})",
                results.len()
            );

            if limit > 0 && results.len() >= limit {
                results.truncate(limit);
                break;
            }
            if let Some(total) = total {
                if (page_number * page_size) as u64 >= total {
                    break;
                }
            }
            if !grew {
                break;
            }
            page_number += 1;
        }
        Ok(results)
    }
}

impl UpstreamSource for UpstreamClient {
    fn release_manifest(
        &self,
        platform: &str,
        quality: Quality,
    ) -> Result<Option<ReleaseManifest>, UpstreamError> {
        let url = format!("{}/{platform}/{quality}/{PROBE_COMMIT}", self.config.update_url);
        let (status, bytes) = self.request(&url, Payload::Get)?;
        match status {
            204 => Ok(None),
            200 => {
                let mut manifest: ReleaseManifest = Self::decode(&url, &bytes)?;
                manifest.platform = Some(platform.to_owned());
                manifest.quality = Some(quality);
                Ok(Some(manifest))
            }
            other => Err(UpstreamError::Status {
                status: other,
                url,
            }),
        }
    }

    fn extension_by_name(
        &self,
        name: &str,
        include_prerelease: bool,
    ) -> Result<Option<GalleryExtension>, UpstreamError> {
        let flags = if include_prerelease {
            QueryFlags::DEFAULT_QUERY
        } else {
            QueryFlags::RELEASE_QUERY
        };
        let mut found = self.query_paged(
            FilterType::ExtensionName,
            name,
            flags,
            SortBy::NoneOrRelevance,
            SortOrder::Default,
            2,
            PAGE_SIZE,
        )?;
        // More than one hit means the name was not exact; treat as absent.
        if found.len() != 1 {
            return Ok(None);
        }
        let mut ext = found.remove(0);
        if !include_prerelease {
            let releases: Vec<_> = ext
                .latest_release_versions()
                .into_iter()
                .cloned()
                .collect();
            ext.versions = releases;
        }
        Ok(Some(ext))
    }

    fn extension_by_id(
        &self,
        extension_id: &str,
    ) -> Result<Option<GalleryExtension>, UpstreamError> {
        let mut found = self.query_paged(
            FilterType::ExtensionId,
            extension_id,
            QueryFlags::RELEASE_QUERY,
            SortBy::NoneOrRelevance,
            SortOrder::Default,
            2,
            PAGE_SIZE,
        )?;
        if found.len() == 1 {
            Ok(Some(found.remove(0)))
        } else {
            Ok(None)
        }
    }

    fn search(&self, text: &str, limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError> {
        let text = if text == "*" { "" } else { text };
        self.query_paged(
            FilterType::SearchText,
            text,
            QueryFlags::DEFAULT_QUERY,
            SortBy::NoneOrRelevance,
            SortOrder::Default,
            limit,
            PAGE_SIZE,
        )
    }

    fn top_by_installs(&self, limit: usize) -> Result<Vec<GalleryExtension>, UpstreamError> {
        let page_size = if limit > 0 { limit.min(PAGE_SIZE) } else { PAGE_SIZE };
        self.query_paged(
            FilterType::SearchText,
            "",
            QueryFlags::DEFAULT_QUERY,
            SortBy::InstallCount,
            SortOrder::Descending,
            limit,
            page_size,
        )
    }

    fn recommendation_groups(&self) -> Result<Vec<Vec<String>>, UpstreamError> {
        let url = &self.config.recommendations_url;
        let (status, bytes) = self.request(url, Payload::Get)?;
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                url: url.clone(),
            });
        }
        let value: Value = Self::decode(url, &bytes)?;
        Ok(extract_recommendation_groups(&value))
    }

    fn malicious_identifiers(&self) -> Result<Vec<String>, UpstreamError> {
        let url = &self.config.malicious_url;
        let (status, bytes) = self.request(url, Payload::Get)?;
        if status != 200 {
            return Err(UpstreamError::Status {
                status,
                url: url.clone(),
            });
        }
        let value: Value = Self::decode(url, &bytes)?;
        let list = value
            .get("malicious")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(list)
    }

    fn fetch_asset(&self, url: &str) -> Result<AssetBody, UpstreamError> {
        let mut last_err = String::new();
        for attempt in 0..self.config.retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(self.config.retry.backoff(attempt - 1));
            }
            match self.agent.get(url).call() {
                Ok(resp) => {
                    let headers = resp.headers();
                    let declared_len = headers
                        .get("Content-Length")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse().ok());
                    let content_type = headers
                        .get("Content-Type")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    return Ok(AssetBody {
                        reader: Box::new(resp.into_body().into_reader()),
                        declared_len,
                        content_type,
                    });
                }
                Err(ureq::Error::StatusCode(code)) if code >= 500 => {
                    last_err = format!("HTTP {code} for {url}");
                }
                Err(ureq::Error::StatusCode(code)) => {
                    return Err(UpstreamError::Status {
                        status: code,
                        url: url.to_owned(),
                    });
                }
                Err(e) => last_err = format!("{url}: {e}"),
            }
        }
        Err(UpstreamError::Unavailable(last_err))
    }
}

/// Pull identifier groups out of whatever shape the recommendations artifact
/// takes: any nested array of strings counts as one group. The artifact's
/// schema has drifted before; this keeps the mirror indifferent to it.
fn extract_recommendation_groups(value: &Value) -> Vec<Vec<String>> {
    fn string_list(v: &Value) -> Option<Vec<String>> {
        let items = v.as_array()?;
        if items.is_empty() {
            return None;
        }
        items
            .iter()
            .map(|s| s.as_str().map(str::to_owned))
            .collect()
    }

    let mut groups = Vec::new();
    match value {
        Value::Array(items) => {
            if let Some(list) = string_list(value) {
                groups.push(list);
            } else {
                for item in items {
                    groups.extend(extract_recommendation_groups(item));
                }
            }
        }
        Value::Object(map) => {
            for nested in map.values() {
                groups.extend(extract_recommendation_groups(nested));
            }
        }
        _ => {}
    }
    groups
}
