use crate::layout::StoreLayout;
use crate::records::{BinaryStore, ExtensionStore};
use crate::StoreError;
use std::collections::HashSet;

/// One broken promise found by [`verify_store`].
#[derive(Debug)]
pub struct IntegrityFailure {
    pub identity: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub extensions_checked: usize,
    pub binaries_checked: usize,
    pub failures: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, identity: impl Into<String>, detail: impl Into<String>) {
        self.failures.push(IntegrityFailure {
            identity: identity.into(),
            detail: detail.into(),
        });
    }
}

/// Full integrity scan of the artifact root.
///
/// Verifies that every visible extension record references only fully
/// materialized version directories (each listed asset present, with its
/// recorded size), that the `extensions.json` aggregate agrees with the set
/// of on-disk records, and that every binary `latest.json` points at an
/// existing payload.
pub fn verify_store(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();
    let ext_store = ExtensionStore::new(layout.clone());
    let bin_store = BinaryStore::new(layout.clone());

    let records = ext_store.list()?;
    for record in &records {
        report.extensions_checked += 1;
        let id = record.identity();
        for version in &record.versions {
            let dir = layout.version_dir(&id, &version.version, version.target_platform.as_deref());
            if !dir.is_dir() {
                report.fail(
                    id.as_str(),
                    format!("version {} has no directory", version.version),
                );
                continue;
            }
            for asset in &version.files {
                if asset.asset_type.contains('/') || asset.asset_type.contains('\\') {
                    report.fail(
                        id.as_str(),
                        format!("asset type '{}' is not a safe file name", asset.asset_type),
                    );
                    continue;
                }
                let path = dir.join(&asset.asset_type);
                match path.metadata() {
                    Ok(meta) if meta.is_file() => {
                        if let Some(expected) = asset.size {
                            if meta.len() != expected {
                                report.fail(
                                    id.as_str(),
                                    format!(
                                        "asset {}/{} is {} bytes, recorded {expected}",
                                        version.version,
                                        asset.asset_type,
                                        meta.len()
                                    ),
                                );
                            }
                        }
                    }
                    _ => {
                        report.fail(
                            id.as_str(),
                            format!("asset {}/{} missing", version.version, asset.asset_type),
                        );
                    }
                }
            }
        }
    }

    // The aggregate must be exactly the set of on-disk records.
    let on_disk: HashSet<String> = records.iter().map(|r| r.identity().normalized()).collect();
    let indexed: HashSet<String> = ext_store
        .read_index()?
        .iter()
        .map(|r| r.identity().normalized())
        .collect();
    for missing in indexed.difference(&on_disk) {
        report.fail(missing.clone(), "listed in extensions.json but not on disk");
    }
    for unlisted in on_disk.difference(&indexed) {
        report.fail(unlisted.clone(), "on disk but absent from extensions.json");
    }

    for release in bin_store.list()? {
        report.binaries_checked += 1;
        let (Some(platform), Some(quality)) = (release.platform.as_deref(), release.quality) else {
            report.fail(
                release.version.as_str(),
                "release manifest lacks platform/quality bookkeeping",
            );
            continue;
        };
        let payload = layout
            .binary_commit_dir(quality, platform, release.version.as_str())
            .join(release.payload_filename());
        if !payload.is_file() {
            report.fail(
                release.version.as_str(),
                format!("payload {} missing", payload.display()),
            );
        }
    }

    Ok(report)
}
