use super::{json_pretty, spinner, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use vscmirror_store::{verify_store, StoreLayout};

pub fn run(artifact_root: &Path, json: bool) -> Result<u8, String> {
    let layout = StoreLayout::new(artifact_root);
    layout
        .verify_version()
        .map_err(|e| format!("store error: {e}"))?;

    let pb = if json { None } else { Some(spinner("verifying store…")) };
    let report = verify_store(&layout).map_err(|e| format!("store error: {e}"))?;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    if json {
        let payload = serde_json::json!({
            "extensions_checked": report.extensions_checked,
            "binaries_checked": report.binaries_checked,
            "failures": report
                .failures
                .iter()
                .map(|f| serde_json::json!({"identity": f.identity, "detail": f.detail}))
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "verified {} extensions, {} binaries",
            report.extensions_checked, report.binaries_checked
        );
        for failure in &report.failures {
            println!(
                "  {} {}: {}",
                console::style("✗").red(),
                failure.identity,
                failure.detail
            );
        }
        if report.is_clean() {
            println!("{}", console::style("store is consistent").green());
        }
    }

    Ok(if report.is_clean() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
