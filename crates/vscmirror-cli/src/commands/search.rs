use super::{json_pretty, EXIT_SUCCESS};
use vscmirror_upstream::UpstreamSource;

pub fn run(
    upstream: &dyn UpstreamSource,
    text: &str,
    limit: usize,
    json: bool,
) -> Result<u8, String> {
    let results = upstream
        .search(text, limit)
        .map_err(|e| format!("upstream: {e}"))?;

    if json {
        let payload: Vec<_> = results
            .iter()
            .map(|ext| {
                serde_json::json!({
                    "identity": ext.identity().as_str(),
                    "displayName": ext.display_name,
                    "installs": ext.install_count(),
                    "latest": ext.versions.first().map(|v| v.version.as_str()),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{} extensions match '{text}'", results.len());
    for ext in &results {
        let latest = ext
            .versions
            .first()
            .map(|v| v.version.as_str())
            .unwrap_or("-");
        println!(
            "  {:<50} {:>12} installs  latest {}",
            ext.identity().as_str(),
            ext.install_count() as u64,
            latest
        );
    }
    Ok(EXIT_SUCCESS)
}
