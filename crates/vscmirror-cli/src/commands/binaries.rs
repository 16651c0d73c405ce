use super::{describe_error, print_summary, with_progress, EXIT_SUCCESS};
use vscmirror_sync::{SyncConfig, SyncOps, Synchronizer};
use vscmirror_upstream::UpstreamSource;

pub fn run(
    config: &SyncConfig,
    upstream: &dyn UpstreamSource,
    json: bool,
) -> Result<u8, String> {
    let sync = Synchronizer::new(config, upstream);
    let progress = sync.progress();
    let summary = with_progress(progress, json, || sync.run_pass(SyncOps::binaries_only()))
        .map_err(|e| describe_error(&e))?;
    print_summary(&summary, json)?;
    Ok(EXIT_SUCCESS)
}
