pub mod binaries;
pub mod extensions;
pub mod search;
pub mod sync;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vscmirror_sync::{PassSummary, Progress, SyncError};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_UPSTREAM_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Run a pass while a spinner line tracks the pool's live counters.
pub fn with_progress<R>(progress: Arc<Progress>, quiet: bool, f: impl FnOnce() -> R) -> R {
    if quiet {
        return f();
    }
    let pb = spinner("resolving…");
    let done = Arc::new(AtomicBool::new(false));
    let ticker = {
        let done = Arc::clone(&done);
        let pb = pb.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let s = progress.snapshot();
                if s.total > 0 {
                    pb.set_message(format!(
                        "{}/{} items, {} failed, {:.1} MiB",
                        s.done + s.skipped,
                        s.total,
                        s.failed,
                        s.bytes as f64 / (1024.0 * 1024.0)
                    ));
                }
                std::thread::sleep(Duration::from_millis(120));
            }
        })
    };
    let result = f();
    done.store(true, Ordering::Relaxed);
    let _ = ticker.join();
    pb.finish_and_clear();
    result
}

/// Render a pass summary, either as JSON or a short human line plus any
/// per-item errors.
pub fn print_summary(summary: &PassSummary, json: bool) -> Result<(), String> {
    if json {
        let payload = serde_json::json!({
            "downloaded": summary.downloaded,
            "skipped": summary.skipped,
            "failed": summary.failed,
            "bytes": summary.bytes,
            "binaries_published": summary.binaries_published,
            "extensions_published": summary.extensions_published,
            "extensions_removed": summary.extensions_removed,
            "versions_trimmed": summary.versions_trimmed,
            "builds_trimmed": summary.builds_trimmed,
            "purged": summary.purged,
            "cancelled": summary.cancelled,
            "item_errors": summary.item_errors,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }

    println!(
        "pass: {} downloaded, {} skipped, {} failed ({:.1} MiB)",
        summary.downloaded,
        summary.skipped,
        summary.failed,
        summary.bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "published {} binaries, {} extensions; trimmed {} versions, {} builds; purged {}",
        summary.binaries_published,
        summary.extensions_published,
        summary.versions_trimmed,
        summary.builds_trimmed,
        summary.purged
    );
    if summary.cancelled {
        println!("{}", console::style("pass was cancelled").yellow());
    }
    for error in &summary.item_errors {
        println!("  {} {error}", console::style("!").red());
    }
    Ok(())
}

/// Map engine failures onto the message prefixes `main` turns into exit
/// codes.
pub fn describe_error(err: &SyncError) -> String {
    match err {
        SyncError::Store(e) => format!("store error: {e}"),
        SyncError::LockHeld(path) => format!("store lock held ({path})"),
        SyncError::UpstreamUnreachable => "upstream unreachable on every endpoint".to_owned(),
        SyncError::Upstream(e) => format!("upstream: {e}"),
        SyncError::Cancelled => "cancelled".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes() {
        let out = json_pretty(&serde_json::json!({"k": 1})).unwrap();
        assert!(out.contains("\"k\""));
    }

    #[test]
    fn summary_rendering_does_not_fail() {
        let mut summary = PassSummary::default();
        summary.downloaded = 3;
        summary.item_errors.push("pub.ext: boom".to_owned());
        print_summary(&summary, true).unwrap();
        print_summary(&summary, false).unwrap();
    }

    #[test]
    fn error_prefixes_match_exit_mapping() {
        assert!(describe_error(&SyncError::UpstreamUnreachable).starts_with("upstream"));
        assert!(describe_error(&SyncError::LockHeld("x".to_owned())).contains("store lock"));
    }
}
