use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vscmirror_gallery::{Gallery, StoreIndex};
use vscmirror_store::StoreLayout;

#[derive(Parser)]
#[command(
    name = "vscmirror-gallery",
    version,
    about = "Marketplace-compatible gallery API over a vscmirror artifact store"
)]
struct Cli {
    /// Artifact root directory (env: VSCMIRROR_ARTIFACTS).
    #[arg(long, env = "VSCMIRROR_ARTIFACTS", default_value = "./artifacts")]
    artifacts: PathBuf,

    /// Bind address.
    #[arg(long, default_value = "0.0.0.0:9000")]
    bind: String,

    /// External base URL clients reach this gallery under (e.g.
    /// http://mirror.internal:9000). Empty yields relative URLs.
    #[arg(long, default_value = "")]
    url: String,

    /// Seconds between index rebuilds; a finished sync pass also triggers
    /// one immediately.
    #[arg(long, default_value_t = 300)]
    refresh_interval: u64,

    /// Request worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("VSCMIRROR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let layout = StoreLayout::new(&cli.artifacts);
    if let Err(e) = layout.initialize() {
        eprintln!("error: cannot open artifact root {}: {e}", cli.artifacts.display());
        std::process::exit(1);
    }

    let index = Arc::new(StoreIndex::new(layout.clone(), cli.url.clone()));
    if let Err(e) = index.rebuild() {
        eprintln!("error: initial index build failed: {e}");
        std::process::exit(1);
    }
    index.spawn_refresher(Duration::from_secs(cli.refresh_interval.max(1)));

    info!("serving {} on {}", cli.artifacts.display(), cli.bind);
    let gallery = Arc::new(Gallery::new(layout, index, cli.url));
    vscmirror_gallery::run_server(&gallery, &cli.bind, cli.workers);
}
