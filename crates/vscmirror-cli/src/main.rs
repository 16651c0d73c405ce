mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use commands::{EXIT_FAILURE, EXIT_STORE_ERROR, EXIT_UPSTREAM_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vscmirror_schema::Quality;
use vscmirror_sync::{install_signal_handler, SyncConfig, SyncMode};
use vscmirror_upstream::{UpstreamClient, UpstreamConfig};

#[derive(Debug, Parser)]
#[command(
    name = "vscmirror",
    version,
    about = "Mirrors a code editor's binary releases and extension marketplace for offline use"
)]
struct Cli {
    /// Artifact root directory.
    #[arg(long, env = "VSCMIRROR_ARTIFACTS", default_value = "./artifacts", global = true)]
    artifacts: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Release channel to mirror (repeatable).
    #[arg(long = "quality", value_name = "CHANNEL", global = true)]
    qualities: Vec<Quality>,

    /// Platform tag to mirror (repeatable), e.g. linux-x64, win32-x64-archive.
    #[arg(long = "platform", value_name = "TAG", global = true)]
    platforms: Vec<String>,

    /// Download pool width.
    #[arg(long, default_value_t = 8, global = true)]
    pool_width: usize,

    /// Newest versions kept per extension by retention.
    #[arg(long, default_value_t = 2, global = true)]
    keep_versions: usize,

    /// Newest builds kept per (quality, platform) by retention.
    #[arg(long, default_value_t = 2, global = true)]
    keep_builds: usize,

    /// Size of the top-installed slice folded into the recommended set
    /// (0 disables it).
    #[arg(long, default_value_t = 500, global = true)]
    total_recommended: usize,

    /// Mirror publisher-flagged pre-release versions too.
    #[arg(long, default_value_t = false, global = true)]
    prerelease: bool,

    /// Per-request upstream timeout in seconds.
    #[arg(long, default_value_t = 12, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExtensionsMode {
    /// Enumerate the full marketplace.
    All,
    /// Recommendation groups plus the allow list plus the top-installed slice.
    Recommended,
    /// Strictly the operator allow list in specified.json.
    Specified,
}

impl From<ExtensionsMode> for SyncMode {
    fn from(mode: ExtensionsMode) -> Self {
        match mode {
            ExtensionsMode::All => SyncMode::All,
            ExtensionsMode::Recommended => SyncMode::Recommended,
            ExtensionsMode::Specified => SyncMode::Specified,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full pass: binaries, recommended and specified extensions, malicious
    /// list refresh.
    Sync {
        /// Repeat every N seconds instead of exiting after one pass.
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Mirror binary releases only.
    Binaries,
    /// Mirror extensions only.
    Extensions {
        #[arg(long, value_enum, default_value_t = ExtensionsMode::Recommended)]
        mode: ExtensionsMode,
    },
    /// Diagnostic marketplace search; prints matches without downloading.
    Search {
        text: String,
        /// Maximum results to print.
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Verify that every published record matches the bytes on disk.
    Verify,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("VSCMIRROR_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let mut config = SyncConfig {
        artifact_root: cli.artifacts.clone(),
        upstream: UpstreamConfig::default().with_timeout(Duration::from_secs(cli.timeout.max(1))),
        pool_width: cli.pool_width,
        keep_versions: cli.keep_versions.max(1),
        keep_builds: cli.keep_builds.max(1),
        total_recommended: cli.total_recommended,
        include_prerelease: cli.prerelease,
        interval: None,
        ..SyncConfig::default()
    };
    if !cli.qualities.is_empty() {
        config.qualities = cli.qualities.clone();
    }
    if !cli.platforms.is_empty() {
        config.platforms = cli.platforms.clone();
    }

    let upstream = UpstreamClient::new(config.upstream.clone());
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Sync { interval } => {
            config.interval = interval.map(Duration::from_secs);
            commands::sync::run(&config, &upstream, json_output)
        }
        Commands::Binaries => commands::binaries::run(&config, &upstream, json_output),
        Commands::Extensions { mode } => {
            commands::extensions::run(&config, &upstream, mode.into(), json_output)
        }
        Commands::Search { text, limit } => {
            commands::search::run(&upstream, &text, limit, json_output)
        }
        Commands::Verify => commands::verify::run(&config.artifact_root, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("upstream") {
                EXIT_UPSTREAM_ERROR
            } else if msg.starts_with("store error:") || msg.contains("store lock") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
