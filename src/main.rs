use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mirrorsync::{
    build_release, handle_control, reconcile, CacheSynchronizer, ControlRequest, FsBlobStore,
    HttpFetcher, JsonFileMetadataStore, MirrorConfig, MirrorError, Notification,
    RequestInterceptor, SyncOutcome,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mirrorsync")]
#[command(about = "Keep an offline mirror of a versioned file set up to date", long_about = None)]
#[command(version)]
struct Args {
    /// Base URL of the published release tree
    #[arg(long, default_value = "http://localhost:8000")]
    base_url: String,

    /// Local directory for metadata and blobs
    #[arg(short, long, default_value = ".mirror")]
    data_dir: String,

    /// Maximum number of concurrent file downloads
    #[arg(long, default_value_t = 4)]
    max_concurrent_downloads: usize,

    /// Whole synchronization attempts before giving up on transport errors
    #[arg(long, default_value_t = 3)]
    sync_attempts: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the newest version if upstream moved
    Sync,
    /// Check upstream and record whether an update is available
    Check,
    /// Show the recorded update info
    Info,
    /// Show the engine version
    Version,
    /// Show which files an update would fetch
    Diff,
    /// Resolve a path from the mirror and write it to stdout
    Get { path: String },
    /// Drop the local mirror and install the newest version from scratch
    Reinstall,
    /// Publish a directory as a new version
    Release {
        /// Directory holding the files to publish
        source: PathBuf,
        /// Version label of the release
        #[arg(long)]
        app_version: String,
        /// Root of the published release tree
        #[arg(long)]
        target: PathBuf,
    },
}

fn progress_bar() -> indicatif::ProgressBar {
    let progress_bar = indicatif::ProgressBar::new(0);
    progress_bar.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
            .expect("progress template is valid")
            .progress_chars("█▓▒░ "),
    );
    progress_bar
}

async fn open_synchronizer(config: MirrorConfig) -> anyhow::Result<Arc<CacheSynchronizer>> {
    let data_dir = Path::new(&config.data_dir).to_path_buf();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {:?}", data_dir))?;

    let metadata = JsonFileMetadataStore::open(data_dir.join("metadata.json")).await?;
    let blobs = FsBlobStore::new(data_dir.join("blobs"));

    let sync = CacheSynchronizer::new(
        config,
        Arc::new(HttpFetcher::new()),
        Arc::new(metadata),
        Arc::new(blobs),
    )
    .with_progress_bar(progress_bar());
    Ok(Arc::new(sync))
}

async fn print_message(sync: &CacheSynchronizer, request: ControlRequest) -> anyhow::Result<()> {
    let response = handle_control(sync, request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if let Notification::StatusInfo { text } = &response {
        if text.starts_with("Sorry") {
            bail!("{}", text);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("mirrorsync={}", log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = MirrorConfig {
        base_url: args.base_url,
        data_dir: args.data_dir,
        max_concurrent_downloads: args.max_concurrent_downloads,
        sync_attempts: args.sync_attempts,
        ..MirrorConfig::default()
    };

    match args.command {
        Command::Release {
            source,
            app_version,
            target,
        } => {
            let manifest = build_release(&config, &source, &app_version, &target).await?;
            info!(
                "✅ Published {} ({} files) to {:?}",
                manifest.app_version,
                manifest.files.len(),
                target
            );
        }
        Command::Sync => {
            let sync = open_synchronizer(config).await?;
            match sync.synchronize_with_retry().await? {
                SyncOutcome::Installed(report) => {
                    info!(
                        "✅ Installed {}: {} fetched, {} copied, {} removed",
                        report.version,
                        report.fetched.len(),
                        report.copied.len(),
                        report.removed.len()
                    );
                }
                outcome => info!("✅ Already up to date ({})", outcome.version()),
            }
        }
        Command::Check => {
            let sync = open_synchronizer(config).await?;
            print_message(&sync, ControlRequest::CheckForUpdates).await?;
        }
        Command::Info => {
            let sync = open_synchronizer(config).await?;
            print_message(&sync, ControlRequest::GetUpdateInfo).await?;
        }
        Command::Version => {
            let sync = open_synchronizer(config).await?;
            print_message(&sync, ControlRequest::GetVersion).await?;
        }
        Command::Diff => {
            let sync = open_synchronizer(config).await?;
            let manifest = sync.fetch_manifest().await?;
            let result = reconcile(&manifest, sync.metadata().as_ref()).await?;
            let records = sync.metadata().file_records().await?;

            println!(
                "{} -> {}{}",
                result.local_generation.as_deref().unwrap_or("<none>"),
                result.upstream_app_version,
                if result.version_changed() { "" } else { " (up to date)" }
            );
            for entry in &result.changed {
                println!("M {}", entry.url);
            }
            for entry in &result.new {
                println!("A {}", entry.url);
            }
            for record in result.removed(&records) {
                println!("D {}", record.url);
            }
            println!("{} bytes to fetch", result.fetch_size());
        }
        Command::Get { path } => {
            let sync = open_synchronizer(config).await?;
            let interceptor = RequestInterceptor::new(sync);
            match interceptor.resolve(&path).await {
                Ok(resolved) => {
                    info!("Resolved {} ({:?})", resolved.path, resolved.source);
                    std::io::stdout().write_all(&resolved.body)?;
                }
                Err(MirrorError::NotFound(path)) => {
                    bail!("{} is not part of the mirror", path)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Reinstall => {
            let sync = open_synchronizer(config).await?;
            let outcome = sync.reinstall().await?;
            info!("✅ Reinstalled {}", outcome.version());
        }
    }

    Ok(())
}
