//! timevault: Time-Machine-style encrypted backup client
//!
//! Commands:
//!   init                     - write a fresh configuration file
//!   backup                   - run one incremental backup session
//!   restore file|dir|snapshot - materialize files as of an instant
//!   history <path>           - version history of one file
//!   timestamps               - distinct session stamps (newest first)
//!   files / dirs             - browse the catalog
//!   status                   - driver state and catalog totals
//!   recover                  - rebuild an empty catalog from snapshots
//!   clear                    - wipe the local catalog

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use timevault_catalog::Catalog;
use timevault_core::config::VaultConfig;
use timevault_core::progress::{Phase, Progress, ProgressSink};
use timevault_engine::{recover_catalog, BackupDriver, RestorePlanner, SessionGuard};
use timevault_remote::{DirStore, RemoteStore};

#[derive(Parser, Debug)]
#[command(
    name = "timevault",
    version,
    about = "Zero-knowledge versioned backup client",
    long_about = "timevault: walk configured directories, encrypt changed files locally, \
                  ship them as bounded shards, and restore any path as it existed at any instant."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short = 'c', env = "TIMEVAULT_CONFIG", default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log filter (e.g. info, timevault_engine=debug)
    #[arg(long, env = "TIMEVAULT_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a fresh configuration file with a generated KDF salt
    Init,

    /// Run one incremental backup session
    Backup,

    /// Restore files as they existed at a point in time
    Restore {
        #[command(subcommand)]
        what: RestoreTarget,
    },

    /// Show the version history of one file
    History {
        /// Absolute path as it was backed up
        path: String,
    },

    /// List distinct session timestamps, newest first
    Timestamps,

    /// List every backed-up file with version counts
    Files,

    /// List backed-up source directories
    Dirs,

    /// Show driver state and catalog totals
    Status,

    /// Rebuild an empty local catalog from uploaded snapshots
    Recover,

    /// Delete every record from the local catalog
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RestoreTarget {
    /// One file
    File {
        /// Absolute path as it was backed up
        path: String,
        /// Instant to restore at (e.g. "2024-01-15 10:00:00")
        #[arg(long)]
        at: String,
        /// Directory to restore into (default: original location)
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Every file under a directory prefix
    Dir {
        /// Directory prefix as it was backed up
        prefix: String,
        #[arg(long)]
        at: String,
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// The complete snapshot
    Snapshot {
        #[arg(long)]
        at: String,
        #[arg(long)]
        to: Option<PathBuf>,
    },
}

fn default_config_path() -> PathBuf {
    VaultConfig::default()
        .backup
        .data_dir
        .join("timevault.toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    if let Commands::Init = cli.command {
        return init_config(&cli.config);
    }

    let config = VaultConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let catalog = Catalog::open(&config.backup.data_dir.join("catalog.db"))?;
    let guard = Arc::new(SessionGuard::new());

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Backup => backup(config, catalog, guard).await,
        Commands::Restore { what } => restore(config, catalog, guard, what).await,
        Commands::History { path } => history(&catalog, &path),
        Commands::Timestamps => timestamps(&catalog),
        Commands::Files => files(&catalog),
        Commands::Dirs => dirs_cmd(&catalog),
        Commands::Status => status(config, catalog, guard),
        Commands::Recover => recover(config, catalog).await,
        Commands::Clear { yes } => clear(&catalog, yes),
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let config = VaultConfig::generate();
    config.save(path)?;
    println!("wrote {}", path.display());
    println!("fill in [server], [device], [crypto].passphrase and [backup].roots before backing up");
    Ok(())
}

fn build_store(config: &VaultConfig) -> Result<Arc<DirStore>> {
    let base = &config.server.base_url;
    if base.is_empty() {
        bail!("server.base_url is not set");
    }
    if base.contains("://") {
        bail!("this build ships the directory store only; point server.base_url at a store directory");
    }
    Ok(Arc::new(DirStore::new(
        Path::new(base),
        &config.server.user_email,
        config.device.device_id,
    )))
}

async fn backup(config: VaultConfig, catalog: Catalog, guard: Arc<SessionGuard>) -> Result<()> {
    let store = build_store(&config)?;
    let (sink, mut rx) = ProgressSink::channel();
    let driver = BackupDriver::new(catalog, store, config, guard, sink);

    let bar = session_bar();
    let printer = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            render(&bar, &report);
        }
        bar.finish_and_clear();
    });

    let result = driver.run().await;
    drop(driver);
    let _ = printer.await;

    let summary = result?;
    if summary.files_backed_up == 0 {
        println!(
            "nothing to do: {} files scanned, all up to date",
            summary.scanned
        );
    } else {
        println!(
            "session {}: {} files in {} shards ({} bytes read)",
            summary.session_id, summary.files_backed_up, summary.shards_uploaded, summary.bytes_read
        );
    }
    Ok(())
}

async fn restore(
    config: VaultConfig,
    catalog: Catalog,
    guard: Arc<SessionGuard>,
    what: RestoreTarget,
) -> Result<()> {
    let store = build_store(&config)?;
    let key = timevault_crypto::key_from_config(&config.crypto)?;

    let (sink, mut rx) = ProgressSink::channel();
    let planner = RestorePlanner::new(catalog, store, key, guard, sink);

    let bar = session_bar();
    let printer = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            render(&bar, &report);
        }
        bar.finish_and_clear();
    });

    let result = match &what {
        RestoreTarget::File { path, at, to } => {
            planner
                .restore_file(path, parse_instant(at)?, to.as_deref())
                .await
        }
        RestoreTarget::Dir { prefix, at, to } => {
            planner
                .restore_directory(prefix, parse_instant(at)?, to.as_deref())
                .await
        }
        RestoreTarget::Snapshot { at, to } => {
            planner
                .restore_snapshot(parse_instant(at)?, to.as_deref())
                .await
        }
    };
    drop(planner);
    let _ = printer.await;

    let summary = result?;
    println!("restored {} of {} files", summary.restored, summary.requested);
    Ok(())
}

fn history(catalog: &Catalog, path: &str) -> Result<()> {
    let entries = catalog.history(path)?;
    if entries.is_empty() {
        println!("no versions of {path}");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:>12} bytes  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%:z"),
            entry.plain_size,
            &entry.content_hash[..12]
        );
    }
    Ok(())
}

fn timestamps(catalog: &Catalog) -> Result<()> {
    for ts in catalog.distinct_timestamps()? {
        println!("{}", ts.format("%Y-%m-%d %H:%M:%S%:z"));
    }
    Ok(())
}

fn files(catalog: &Catalog) -> Result<()> {
    for info in catalog.files_with_info()? {
        println!(
            "{}  versions={} latest={} size={}",
            info.orig_path,
            info.version_count,
            info.latest_version.format("%Y-%m-%d %H:%M:%S"),
            info.plain_size
        );
    }
    Ok(())
}

fn dirs_cmd(catalog: &Catalog) -> Result<()> {
    for dir in catalog.distinct_directories()? {
        println!("{dir}");
    }
    Ok(())
}

fn status(config: VaultConfig, catalog: Catalog, guard: Arc<SessionGuard>) -> Result<()> {
    let store = build_store(&config)?;
    let driver = BackupDriver::new(
        catalog,
        store,
        config,
        guard,
        ProgressSink::disabled(),
    );
    let status = driver.status()?;
    println!("state:        {:?}", status.state);
    println!("device:       {} ({})", status.device_name, status.device_id);
    println!("versions:     {}", status.catalog.record_count);
    println!("plain bytes:  {}", status.catalog.plain_bytes);
    println!("packed bytes: {}", status.catalog.packed_bytes);
    Ok(())
}

async fn recover(config: VaultConfig, catalog: Catalog) -> Result<()> {
    if !catalog.is_empty()? {
        bail!("local catalog is not empty; recovery only runs on a clean catalog");
    }
    let store = build_store(&config)?;
    let key = timevault_crypto::key_from_config(&config.crypto)?;

    let summary = recover_catalog(
        &catalog,
        store.as_ref() as &dyn RemoteStore,
        &key,
        &config.backup.data_dir.join("recovery"),
    )
    .await?;
    println!(
        "merged {} of {} snapshots, {} records",
        summary.snapshots_merged, summary.snapshots_listed, summary.records_imported
    );
    Ok(())
}

fn clear(catalog: &Catalog, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to clear the catalog without --yes");
    }
    catalog.clear_all()?;
    println!("catalog cleared");
    Ok(())
}

/// Parse a user-supplied instant in local time. Bare dates mean midnight.
fn parse_instant(text: &str) -> Result<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight exists"))
        })
        .with_context(|| format!("unparseable instant {text:?}"))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.fixed_offset())
        .with_context(|| format!("ambiguous local instant {text:?}"))
}

fn session_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:30.cyan/dim} {percent:>3}% {wide_msg}")
            .expect("static template"),
    );
    bar
}

fn render(bar: &ProgressBar, report: &Progress) {
    bar.set_position(report.percent.clamp(0.0, 100.0) as u64);
    let label = match report.phase {
        Phase::Starting => "starting",
        Phase::Scanning => "scanning",
        Phase::Encrypting => "encrypting",
        Phase::Uploading => "uploading",
        Phase::UpdatingCatalog => "updating catalog",
        Phase::UploadingCatalog => "uploading catalog",
        Phase::Downloading => "downloading",
        Phase::Extracting => "extracting",
        Phase::Complete => "complete",
        Phase::Cancelled => "cancelled",
        Phase::Failed => "failed",
    };
    if report.message.is_empty() {
        bar.set_message(label.to_string());
    } else {
        bar.set_message(format!("{label}: {}", report.message));
    }
}
