use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;

use snapvault::Result;
use snapvault::config::{RetentionPolicy, VaultConfig, default_config_path};
use snapvault::credentials::SecretBackend;
use snapvault::error::Error;
use snapvault::ops::{
    BackupRequest, RestoreRequest, RetentionOutcome, SetupOutcome, SnapshotSelector, Vault,
};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Config file (default: $SNAPVAULT_CONFIG or ~/.config/snapvault/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Repository passphrase; overrides SNAPVAULT_PASSPHRASE and the secret store
    #[arg(long, global = true)]
    passphrase: Option<String>,
    /// Log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the bucket if needed and initialize the repository
    Setup,
    /// Back up the configured source directory
    Backup {
        /// Only back up these categories (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
        /// Extra snapshot tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Report what would be stored without writing a snapshot
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a snapshot into a directory
    Restore {
        /// Destination directory
        #[arg(long)]
        target: PathBuf,
        /// Snapshot id or unique prefix
        #[arg(long, conflicts_with = "at")]
        snapshot: Option<String>,
        /// Nearest snapshot to a time ("2 hours ago", "2024-06-01 14:30", RFC 3339)
        #[arg(long)]
        at: Option<String>,
        /// Only restore these categories (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,
    },
    /// List snapshots, oldest first
    Snapshots {
        /// Filter by tag instead of the configured backup tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Print the raw snapshot records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply the retention policy and prune unreferenced data
    Forget {
        #[arg(long)]
        keep_last: Option<u32>,
        #[arg(long)]
        keep_daily: Option<u32>,
        #[arg(long)]
        keep_weekly: Option<u32>,
        #[arg(long)]
        keep_monthly: Option<u32>,
    },
    /// Show repository size and compression
    Stats,
    /// Show configuration, connectivity and repository health
    Status,
    /// Probe which R2 jurisdiction hosts the configured account
    DetectJurisdiction,
    /// Print the category of each path (relative to the protected directory)
    Categorize {
        paths: Vec<String>,
    },
    /// Manage the passphrase in the secret store
    Passphrase {
        #[command(subcommand)]
        action: PassphraseAction,
    },
}

#[derive(Debug, Subcommand)]
enum PassphraseAction {
    /// Store a passphrase (read from stdin when --value is omitted)
    Set {
        #[arg(long)]
        value: Option<String>,
    },
    /// Remove the stored passphrase
    Delete,
    /// Report which store is in use and whether it holds a passphrase
    Status,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    snapvault::logging::init(&args.log_level, args.log_json)?;

    let pass = args.passphrase.as_deref();
    match args.cmd {
        Command::Categorize { ref paths } => cmd_categorize(paths),
        Command::Setup => cmd_setup(&load_vault(&args.config)?, pass),
        Command::Backup {
            ref only,
            ref tags,
            dry_run,
        } => cmd_backup(&load_vault(&args.config)?, pass, only, tags, dry_run),
        Command::Restore {
            ref target,
            ref snapshot,
            ref at,
            ref only,
        } => {
            let selector = match (snapshot, at) {
                (Some(id), _) => SnapshotSelector::Id(id.clone()),
                (None, Some(expr)) => SnapshotSelector::At(expr.clone()),
                (None, None) => SnapshotSelector::Latest,
            };
            let req = RestoreRequest {
                selector,
                target_dir: snapvault::ops::restore_target(target)?,
                categories: only.clone(),
            };
            cmd_restore(&load_vault(&args.config)?, pass, &req)
        }
        Command::Snapshots { ref tags, json } => {
            cmd_snapshots(&load_vault(&args.config)?, pass, tags, json)
        }
        Command::Forget {
            keep_last,
            keep_daily,
            keep_weekly,
            keep_monthly,
        } => {
            let flags = RetentionPolicy {
                keep_last,
                keep_daily,
                keep_weekly,
                keep_monthly,
            };
            let over = (flags != RetentionPolicy::default()).then_some(flags);
            cmd_forget(&load_vault(&args.config)?, pass, over)
        }
        Command::Stats => cmd_stats(&load_vault(&args.config)?, pass),
        Command::Status => cmd_status(&load_vault(&args.config)?, pass),
        Command::DetectJurisdiction => cmd_detect_jurisdiction(&load_vault(&args.config)?),
        Command::Passphrase { ref action } => {
            cmd_passphrase(&load_vault(&args.config)?, action)
        }
    }
}

fn load_vault(config: &Option<PathBuf>) -> Result<Vault> {
    let path = match config {
        Some(p) => p.clone(),
        None => default_config_path()?,
    };
    Ok(Vault::new(VaultConfig::load(&path)?))
}

fn cmd_categorize(paths: &[String]) -> Result<()> {
    for p in paths {
        println!("{:<10} {p}", snapvault::categories::categorize(p));
    }
    Ok(())
}

fn cmd_setup(vault: &Vault, pass: Option<&str>) -> Result<()> {
    match vault.setup(pass)? {
        SetupOutcome::Initialized => println!("repository initialized"),
        SetupOutcome::AlreadyInitialized => println!("repository already initialized"),
    }
    Ok(())
}

fn cmd_backup(
    vault: &Vault,
    pass: Option<&str>,
    only: &[String],
    tags: &[String],
    dry_run: bool,
) -> Result<()> {
    let req = BackupRequest {
        categories: only.to_vec(),
        extra_tags: tags.to_vec(),
        dry_run,
    };
    let report = vault.backup(pass, &req)?;
    let s = &report.summary;
    match s.snapshot_id.as_deref() {
        Some(id) => println!("snapshot {id} saved"),
        None => println!("dry run: no snapshot written"),
    }
    println!(
        "files: {} new, {} changed, {} unchanged",
        s.new_files, s.changed_files, s.unchanged_files
    );
    println!(
        "added {} of {} processed in {:.1}s",
        human_bytes(s.bytes_added),
        human_bytes(s.bytes_processed),
        s.duration_seconds
    );
    match report.retention {
        RetentionOutcome::Skipped => {}
        RetentionOutcome::Applied(r) => {
            println!("retention: kept {}, removed {}", r.kept, r.removed)
        }
        RetentionOutcome::Failed(msg) => println!("warning: retention failed: {msg}"),
    }
    Ok(())
}

fn cmd_restore(vault: &Vault, pass: Option<&str>, req: &RestoreRequest) -> Result<()> {
    let report = vault.restore(pass, req)?;
    println!(
        "restored snapshot {} ({}) into {}",
        report.snapshot.short(),
        report.snapshot.time.to_rfc3339(),
        report.target_dir.display()
    );
    if !report.includes.is_empty() {
        println!("included: {}", report.includes.join(", "));
    }
    Ok(())
}

fn cmd_snapshots(vault: &Vault, pass: Option<&str>, tags: &[String], json: bool) -> Result<()> {
    let tags = (!tags.is_empty()).then_some(tags);
    let list = vault.snapshots(pass, tags)?;
    if json {
        let s = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::msg(format!("failed to encode snapshots: {e}")))?;
        println!("{s}");
        return Ok(());
    }
    if list.is_empty() {
        println!("no snapshots");
        return Ok(());
    }
    for s in &list {
        println!(
            "{:<10} {:<26} {:<16} {}",
            s.short(),
            s.time.format("%Y-%m-%d %H:%M:%S UTC"),
            s.hostname,
            s.tags.join(",")
        );
    }
    Ok(())
}

fn cmd_forget(vault: &Vault, pass: Option<&str>, over: Option<RetentionPolicy>) -> Result<()> {
    let report = vault.forget(pass, over)?;
    println!("kept {}, removed {}", report.kept, report.removed);
    Ok(())
}

fn cmd_stats(vault: &Vault, pass: Option<&str>) -> Result<()> {
    let st = vault.stats(pass)?;
    println!("stored size:       {}", human_bytes(st.total_size));
    if let Some(u) = st.total_uncompressed_size {
        println!("uncompressed size: {}", human_bytes(u));
    }
    if let Some(r) = st.compression_ratio {
        println!("compression ratio: {r:.2}x");
    }
    if let Some(b) = st.blob_count {
        println!("blobs:             {b}");
    }
    if let Some(n) = st.snapshots_count {
        println!("snapshots:         {n}");
    }
    Ok(())
}

fn cmd_status(vault: &Vault, pass: Option<&str>) -> Result<()> {
    let st = vault.status(pass)?;
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("config:      {}", st.config_path.display());
    println!("provider:    {}", st.target.provider);
    println!("bucket:      {}", st.target.bucket);
    println!("endpoint:    {}", st.endpoint);
    println!(
        "engine:      {} (installed: {})",
        st.engine_binary,
        yes_no(st.engine_installed)
    );
    println!(
        "passphrase:  {} (store: {})",
        if st.passphrase_available { "available" } else { "missing" },
        st.secret_store
    );
    println!("bucket ok:   {}", yes_no(st.bucket_exists));
    match st.repository_ready {
        Some(true) => println!("repository:  ready"),
        Some(false) => println!("repository:  not initialized or unreachable"),
        None => println!("repository:  unknown (no passphrase)"),
    }
    if let Some(list) = st.snapshots.as_deref() {
        println!("snapshots:   {}", list.len());
        if let Some(last) = list.last() {
            println!("latest:      {} at {}", last.short(), last.time.to_rfc3339());
        }
    }
    Ok(())
}

fn cmd_detect_jurisdiction(vault: &Vault) -> Result<()> {
    let target = vault.target()?;
    let account = target
        .account_id
        .as_deref()
        .ok_or_else(|| Error::validation("storage.account_id is required to probe R2"))?;
    let jurisdiction = snapvault::storage::detect_jurisdiction(
        account,
        &target.access_key_id,
        &target.secret_access_key,
    );
    if jurisdiction.is_empty() {
        println!("default (no jurisdiction)");
    } else {
        println!("{jurisdiction}");
    }
    Ok(())
}

fn cmd_passphrase(vault: &Vault, action: &PassphraseAction) -> Result<()> {
    let store = vault.store();
    match action {
        PassphraseAction::Set { value } => {
            let secret = match value {
                Some(v) => v.clone(),
                None => {
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim_end_matches(['\n', '\r']).to_string()
                }
            };
            vault.store_passphrase(&secret)?;
            println!("passphrase stored in {} store", store.name());
        }
        PassphraseAction::Delete => {
            if vault.delete_passphrase()? {
                println!("passphrase removed from {} store", store.name());
            } else {
                println!("no passphrase stored in {} store", store.name());
            }
        }
        PassphraseAction::Status => {
            let present = store.is_available() && store.get().is_some();
            println!(
                "store: {} (available: {}), passphrase: {}",
                store.name(),
                store.is_available(),
                if present { "stored" } else { "not stored" }
            );
        }
    }
    Ok(())
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}
