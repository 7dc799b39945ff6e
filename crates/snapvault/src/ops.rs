//! Per-command control flow: resolve the passphrase, provision on first use,
//! derive include/exclude sets from categories, then drive the engine.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::categories::{self, Direction};
use crate::config::{RetentionPolicy, VaultConfig};
use crate::credentials::{CredentialResolver, SecretBackend, SecretStore};
use crate::engine::{
    BackupOptions, BackupSummary, Engine, ForgetReport, RepositoryStats, RestoreOptions,
};
use crate::error::{Error, Result};
use crate::snapshots::{self, Snapshot};
use crate::storage::{self, Provider, StorageTarget};

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Restrict the backup to these categories; empty means everything.
    pub categories: Vec<String>,
    pub extra_tags: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub enum RetentionOutcome {
    Skipped,
    Applied(ForgetReport),
    /// The backup itself succeeded; pruning did not.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub summary: BackupSummary,
    pub retention: RetentionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    Latest,
    /// Full id or unique prefix.
    Id(String),
    /// Time expression resolved to the nearest snapshot.
    At(String),
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub selector: SnapshotSelector,
    pub target_dir: PathBuf,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot: Snapshot,
    pub target_dir: PathBuf,
    pub includes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Initialized,
    AlreadyInitialized,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub config_path: PathBuf,
    pub target: StorageTarget,
    pub endpoint: String,
    pub engine_binary: String,
    pub engine_installed: bool,
    pub secret_store: &'static str,
    pub passphrase_available: bool,
    pub bucket_exists: bool,
    /// `None` when no passphrase was available to open the repository.
    pub repository_ready: Option<bool>,
    pub snapshots: Option<Vec<Snapshot>>,
}

pub struct Vault {
    config: VaultConfig,
    engine: Engine,
    store: SecretStore,
}

impl Vault {
    pub fn new(config: VaultConfig) -> Self {
        let store = SecretStore::detect(&config.dir());
        Self::with_store(config, store)
    }

    pub fn with_store(config: VaultConfig, store: SecretStore) -> Self {
        let engine = Engine::from_config(&config.engine);
        Self {
            config,
            engine,
            store,
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    pub fn target(&self) -> Result<StorageTarget> {
        StorageTarget::from_config(&self.config.storage)
    }

    pub fn passphrase(&self, explicit: Option<&str>) -> Result<String> {
        CredentialResolver::new(&self.store).resolve(explicit)
    }

    /// Bucket exists and the repository is initialized afterwards. Only a
    /// repository the engine reports as missing is initialized; any other
    /// failure to open it is returned as is.
    fn provision(&self, target: &StorageTarget, passphrase: &str) -> Result<SetupOutcome> {
        if self.engine.repository_initialized(target, passphrase)? {
            return Ok(SetupOutcome::AlreadyInitialized);
        }
        check_r2_jurisdiction(target)?;
        storage::ensure_bucket(target)?;
        self.engine.init_repository(target, passphrase)?;
        Ok(SetupOutcome::Initialized)
    }

    pub fn setup(&self, explicit: Option<&str>) -> Result<SetupOutcome> {
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        let outcome = self.provision(&target, &passphrase)?;
        info!(bucket = %target.bucket, outcome = ?outcome, "setup complete");
        Ok(outcome)
    }

    pub fn backup(&self, explicit: Option<&str>, req: &BackupRequest) -> Result<BackupReport> {
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        let source = self.config.backup.source_path()?;
        if !source.is_dir() {
            return Err(Error::validation(format!(
                "backup source {} is not a directory",
                source.display()
            )));
        }

        let opts = self.backup_options(req)?;
        self.provision(&target, &passphrase)?;
        let summary = self
            .engine
            .run_backup(&source, &target, &passphrase, &opts)?;

        let retention = if req.dry_run
            || !self.config.backup.apply_retention
            || self.config.retention.is_empty()
        {
            RetentionOutcome::Skipped
        } else {
            match self
                .engine
                .run_forget(&target, &passphrase, &self.config.retention)
            {
                Ok(report) => RetentionOutcome::Applied(report),
                Err(e) => {
                    warn!(error = %e, "backup succeeded but retention failed");
                    RetentionOutcome::Failed(e.to_string())
                }
            }
        };
        Ok(BackupReport { summary, retention })
    }

    fn backup_options(&self, req: &BackupRequest) -> Result<BackupOptions> {
        let mut tags = self.config.backup.tags.clone();
        for t in &req.extra_tags {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
        let mut exclude = categories::excludes_for(&self.config.backup.exclude_categories)?;
        exclude.extend(self.config.backup.exclude.iter().cloned());
        let include = if req.categories.is_empty() {
            None
        } else {
            Some(categories::includes_for_all(&req.categories, Direction::Backup)?)
        };
        Ok(BackupOptions {
            tags,
            exclude,
            include,
            dry_run: req.dry_run,
        })
    }

    pub fn restore(&self, explicit: Option<&str>, req: &RestoreRequest) -> Result<RestoreReport> {
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        let includes = categories::includes_for_all(&req.categories, Direction::Restore)?;

        let mut list = self.engine.list_snapshots(&target, &passphrase, &[])?;
        snapshots::sort_chronologically(&mut list);
        let snapshot = select_snapshot(&list, &req.selector)?.clone();

        fs::create_dir_all(&req.target_dir).map_err(|e| {
            Error::msg(format!(
                "failed to create restore target {}: {e}",
                req.target_dir.display()
            ))
        })?;
        let opts = RestoreOptions {
            include: includes.clone(),
            exclude: Vec::new(),
        };
        self.engine
            .run_restore(&snapshot.id, &req.target_dir, &target, &passphrase, &opts)?;
        Ok(RestoreReport {
            snapshot,
            target_dir: req.target_dir.clone(),
            includes,
        })
    }

    /// Oldest first. `tags: None` uses the configured backup tags.
    pub fn snapshots(
        &self,
        explicit: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Snapshot>> {
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        let tags = tags.unwrap_or(self.config.backup.tags.as_slice());
        let mut list = self.engine.list_snapshots(&target, &passphrase, tags)?;
        snapshots::sort_chronologically(&mut list);
        Ok(list)
    }

    pub fn forget(
        &self,
        explicit: Option<&str>,
        retention: Option<RetentionPolicy>,
    ) -> Result<ForgetReport> {
        let retention = retention.unwrap_or(self.config.retention);
        if retention.is_empty() {
            return Err(Error::validation(
                "no retention policy configured; set [retention] or pass --keep-* flags",
            ));
        }
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        self.engine.run_forget(&target, &passphrase, &retention)
    }

    pub fn stats(&self, explicit: Option<&str>) -> Result<RepositoryStats> {
        let passphrase = self.passphrase(explicit)?;
        let target = self.target()?;
        self.engine.repository_stats(&target, &passphrase)
    }

    /// Best-effort health view; only config errors are fatal.
    pub fn status(&self, explicit: Option<&str>) -> Result<StatusReport> {
        let target = self.target()?;
        let endpoint = target.endpoint()?;
        let passphrase = self.passphrase(explicit).ok();
        let bucket_exists = storage::bucket_exists(&target);
        let engine_installed = self.engine.is_installed();

        let (repository_ready, snapshots) = match passphrase.as_deref() {
            Some(p) if engine_installed && bucket_exists => {
                let ready = self.engine.check_repository(&target, p);
                let snaps = if ready {
                    self.engine
                        .list_snapshots(&target, p, &self.config.backup.tags)
                        .map(|mut l| {
                            snapshots::sort_chronologically(&mut l);
                            l
                        })
                        .inspect_err(|e| warn!(error = %e, "failed to list snapshots"))
                        .ok()
                } else {
                    None
                };
                (Some(ready), snaps)
            }
            Some(_) => (Some(false), None),
            None => (None, None),
        };

        Ok(StatusReport {
            config_path: self.config.path.clone(),
            endpoint,
            engine_binary: self.engine.binary().to_string(),
            engine_installed,
            secret_store: self.store.name(),
            passphrase_available: passphrase.is_some(),
            bucket_exists,
            repository_ready,
            snapshots,
            target,
        })
    }

    pub fn store_passphrase(&self, passphrase: &str) -> Result<()> {
        if passphrase.trim().is_empty() {
            return Err(Error::validation("passphrase is empty"));
        }
        self.store.set(passphrase)?;
        info!(store = self.store.name(), "passphrase stored");
        Ok(())
    }

    pub fn delete_passphrase(&self) -> Result<bool> {
        self.store.delete()
    }
}

/// `list` must already be in chronological order for `Latest`.
pub fn select_snapshot<'a>(
    list: &'a [Snapshot],
    selector: &SnapshotSelector,
) -> Result<&'a Snapshot> {
    match selector {
        SnapshotSelector::Latest => list
            .last()
            .ok_or_else(|| Error::NotFound("no snapshots found in the repository".into())),
        SnapshotSelector::At(expr) => snapshots::resolve(list, expr),
        SnapshotSelector::Id(prefix) => {
            let prefix = prefix.trim();
            if prefix.is_empty() {
                return Err(Error::validation("snapshot id is empty"));
            }
            let hits: Vec<&Snapshot> = list.iter().filter(|s| s.id.starts_with(prefix)).collect();
            match hits.as_slice() {
                [one] => Ok(*one),
                [] => Err(Error::NotFound(format!("no snapshot with id '{prefix}'"))),
                many => Err(Error::validation(format!(
                    "snapshot id '{prefix}' is ambiguous ({} matches)",
                    many.len()
                ))),
            }
        }
    }
}

/// An R2 bucket created on the default endpoint lands in the default
/// jurisdiction. When the config names none, probe first and refuse to create
/// the bucket if the credentials belong to a regional jurisdiction.
fn check_r2_jurisdiction(target: &StorageTarget) -> Result<()> {
    if target.provider != Provider::R2
        || target.jurisdiction.is_some()
        || target.endpoint.is_some()
    {
        return Ok(());
    }
    let Some(account) = target.account_id.as_deref() else {
        return Ok(());
    };
    let detected =
        storage::detect_jurisdiction(account, &target.access_key_id, &target.secret_access_key);
    require_default_jurisdiction(&detected)
}

fn require_default_jurisdiction(detected: &str) -> Result<()> {
    if detected.is_empty() {
        return Ok(());
    }
    Err(Error::validation(format!(
        "the storage credentials belong to the '{detected}' R2 jurisdiction; \
         set storage.jurisdiction = \"{detected}\" in the config and rerun"
    )))
}

/// Resolve a restore destination relative to the current directory.
pub fn restore_target(raw: &Path) -> Result<PathBuf> {
    if raw.is_absolute() {
        return Ok(raw.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(raw))
}
