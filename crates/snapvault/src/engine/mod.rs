//! Orchestration of the external backup engine (restic CLI contract).
//!
//! Every operation is one child process: build the argument vector, hand the
//! repository locator and credentials over the environment, wait for exit or
//! deadline, then parse stdout into a typed result.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{EngineConfig, RetentionPolicy};
use crate::credentials::find_in_path;
use crate::error::Result;
use crate::snapshots::Snapshot;
use crate::storage::StorageTarget;

pub mod args;
pub mod output;
pub mod process;

pub use args::{BackupOptions, RestoreOptions};
pub use output::{BackupSummary, ForgetReport, RepositoryStats};
pub use process::EngineOutput;

#[derive(Debug, Clone, Copy)]
enum Class {
    Backup,
    Restore,
    Maintenance,
    Query,
}

#[derive(Debug, Clone)]
pub struct Engine {
    binary: String,
    backup_timeout: Duration,
    restore_timeout: Duration,
    maintenance_timeout: Duration,
    query_timeout: Duration,
    max_output_bytes: usize,
}

impl Engine {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            binary: cfg.binary.trim().to_string(),
            backup_timeout: Duration::from_secs(cfg.backup_timeout_secs),
            restore_timeout: Duration::from_secs(cfg.restore_timeout_secs),
            maintenance_timeout: Duration::from_secs(cfg.maintenance_timeout_secs),
            query_timeout: Duration::from_secs(cfg.query_timeout_secs),
            max_output_bytes: cfg.max_output_bytes,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn is_installed(&self) -> bool {
        find_in_path(&self.binary).is_some()
    }

    fn timeout(&self, class: Class) -> Duration {
        match class {
            Class::Backup => self.backup_timeout,
            Class::Restore => self.restore_timeout,
            Class::Maintenance => self.maintenance_timeout,
            Class::Query => self.query_timeout,
        }
    }

    fn execute(
        &self,
        class: Class,
        target: &StorageTarget,
        passphrase: &str,
        argv: &[String],
    ) -> Result<EngineOutput> {
        let env = args::engine_env(target, passphrase)?;
        process::run(&process::Invocation {
            binary: &self.binary,
            args: argv,
            env: &env,
            timeout: self.timeout(class),
            max_output_bytes: self.max_output_bytes,
            secrets: &[passphrase, target.secret_access_key.as_str()],
        })
    }

    /// Run once and turn a nonzero exit into a classified error.
    fn invoke(
        &self,
        action: &str,
        class: Class,
        target: &StorageTarget,
        passphrase: &str,
        argv: &[String],
    ) -> Result<EngineOutput> {
        let out = self.execute(class, target, passphrase, argv)?;
        if !out.success() {
            return Err(output::classify_failure(
                action,
                out.code,
                &out.stderr,
                &[passphrase, target.secret_access_key.as_str()],
            ));
        }
        Ok(out)
    }

    pub fn run_backup(
        &self,
        source: &Path,
        target: &StorageTarget,
        passphrase: &str,
        opts: &BackupOptions,
    ) -> Result<BackupSummary> {
        let argv = args::backup_args(target.provider, source, opts);
        info!(
            source = %source.display(),
            bucket = %target.bucket,
            dry_run = opts.dry_run,
            "starting backup"
        );
        let out = self.invoke("backup", Class::Backup, target, passphrase, &argv)?;
        let summary = output::parse_backup_summary(&out.stdout)?;
        info!(
            snapshot = summary.snapshot_id.as_deref().unwrap_or("-"),
            new = summary.new_files,
            changed = summary.changed_files,
            bytes_added = summary.bytes_added,
            "backup finished"
        );
        Ok(summary)
    }

    pub fn run_restore(
        &self,
        snapshot_id: &str,
        target_dir: &Path,
        target: &StorageTarget,
        passphrase: &str,
        opts: &RestoreOptions,
    ) -> Result<()> {
        let argv = args::restore_args(target.provider, snapshot_id, target_dir, opts);
        info!(snapshot = snapshot_id, dest = %target_dir.display(), "starting restore");
        self.invoke("restore", Class::Restore, target, passphrase, &argv)?;
        Ok(())
    }

    pub fn run_forget(
        &self,
        target: &StorageTarget,
        passphrase: &str,
        retention: &RetentionPolicy,
    ) -> Result<ForgetReport> {
        let argv = args::forget_args(target.provider, retention);
        let out = self.invoke("forget", Class::Maintenance, target, passphrase, &argv)?;
        let report = output::parse_forget(&out.stdout);
        info!(kept = report.kept, removed = report.removed, "retention applied");
        Ok(report)
    }

    pub fn list_snapshots(
        &self,
        target: &StorageTarget,
        passphrase: &str,
        tags: &[String],
    ) -> Result<Vec<Snapshot>> {
        let argv = args::snapshots_args(target.provider, tags);
        let out = self.invoke("snapshots", Class::Query, target, passphrase, &argv)?;
        output::parse_snapshots(&out.stdout_text())
    }

    /// `Ok(false)` only when the engine reports that no repository exists at
    /// the target. Lock contention, a wrong passphrase and transport failures
    /// are errors.
    pub fn repository_initialized(
        &self,
        target: &StorageTarget,
        passphrase: &str,
    ) -> Result<bool> {
        let argv = args::check_args(target.provider);
        let out = self.execute(Class::Query, target, passphrase, &argv)?;
        if out.success() {
            return Ok(true);
        }
        if output::repository_missing(out.code, &out.stderr) {
            debug!(bucket = %target.bucket, "no repository at target");
            return Ok(false);
        }
        Err(output::classify_failure(
            "cat config",
            out.code,
            &out.stderr,
            &[passphrase, target.secret_access_key.as_str()],
        ))
    }

    /// True when the repository exists and opens with this passphrase. Any
    /// failure, including an unreachable endpoint, reads as false.
    pub fn check_repository(&self, target: &StorageTarget, passphrase: &str) -> bool {
        self.repository_initialized(target, passphrase).unwrap_or_else(|e| {
            debug!(error = %e, "repository check failed");
            false
        })
    }

    pub fn init_repository(&self, target: &StorageTarget, passphrase: &str) -> Result<()> {
        let argv = args::init_args(target.provider);
        info!(bucket = %target.bucket, "initializing repository");
        self.invoke("init", Class::Maintenance, target, passphrase, &argv)?;
        Ok(())
    }

    pub fn repository_stats(
        &self,
        target: &StorageTarget,
        passphrase: &str,
    ) -> Result<RepositoryStats> {
        let argv = args::stats_args(target.provider);
        let out = self.invoke("stats", Class::Query, target, passphrase, &argv)?;
        output::parse_stats(&out.stdout_text())
    }
}
