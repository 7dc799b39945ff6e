//! Argument vectors and environment for engine invocations. Pure; nothing here spawns.

use std::path::Path;

use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::storage::{Provider, StorageTarget};

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub tags: Vec<String>,
    pub exclude: Vec<String>,
    pub include: Option<Vec<String>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

fn base_args(provider: Provider) -> Vec<String> {
    if provider.path_style() {
        vec!["-o".into(), "s3.bucket-lookup=path".into()]
    } else {
        Vec::new()
    }
}

fn push_repeated(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for v in values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()) {
        args.push(flag.into());
        args.push(v.to_string());
    }
}

pub fn backup_args(provider: Provider, source: &Path, opts: &BackupOptions) -> Vec<String> {
    let mut args = base_args(provider);
    args.push("backup".into());
    args.push(source.display().to_string());
    args.push("--json".into());
    push_repeated(&mut args, "--tag", &opts.tags);
    push_repeated(&mut args, "--exclude", &opts.exclude);
    if let Some(include) = opts.include.as_deref() {
        push_repeated(&mut args, "--include", include);
    }
    if opts.dry_run {
        args.push("--dry-run".into());
    }
    args
}

pub fn restore_args(
    provider: Provider,
    snapshot_id: &str,
    target_dir: &Path,
    opts: &RestoreOptions,
) -> Vec<String> {
    let mut args = base_args(provider);
    args.push("restore".into());
    args.push(snapshot_id.trim().to_string());
    args.push("--target".into());
    args.push(target_dir.display().to_string());
    push_repeated(&mut args, "--include", &opts.include);
    push_repeated(&mut args, "--exclude", &opts.exclude);
    args
}

/// One `--keep-*` flag per non-zero field; zero or absent means unbounded.
pub fn forget_args(provider: Provider, retention: &RetentionPolicy) -> Vec<String> {
    let mut args = base_args(provider);
    args.extend(["forget", "--prune", "--json"].map(String::from));
    let flags = [
        ("--keep-last", retention.keep_last),
        ("--keep-daily", retention.keep_daily),
        ("--keep-weekly", retention.keep_weekly),
        ("--keep-monthly", retention.keep_monthly),
    ];
    for (flag, value) in flags {
        if let Some(n) = value.filter(|n| *n > 0) {
            args.push(flag.into());
            args.push(n.to_string());
        }
    }
    args
}

pub fn snapshots_args(provider: Provider, tags: &[String]) -> Vec<String> {
    let mut args = base_args(provider);
    args.extend(["snapshots", "--json"].map(String::from));
    push_repeated(&mut args, "--tag", tags);
    args
}

pub fn check_args(provider: Provider) -> Vec<String> {
    let mut args = base_args(provider);
    args.extend(["cat", "config", "--json"].map(String::from));
    args
}

pub fn init_args(provider: Provider) -> Vec<String> {
    let mut args = base_args(provider);
    args.push("init".into());
    args
}

pub fn stats_args(provider: Provider) -> Vec<String> {
    let mut args = base_args(provider);
    args.extend(["stats", "--json", "--mode", "raw-data"].map(String::from));
    args
}

/// Repository locator, passphrase and credentials for the child process.
pub fn engine_env(target: &StorageTarget, passphrase: &str) -> Result<Vec<(String, String)>> {
    Ok(vec![
        ("RESTIC_REPOSITORY".into(), target.repository_url()?),
        ("RESTIC_PASSWORD".into(), passphrase.to_string()),
        ("AWS_ACCESS_KEY_ID".into(), target.access_key_id.clone()),
        ("AWS_SECRET_ACCESS_KEY".into(), target.secret_access_key.clone()),
        ("AWS_DEFAULT_REGION".into(), target.signing_region()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn forget_emits_only_nonzero_fields() {
        let r = RetentionPolicy {
            keep_last: Some(7),
            keep_daily: Some(0),
            keep_weekly: None,
            keep_monthly: Some(6),
        };
        assert_eq!(
            forget_args(Provider::S3, &r),
            s(&["forget", "--prune", "--json", "--keep-last", "7", "--keep-monthly", "6"])
        );
        assert_eq!(
            forget_args(Provider::S3, &RetentionPolicy::default()),
            s(&["forget", "--prune", "--json"])
        );
    }

    #[test]
    fn path_style_prefix_for_non_aws_providers() {
        for p in [Provider::R2, Provider::B2, Provider::Minio] {
            let args = init_args(p);
            assert_eq!(args, s(&["-o", "s3.bucket-lookup=path", "init"]), "{p}");
        }
        assert_eq!(init_args(Provider::S3), s(&["init"]));
    }

    #[test]
    fn backup_args_shape() {
        let opts = BackupOptions {
            tags: s(&["snapvault", " ", "nightly"]),
            exclude: s(&["**/sessions/*.jsonl"]),
            include: Some(s(&["skills/**"])),
            dry_run: true,
        };
        assert_eq!(
            backup_args(Provider::R2, Path::new("/srv/agent"), &opts),
            s(&[
                "-o",
                "s3.bucket-lookup=path",
                "backup",
                "/srv/agent",
                "--json",
                "--tag",
                "snapvault",
                "--tag",
                "nightly",
                "--exclude",
                "**/sessions/*.jsonl",
                "--include",
                "skills/**",
                "--dry-run",
            ])
        );
    }

    #[test]
    fn restore_args_shape() {
        let opts = RestoreOptions {
            include: s(&["**/skills/**"]),
            exclude: Vec::new(),
        };
        assert_eq!(
            restore_args(Provider::S3, "abcd1234", Path::new("/tmp/out"), &opts),
            s(&["restore", "abcd1234", "--target", "/tmp/out", "--include", "**/skills/**"])
        );
    }

    #[test]
    fn query_args() {
        assert_eq!(
            snapshots_args(Provider::S3, &s(&["snapvault"])),
            s(&["snapshots", "--json", "--tag", "snapvault"])
        );
        assert_eq!(check_args(Provider::S3), s(&["cat", "config", "--json"]));
        assert_eq!(
            stats_args(Provider::S3),
            s(&["stats", "--json", "--mode", "raw-data"])
        );
    }

    #[test]
    fn env_carries_locator_and_credentials() {
        let target = StorageTarget {
            provider: Provider::R2,
            bucket: "vault".into(),
            access_key_id: "AK".into(),
            secret_access_key: "SK".into(),
            account_id: Some("acct".into()),
            region: None,
            endpoint: None,
            jurisdiction: Some("eu".into()),
        };
        let env = engine_env(&target, "pw").unwrap();
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(
            get("RESTIC_REPOSITORY"),
            Some("s3:https://acct.eu.r2.cloudflarestorage.com/vault")
        );
        assert_eq!(get("RESTIC_PASSWORD"), Some("pw"));
        assert_eq!(get("AWS_ACCESS_KEY_ID"), Some("AK"));
        assert_eq!(get("AWS_SECRET_ACCESS_KEY"), Some("SK"));
        assert_eq!(get("AWS_DEFAULT_REGION"), Some("auto"));
    }
}
