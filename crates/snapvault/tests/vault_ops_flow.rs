#![cfg(unix)]

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use snapvault::Error;
use snapvault::config::VaultConfig;
use snapvault::credentials::{FileStore, SecretBackend, SecretStore};
use snapvault::ops::{
    BackupRequest, RestoreRequest, RetentionOutcome, SetupOutcome, SnapshotSelector, Vault,
};

const PASS: &str = "integration-passphrase";

/// Answers every request with `status`, recording the request line.
fn spawn_s3_stub(status: u16) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_bg = Arc::clone(&seen);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 8192];
            let n = stream.read(&mut buf).unwrap_or(0);
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            if let Some(line) = req.lines().next() {
                seen_bg.lock().expect("lock").push(line.to_string());
            }
            let resp = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(resp.as_bytes());
        }
    });
    (format!("http://{addr}"), seen)
}

/// Fake engine with a persistent "initialized" marker so repository checks
/// flip after `init`.
fn write_engine(dir: &Path, forget_exit: i32) -> PathBuf {
    let log = dir.join("calls.log");
    let marker = dir.join("initialized");
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> '{log}'
for a in "$@"; do
  case "$a" in
    cat)
      [ -f '{marker}' ] || {{ echo 'Fatal: unable to open config file' 1>&2; exit 10; }}
      echo '{{"version":2}}'; exit 0 ;;
    init)
      touch '{marker}'; echo 'created restic repository'; exit 0 ;;
    backup)
      echo '{{"message_type":"summary","files_new":4,"files_changed":0,"files_unmodified":0,"data_added":10,"total_bytes_processed":20,"total_duration":0.5,"snapshot_id":"feedface00112233"}}'
      exit 0 ;;
    forget)
      [ {forget_exit} -eq 0 ] || {{ echo 'Fatal: prune failed' 1>&2; exit {forget_exit}; }}
      echo '[{{"keep":[{{"id":"a"}}],"remove":[{{"id":"b"}},{{"id":"c"}}]}}]'
      echo 'repacking packs'
      exit 0 ;;
    snapshots)
      echo '[{{"time":"2024-06-01T09:00:00Z","paths":["/src"],"hostname":"box","tags":["snapvault"],"id":"1111aaaa2222bbbb"}},{{"time":"2024-06-01T11:00:00Z","paths":["/src"],"hostname":"box","tags":["snapvault"],"id":"3333cccc4444dddd"}},{{"time":"2024-06-01T10:10:00Z","paths":["/src"],"hostname":"box","tags":["snapvault"],"id":"5555eeee6666ffff"}}]'
      exit 0 ;;
    restore)
      exit 0 ;;
  esac
done
exit 2
"#,
        log = log.display(),
        marker = marker.display(),
    );
    let path = dir.join("restic");
    fs::write(&path, script).expect("write fake engine");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(ToOwned::to_owned)
        .collect()
}

fn vault(dir: &Path, endpoint: &str, forget_exit: i32) -> Vault {
    let engine = write_engine(dir, forget_exit);
    let src = dir.join("src");
    fs::create_dir_all(&src).expect("src dir");
    let cfg_path = dir.join("config.toml");
    fs::write(
        &cfg_path,
        format!(
            r#"
[storage]
provider = "minio"
bucket = "vault"
endpoint = "{endpoint}"
access_key_id = "minio-access"
secret_access_key = "minio-secret"

[retention]
keep_last = 2

[backup]
source_dir = "{src}"
exclude_categories = ["sessions"]

[engine]
binary = "{engine}"
query_timeout_secs = 10
"#,
            src = src.display(),
            engine = engine.display(),
        ),
    )
    .expect("write config");
    let cfg = VaultConfig::load(&cfg_path).expect("config");
    Vault::with_store(cfg, SecretStore::File(FileStore::in_dir(dir)))
}

#[test]
fn first_backup_provisions_then_applies_retention() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);

    let report = v
        .backup(Some(PASS), &BackupRequest::default())
        .expect("backup");
    assert_eq!(report.summary.snapshot_id.as_deref(), Some("feedface00112233"));
    match report.retention {
        RetentionOutcome::Applied(r) => {
            assert_eq!(r.kept, 1);
            assert_eq!(r.removed, 2);
        }
        other => panic!("unexpected retention outcome: {other:?}"),
    }

    let log = calls(tmp.path());
    let cmds: Vec<&str> = log
        .iter()
        .map(|l| l.trim_start_matches("-o s3.bucket-lookup=path "))
        .map(|l| l.split_whitespace().next().unwrap_or(""))
        .collect();
    assert_eq!(cmds, ["cat", "init", "backup", "forget"]);
    assert!(log[2].contains("--exclude **/sessions/**/*.jsonl --exclude **/sessions/**/*.json"));
    assert_eq!(seen.lock().unwrap()[0], "HEAD /vault HTTP/1.1");

    // Second run finds the repository and skips provisioning.
    v.backup(Some(PASS), &BackupRequest::default())
        .expect("second backup");
    let log = calls(tmp.path());
    assert_eq!(log.len(), 7);
    assert!(!log[4..].iter().any(|l| l.contains(" init")));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn retention_failure_is_reported_not_raised() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 1);
    let report = v
        .backup(Some(PASS), &BackupRequest::default())
        .expect("backup succeeds despite prune failure");
    match report.retention {
        RetentionOutcome::Failed(msg) => assert!(msg.contains("forget"), "{msg}"),
        other => panic!("unexpected retention outcome: {other:?}"),
    }
}

#[test]
fn dry_run_skips_retention() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    let req = BackupRequest {
        categories: vec!["skills".into()],
        dry_run: true,
        ..BackupRequest::default()
    };
    let report = v.backup(Some(PASS), &req).expect("backup");
    assert!(matches!(report.retention, RetentionOutcome::Skipped));
    let log = calls(tmp.path());
    let backup = log.iter().find(|l| l.contains("backup")).expect("backup call");
    assert!(backup.contains("--include skills/** --dry-run"), "{backup}");
    assert!(!log.iter().any(|l| l.contains("forget")));
}

#[test]
fn setup_reports_existing_repository() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    assert_eq!(v.setup(Some(PASS)).unwrap(), SetupOutcome::Initialized);
    assert_eq!(v.setup(Some(PASS)).unwrap(), SetupOutcome::AlreadyInitialized);
}

#[test]
fn restore_at_time_picks_nearest_snapshot() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    let dest = tmp.path().join("restored");
    let report = v
        .restore(
            Some(PASS),
            &RestoreRequest {
                selector: SnapshotSelector::At("2024-06-01T10:00:00Z".into()),
                target_dir: dest.clone(),
                categories: vec!["skills".into()],
            },
        )
        .expect("restore");
    assert_eq!(report.snapshot.id, "5555eeee6666ffff");
    assert!(dest.is_dir());
    let log = calls(tmp.path());
    let restore = log.iter().find(|l| l.contains("restore")).expect("restore call");
    assert!(
        restore.ends_with(&format!(
            "restore 5555eeee6666ffff --target {} --include **/skills/**",
            dest.display()
        )),
        "{restore}"
    );

    let latest = v
        .restore(
            Some(PASS),
            &RestoreRequest {
                selector: SnapshotSelector::Latest,
                target_dir: dest,
                categories: Vec::new(),
            },
        )
        .expect("restore latest");
    assert_eq!(latest.snapshot.id, "3333cccc4444dddd");
}

#[test]
fn restore_rejects_unknown_category_before_running_engine() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    let err = v
        .restore(
            Some(PASS),
            &RestoreRequest {
                selector: SnapshotSelector::Latest,
                target_dir: tmp.path().join("out"),
                categories: vec!["photos".into()],
            },
        )
        .unwrap_err();
    assert!(err.is_validation(), "{err}");
    assert!(calls(tmp.path()).is_empty());
}

#[test]
fn stored_passphrase_is_used_and_missing_one_fails_early() {
    unsafe {
        std::env::remove_var("SNAPVAULT_PASSPHRASE");
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);

    let err = v.snapshots(None, None).unwrap_err();
    assert!(matches!(err, Error::MissingCredential(_)), "{err}");
    assert!(calls(tmp.path()).is_empty());

    v.store_passphrase(PASS).expect("store");
    assert_eq!(v.store().get().as_deref(), Some(PASS));
    let list = v.snapshots(None, None).expect("snapshots");
    assert_eq!(list.len(), 3);
    assert!(list.windows(2).all(|w| w[0].time <= w[1].time));
    assert!(calls(tmp.path())[0].contains("snapshots --json --tag snapvault"));

    assert!(v.delete_passphrase().unwrap());
    assert!(v.snapshots(None, None).is_err());
}

#[test]
fn provisioning_error_surfaces_status() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, _seen) = spawn_s3_stub(403);
    let v = vault(tmp.path(), &endpoint, 0);
    let err = v.setup(Some(PASS)).unwrap_err();
    assert!(
        matches!(err, Error::Provisioning { status: 403, .. }),
        "{err}"
    );
}

fn replace_engine(dir: &Path, body: &str) {
    let script = format!(
        "#!/bin/sh\necho \"$*\" >> '{log}'\n{body}\n",
        log = dir.join("calls.log").display()
    );
    let path = dir.join("restic");
    fs::write(&path, script).expect("write fake engine");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[test]
fn wrong_passphrase_is_reported_instead_of_reinitializing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    replace_engine(
        tmp.path(),
        r#"case "$*" in
  *"cat config"*) echo 'Fatal: wrong password or no key found' 1>&2; exit 12 ;;
  *init*) echo 'Fatal: create repository at s3:x failed: config file already exists' 1>&2; exit 1 ;;
esac
exit 0"#,
    );

    let err = v
        .backup(Some("WRONG"), &BackupRequest::default())
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("passphrase"), "{msg}");
    assert!(!msg.contains("already exists"), "{msg}");
    let log = calls(tmp.path());
    assert_eq!(log.len(), 1, "{log:?}");
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn locked_repository_is_not_reinitialized() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (endpoint, seen) = spawn_s3_stub(200);
    let v = vault(tmp.path(), &endpoint, 0);
    replace_engine(
        tmp.path(),
        "echo 'Fatal: unable to create lock in backend: repository is already locked' 1>&2\nexit 11",
    );

    let err = v.setup(Some(PASS)).unwrap_err();
    assert!(matches!(err, Error::RepositoryLocked(_)), "{err}");
    assert_eq!(calls(tmp.path()).len(), 1);
    assert!(seen.lock().unwrap().is_empty());
}
