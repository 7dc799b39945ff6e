use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::credentials::SecretBackend;
use crate::error::{Error, Result};

const FILE_NAME: &str = "passphrase";

/// Plain file readable only by the owner.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretBackend for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn get(&self) -> Option<String> {
        let raw = fs::read_to_string(&self.path).ok()?;
        let v = raw.trim_end_matches(['\n', '\r']);
        if v.trim().is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    }

    fn set(&self, secret: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts
            .open(&self.path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", self.path.display())))?;
        // An existing file keeps its old mode on open; tighten it explicitly.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        f.write_all(secret.as_bytes())?;
        f.write_all(b"\n")?;
        Ok(())
    }

    fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::msg(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}
