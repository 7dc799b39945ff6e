use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::storage::Provider;

pub const CONFIG_ENV: &str = "SNAPVAULT_CONFIG";

const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 2 * 60 * 60;
const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 2 * 60 * 60;
const DEFAULT_MAINTENANCE_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 2 * 60;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Raw persisted configuration record. Read per invocation, never written here.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::validation(format!(
                "failed to deserialize config section '{}' in {}: {e}",
                path,
                self.path.display()
            ))
        })?;
        Ok(Some(parsed))
    }
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let value: Value = toml::from_str(&data)
        .map_err(|e| Error::validation(format!("TOML parse error in {}: {e}", path.display())))?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// `$SNAPVAULT_CONFIG`, else `$XDG_CONFIG_HOME/snapvault/config.toml`, else
/// `~/.config/snapvault/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Some(p) = resolve_env_ref(Some(CONFIG_ENV)) {
        return Ok(PathBuf::from(p));
    }
    if let Some(xdg) = resolve_env_ref(Some("XDG_CONFIG_HOME")) {
        return Ok(PathBuf::from(xdg).join("snapvault").join("config.toml"));
    }
    let home = home_dir()?;
    Ok(home.join(".config").join("snapvault").join("config.toml"))
}

pub fn home_dir() -> Result<PathBuf> {
    resolve_env_ref(Some("HOME"))
        .map(PathBuf::from)
        .ok_or_else(|| Error::msg("HOME is not set"))
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw == "~" {
        return home_dir();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return Ok(home_dir()?.join(rest));
    }
    Ok(PathBuf::from(raw))
}

pub(crate) fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A literal value wins; otherwise the named environment variable is consulted.
pub(crate) fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| resolve_env_ref(env_key))
}

pub(crate) fn resolve_required_string_field(
    cfg_path: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| {
        if let Some(k) = env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Error::validation(format!("{cfg_path} is empty (also checked env var '{k}')"))
        } else {
            Error::validation(format!("{cfg_path} is empty"))
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: Provider,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub access_key_id_env: Option<String>,
    pub secret_access_key: Option<String>,
    pub secret_access_key_env: Option<String>,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub jurisdiction: Option<String>,
}

/// Zero or absent means "unbounded" for that bucket; zero fields are never passed to the engine.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        [
            self.keep_last,
            self.keep_daily,
            self.keep_weekly,
            self.keep_monthly,
        ]
        .iter()
        .all(|v| v.unwrap_or(0) == 0)
    }
}

fn default_true() -> bool {
    true
}

fn default_tags() -> Vec<String> {
    vec!["snapvault".into()]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub source_dir: String,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    /// Category names whose backup globs become `--exclude` flags.
    pub exclude_categories: Vec<String>,
    /// Extra raw exclude globs, passed through verbatim.
    pub exclude: Vec<String>,
    #[serde(default = "default_true")]
    pub apply_retention: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_dir: String::new(),
            tags: default_tags(),
            exclude_categories: Vec::new(),
            exclude: Vec::new(),
            apply_retention: true,
        }
    }
}

impl BackupConfig {
    pub fn source_path(&self) -> Result<PathBuf> {
        if self.source_dir.trim().is_empty() {
            return Err(Error::validation("backup.source_dir is empty"));
        }
        expand_home(&self.source_dir)
    }
}

fn default_binary() -> String {
    "restic".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    pub backup_timeout_secs: u64,
    pub restore_timeout_secs: u64,
    pub maintenance_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            backup_timeout_secs: DEFAULT_BACKUP_TIMEOUT_SECS,
            restore_timeout_secs: DEFAULT_RESTORE_TIMEOUT_SECS,
            maintenance_timeout_secs: DEFAULT_MAINTENANCE_TIMEOUT_SECS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Typed view over a [`ConfigDoc`].
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub path: PathBuf,
    pub storage: StorageConfig,
    pub retention: RetentionPolicy,
    pub backup: BackupConfig,
    pub engine: EngineConfig,
}

impl VaultConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let storage: StorageConfig = doc.deserialize_path("storage")?.ok_or_else(|| {
            Error::validation(format!(
                "missing [storage] section in {}",
                doc.path.display()
            ))
        })?;
        Ok(Self {
            path: doc.path.clone(),
            storage,
            retention: doc.deserialize_path("retention")?.unwrap_or_default(),
            backup: doc.deserialize_path("backup")?.unwrap_or_default(),
            engine: doc.deserialize_path("engine")?.unwrap_or_default(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_doc(&load(path)?)
    }

    /// Directory holding the config file; the file-backed secret store lives here too.
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
