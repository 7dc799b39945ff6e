//! Storage targets: provider-specific endpoint derivation, request signing and
//! bucket provisioning against S3-compatible object stores.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;

use crate::config::{StorageConfig, resolve_required_string_field, resolve_string_field};
use crate::error::{Error, Result};

pub mod provision;
pub mod sign;

pub use provision::{
    BucketOutcome, bucket_exists, create_bucket, detect_jurisdiction, ensure_bucket,
};
pub use sign::{SignedRequest, sign, sign_at};

const DEFAULT_S3_REGION: &str = "us-east-1";
const R2_REGION: &str = "auto";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    R2,
    S3,
    B2,
    Minio,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::R2 => "r2",
            Self::S3 => "s3",
            Self::B2 => "b2",
            Self::Minio => "minio",
        }
    }

    /// AWS itself expects virtual-hosted addressing; every other provider is
    /// driven path-style.
    pub fn path_style(self) -> bool {
        !matches!(self, Self::S3)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved storage coordinates. Built once from the config record.
#[derive(Clone)]
pub struct StorageTarget {
    pub provider: Provider,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub jurisdiction: Option<String>,
}

// Keeps the secret out of `{:?}` output.
impl fmt::Debug for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageTarget")
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("account_id", &self.account_id)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("jurisdiction", &self.jurisdiction)
            .finish_non_exhaustive()
    }
}

impl StorageTarget {
    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        validate_bucket_name(&cfg.bucket)?;
        if let Some(ep) = resolve_string_field(cfg.endpoint.as_deref(), None) {
            validate_endpoint(&ep)?;
        }
        let access_key_id = resolve_required_string_field(
            "storage.access_key_id",
            cfg.access_key_id.as_deref(),
            cfg.access_key_id_env.as_deref(),
        )?;
        let secret_access_key = resolve_required_string_field(
            "storage.secret_access_key",
            cfg.secret_access_key.as_deref(),
            cfg.secret_access_key_env.as_deref(),
        )?;
        let target = Self {
            provider: cfg.provider,
            bucket: cfg.bucket.trim().to_string(),
            access_key_id,
            secret_access_key,
            account_id: resolve_string_field(cfg.account_id.as_deref(), None),
            region: resolve_string_field(cfg.region.as_deref(), None),
            endpoint: resolve_string_field(cfg.endpoint.as_deref(), None)
                .map(|e| e.trim_end_matches('/').to_string()),
            jurisdiction: resolve_string_field(cfg.jurisdiction.as_deref(), None),
        };
        // Fail early when the provider has no authoritative endpoint source.
        target.endpoint()?;
        Ok(target)
    }

    /// Explicit endpoint always wins; otherwise derived per provider.
    pub fn endpoint(&self) -> Result<String> {
        if let Some(ep) = self.endpoint.as_deref() {
            return Ok(ep.to_string());
        }
        match self.provider {
            Provider::R2 => {
                let account = self.account_id.as_deref().ok_or_else(|| {
                    Error::validation("storage.account_id is required for provider r2")
                })?;
                Ok(r2_endpoint(account, self.jurisdiction.as_deref().unwrap_or("")))
            }
            Provider::S3 => Ok(format!(
                "https://s3.{}.amazonaws.com",
                self.region.as_deref().unwrap_or(DEFAULT_S3_REGION)
            )),
            Provider::B2 | Provider::Minio => Err(Error::validation(format!(
                "storage.endpoint is required for provider {}",
                self.provider
            ))),
        }
    }

    /// Region used in the credential scope when signing.
    pub fn signing_region(&self) -> String {
        if let Some(r) = self.region.as_deref() {
            return r.to_string();
        }
        match self.provider {
            Provider::R2 => R2_REGION.into(),
            Provider::B2 => self
                .endpoint
                .as_deref()
                .and_then(b2_region_from_endpoint)
                .unwrap_or_else(|| DEFAULT_S3_REGION.into()),
            Provider::S3 | Provider::Minio => DEFAULT_S3_REGION.into(),
        }
    }

    /// Repository locator handed to the backup engine.
    pub fn repository_url(&self) -> Result<String> {
        Ok(format!("s3:{}/{}", self.endpoint()?, self.bucket))
    }
}

pub fn r2_endpoint(account_id: &str, jurisdiction: &str) -> String {
    let jurisdiction = jurisdiction.trim();
    if jurisdiction.is_empty() {
        format!("https://{account_id}.r2.cloudflarestorage.com")
    } else {
        format!("https://{account_id}.{jurisdiction}.r2.cloudflarestorage.com")
    }
}

fn b2_region_from_endpoint(endpoint: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"s3\.([a-z0-9-]+)\.backblazeb2\.com").expect("valid b2 endpoint regex")
    });
    re.captures(endpoint)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Requests are signed for `/<bucket>` on the bare host, so an endpoint may
/// not carry a path prefix or query of its own.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| Error::validation(format!("invalid storage.endpoint '{endpoint}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::validation(format!(
            "storage.endpoint '{endpoint}' must be an http(s) URL with a host"
        )));
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(Error::validation(format!(
            "storage.endpoint '{endpoint}' must not include a path; \
             put the bucket in storage.bucket"
        )));
    }
    Ok(())
}

pub fn validate_bucket_name(name: &str) -> Result<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid bucket regex")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "bucket name '{name}' must be 3-63 chars of lowercase letters, digits, '.' or '-', \
             starting and ending with a letter or digit"
        )))
    }
}
