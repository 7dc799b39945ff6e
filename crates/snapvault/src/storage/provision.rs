use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, Response};
use tracing::{debug, info};

use super::sign::{SignedRequest, sign};
use super::{Provider, StorageTarget, r2_endpoint};
use crate::error::{Error, Result};

const BUCKET_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const ALREADY_OWNED_MARKER: &str = "BucketAlreadyOwnedByYou";
const R2_SIGNING_REGION: &str = "auto";

/// Probe order matters: the default (global) jurisdiction is preferred over
/// regional ones.
pub const R2_JURISDICTIONS: &[&str] = &["", "eu", "fedramp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    Created,
    AlreadyOwned,
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))
}

fn send_signed(
    client: &Client,
    method: Method,
    req: &SignedRequest,
    body: Vec<u8>,
) -> reqwest::Result<Response> {
    let mut builder = client.request(method, &req.url);
    for (k, v) in &req.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }
    builder.send()
}

/// True only on HTTP 200. Unreachable endpoints and auth failures read as
/// "absent" so callers go on to attempt creation.
pub fn bucket_exists(target: &StorageTarget) -> bool {
    match head_bucket(target) {
        Ok(status) => {
            debug!(bucket = %target.bucket, status, "bucket HEAD");
            status == 200
        }
        Err(e) => {
            debug!(bucket = %target.bucket, error = %e, "bucket HEAD failed; treating as absent");
            false
        }
    }
}

fn head_bucket(target: &StorageTarget) -> Result<u16> {
    let req = sign(
        "HEAD",
        &target.endpoint()?,
        &format!("/{}", target.bucket),
        b"",
        &target.access_key_id,
        &target.secret_access_key,
        &target.signing_region(),
    )?;
    let client = http_client(BUCKET_TIMEOUT)?;
    let res = send_signed(&client, Method::HEAD, &req, Vec::new())
        .map_err(|e| Error::Network(format!("HEAD {} failed: {e}", req.url)))?;
    Ok(res.status().as_u16())
}

pub fn create_bucket(target: &StorageTarget) -> Result<BucketOutcome> {
    let body = create_bucket_body(target);
    let req = sign(
        "PUT",
        &target.endpoint()?,
        &format!("/{}", target.bucket),
        &body,
        &target.access_key_id,
        &target.secret_access_key,
        &target.signing_region(),
    )?;
    let client = http_client(BUCKET_TIMEOUT)?;
    let res = send_signed(&client, Method::PUT, &req, body)
        .map_err(|e| Error::Network(format!("PUT {} failed: {e}", req.url)))?;
    let status = res.status().as_u16();
    let text = res.text().unwrap_or_default();
    let outcome = classify_create_response(status, &text)?;
    info!(bucket = %target.bucket, provider = %target.provider, ?outcome, "bucket provisioned");
    Ok(outcome)
}

pub(crate) fn classify_create_response(status: u16, body: &str) -> Result<BucketOutcome> {
    match status {
        200 | 201 => Ok(BucketOutcome::Created),
        409 => Ok(BucketOutcome::AlreadyOwned),
        400..=499 if body.contains(ALREADY_OWNED_MARKER) => Ok(BucketOutcome::AlreadyOwned),
        _ => Err(Error::Provisioning {
            status,
            body: body.to_string(),
        }),
    }
}

// AWS rejects an empty create body outside us-east-1.
fn create_bucket_body(target: &StorageTarget) -> Vec<u8> {
    if target.provider != Provider::S3 {
        return Vec::new();
    }
    match target.region.as_deref().map(str::trim) {
        Some(region) if !region.is_empty() && region != "us-east-1" => format!(
            "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <LocationConstraint>{region}</LocationConstraint>\
             </CreateBucketConfiguration>"
        )
        .into_bytes(),
        _ => Vec::new(),
    }
}

/// Create the bucket unless it already answers HEAD with 200.
pub fn ensure_bucket(target: &StorageTarget) -> Result<()> {
    if bucket_exists(target) {
        debug!(bucket = %target.bucket, "bucket already exists");
        return Ok(());
    }
    let _ = create_bucket(target)?;
    Ok(())
}

/// Find the R2 jurisdiction that accepts these credentials. Falls back to the
/// default (empty) jurisdiction when no candidate answers 200.
pub fn detect_jurisdiction(
    account_id: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> String {
    let candidates = R2_JURISDICTIONS
        .iter()
        .map(|j| (*j, r2_endpoint(account_id.trim(), j)))
        .collect::<Vec<_>>();
    probe_jurisdictions(&candidates, access_key_id, secret_access_key)
}

/// Sequential, short-circuiting: the first `(jurisdiction, endpoint)` pair
/// whose authenticated listing returns 200 wins.
pub fn probe_jurisdictions(
    candidates: &[(&str, String)],
    access_key_id: &str,
    secret_access_key: &str,
) -> String {
    let client = match http_client(PROBE_TIMEOUT) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "jurisdiction probe skipped");
            return String::new();
        }
    };
    for (jurisdiction, endpoint) in candidates {
        let req = match sign(
            "GET",
            endpoint,
            "/",
            b"",
            access_key_id,
            secret_access_key,
            R2_SIGNING_REGION,
        ) {
            Ok(r) => r,
            Err(e) => {
                debug!(%endpoint, error = %e, "jurisdiction candidate not signable");
                continue;
            }
        };
        match send_signed(&client, Method::GET, &req, Vec::new()) {
            Ok(res) if res.status().as_u16() == 200 => {
                info!(jurisdiction = %jurisdiction, "detected storage jurisdiction");
                return jurisdiction.to_string();
            }
            Ok(res) => {
                debug!(%endpoint, status = res.status().as_u16(), "jurisdiction candidate rejected")
            }
            Err(e) => debug!(%endpoint, error = %e, "jurisdiction candidate unreachable"),
        }
    }
    String::new()
}
