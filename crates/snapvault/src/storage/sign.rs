//! AWS Signature Version 4 for the handful of S3 calls we make.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const TERMINATOR: &str = "aws4_request";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub url: String,
    /// `(name, value)` pairs to attach verbatim; `Host` is left to the HTTP client.
    pub headers: Vec<(String, String)>,
}

impl SignedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn sign(
    method: &str,
    endpoint: &str,
    path: &str,
    body: &[u8],
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
) -> Result<SignedRequest> {
    sign_at(
        method,
        endpoint,
        path,
        body,
        access_key_id,
        secret_access_key,
        region,
        Utc::now(),
    )
}

/// Same as [`sign`] with the request instant supplied by the caller.
#[allow(clippy::too_many_arguments)]
pub fn sign_at(
    method: &str,
    endpoint: &str,
    path: &str,
    body: &[u8],
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let method = method.trim().to_ascii_uppercase();
    let base = Url::parse(endpoint.trim())
        .map_err(|e| Error::validation(format!("invalid endpoint '{endpoint}': {e}")))?;
    let host = host_header(&base)?;

    let (raw_path, raw_query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let canonical_uri = canonical_uri(raw_path);
    let canonical_query = raw_query.map(canonical_query).unwrap_or_default();

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = hex_sha256(body);

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n\
         host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n\
         {SIGNED_HEADERS}\n{payload_hash}"
    );
    let scope = format!("{date_stamp}/{region}/{SERVICE}/{TERMINATOR}");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );

    let key = signing_key(secret_access_key, &date_stamp, region);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={access_key_id}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
    );

    let mut url = format!("{}{}", endpoint.trim().trim_end_matches('/'), canonical_uri);
    if !canonical_query.is_empty() {
        url.push('?');
        url.push_str(&canonical_query);
    }

    Ok(SignedRequest {
        url,
        headers: vec![
            ("Authorization".into(), authorization),
            ("x-amz-date".into(), amz_date),
            ("x-amz-content-sha256".into(), payload_hash),
        ],
    })
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("endpoint '{url}' has no host")))?;
    // `port()` is None for the scheme's default port, matching what the client sends.
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn signing_key(secret: &str, date_stamp: &str, region: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn canonical_uri(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".into();
    }
    let trimmed = path.trim_start_matches('/');
    let encoded = trimmed
        .split('/')
        .map(|seg| uri_encode(seg, true))
        .collect::<Vec<_>>()
        .join("/");
    format!("/{encoded}")
}

fn canonical_query(query: &str) -> String {
    let mut pairs = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (uri_encode(k, true), uri_encode(v, true)),
            None => (uri_encode(p, true), String::new()),
        })
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
