//! Blob storage for original file binaries.
//!
//! Extracted text is what the pipeline runs on; the original bytes are kept
//! on the side for provenance. Upload failure must never block extraction
//! or storage, so the walker treats every upload as best-effort.
//!
//! Backends: a local directory, or S3 via the REST API with AWS Signature
//! V4 (pure-Rust `hmac` + `sha2` signing; custom endpoints supported for
//! MinIO/LocalStack). Credentials come from `AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY` (+ optional `AWS_SESSION_TOKEN`).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::config::BlobConfig;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` under `path`, returning the stored location.
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String>;
}

/// No-op backend for the `disabled` configuration.
pub struct DisabledBlobStore;

#[async_trait]
impl BlobStore for DisabledBlobStore {
    async fn upload(&self, _bytes: &[u8], path: &str) -> Result<String> {
        Ok(format!("disabled://{}", path))
    }
}

/// Writes blobs under a root directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String> {
        // Keep writes inside the root.
        let rel: PathBuf = path
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "..")
            .collect();
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, bytes)
            .await
            .with_context(|| format!("blob write failed: {}", dest.display()))?;
        Ok(dest.display().to_string())
    }
}

/// Uploads objects with signed PUT requests.
pub struct S3BlobStore {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    client: reqwest::Client,
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl S3BlobStore {
    pub fn new(bucket: String, region: String, endpoint_url: Option<String>) -> Self {
        Self {
            bucket,
            region,
            endpoint_url,
            client: reqwest::Client::new(),
        }
    }

    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn object_path(&self, key: &str) -> String {
        let encoded = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if self.endpoint_url.is_some() {
            // Path-style addressing for S3-compatible endpoints.
            format!("/{}/{}", self.bucket, encoded)
        } else {
            format!("/{}", encoded)
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String> {
        let creds = AwsCredentials::from_env()?;
        let host = self.host();
        let object_path = self.object_path(path);
        let scheme = match &self.endpoint_url {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        };
        let url = format!("{}://{}{}", scheme, host, object_path);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(bytes);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "PUT\n{}\n\n{}\n{}\n{}",
            object_path, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req = self
            .client
            .put(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .body(bytes.to_vec());
        if let Some(ref token) = creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("S3 PUT failed: s3://{}/{}", self.bucket, path))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PUT failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(format!("s3://{}/{}", self.bucket, path))
    }
}

/// Build the configured backend. `disabled` is a valid configuration.
pub fn create_blob_store(config: &BlobConfig) -> Result<Box<dyn BlobStore>> {
    match config.backend.as_str() {
        "disabled" => Ok(Box::new(DisabledBlobStore)),
        "local" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("blob.root required for local backend"))?;
            Ok(Box::new(LocalBlobStore::new(root)))
        }
        "s3" => {
            let bucket = config
                .bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("blob.bucket required for s3 backend"))?;
            Ok(Box::new(S3BlobStore::new(
                bucket,
                config.region.clone(),
                config.endpoint_url.clone(),
            )))
        }
        other => bail!("Unknown blob backend: {}", other),
    }
}

// ============ SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
