//! Cloudinary-backed [`RemoteStore`].
//!
//! Talks to two Cloudinary surfaces over HTTPS:
//!
//! - **Upload API** (`POST /v1_1/{cloud}/image/upload`): signed multipart
//!   upload. The signature is the SHA-256 hex digest of the sorted, `&`-joined
//!   parameters followed by the API secret.
//! - **Admin API** (`/v1_1/{cloud}/resources/image/upload`): basic-auth
//!   listing (`GET`, cursor paginated) and bulk delete (`DELETE`).
//!
//! # Configuration
//!
//! ```toml
//! [remote]
//! api_base_url = "https://api.cloudinary.com"
//! page_size = 500
//! timeout_secs = 60
//! ```
//!
//! # Environment Variables
//!
//! - `CLOUDINARY_CLOUD_NAME` (or `remote.cloud_name`)
//! - `CLOUDINARY_API_KEY`
//! - `CLOUDINARY_API_SECRET`
//!
//! # Errors
//!
//! HTTP statuses are mapped onto [`RemoteError`]: 429 is
//! [`RemoteError::RateLimited`], 5xx is [`RemoteError::Server`], any other
//! non-success status is [`RemoteError::Client`]. A 409 on a non-overwriting
//! upload, or a success body carrying `"existing": true`, is reported as
//! [`UploadOutcome::AlreadyPresent`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::{ListPage, RemoteError, RemoteStore, UploadOutcome};
use crate::config::{Credentials, RemoteConfig};
use crate::models::{LogicalIdentifier, RemoteAsset};

/// Admin API limit on `public_ids[]` per delete call.
const DELETE_CHUNK: usize = 100;

/// Upper bound on repeated calls while a prefix delete reports `partial`.
const MAX_DELETE_ROUNDS: usize = 100;

pub struct CloudinaryStore {
    name: String,
    base_url: String,
    credentials: Credentials,
    client: reqwest::Client,
}

impl CloudinaryStore {
    pub fn new(credentials: &Credentials, remote: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(remote.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            name: format!("cloudinary:{}", credentials.cloud_name),
            base_url: remote.api_base_url.trim_end_matches('/').to_string(),
            credentials: credentials.clone(),
            client,
        })
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/v1_1/{}/image/upload",
            self.base_url, self.credentials.cloud_name
        )
    }

    fn resources_url(&self) -> String {
        format!(
            "{}/v1_1/{}/resources/image/upload",
            self.base_url, self.credentials.cloud_name
        )
    }

    async fn send_delete(&self, query: &[(&str, String)]) -> Result<DeleteResponse, RemoteError> {
        let response = self
            .client
            .delete(self.resources_url())
            .basic_auth(
                &self.credentials.api_key,
                Some(&self.credentials.api_secret),
            )
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response).await?;
        response
            .json::<DeleteResponse>()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for CloudinaryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        local: &Path,
        id: &LogicalIdentifier,
        overwrite: bool,
    ) -> Result<UploadOutcome, RemoteError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|source| RemoteError::Io {
                path: local.display().to_string(),
                source,
            })?;

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let params = vec![
            ("invalidate", overwrite.to_string()),
            ("overwrite", overwrite.to_string()),
            ("public_id", id.as_str().to_string()),
            ("timestamp", timestamp),
        ];
        let signature = sign(&params, &self.credentials.api_secret);

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.jpg", id.base_name()));
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/jpeg")
            .map_err(transport)?;

        let mut form = Form::new()
            .part("file", part)
            .text("api_key", self.credentials.api_key.clone())
            .text("signature", signature)
            .text("signature_algorithm", "sha256");
        for (key, value) in params {
            form = form.text(key, value);
        }

        let response = self
            .client
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::CONFLICT && !overwrite {
            return Ok(UploadOutcome::AlreadyPresent);
        }

        let response = check_status(response).await?;
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        if body.existing && !overwrite {
            return Ok(UploadOutcome::AlreadyPresent);
        }

        Ok(UploadOutcome::Uploaded {
            remote_id: LogicalIdentifier::from_remote(body.public_id),
        })
    }

    async fn list_page(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, RemoteError> {
        let mut query = vec![
            ("prefix", prefix.to_string()),
            ("max_results", page_size.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("next_cursor", c.to_string()));
        }

        let response = self
            .client
            .get(self.resources_url())
            .basic_auth(
                &self.credentials.api_key,
                Some(&self.credentials.api_secret),
            )
            .query(&query)
            .send()
            .await
            .map_err(transport)?;

        let response = check_status(response).await?;
        let body: ResourceList = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        Ok(ListPage {
            assets: body
                .resources
                .into_iter()
                .map(|r| RemoteAsset {
                    id: LogicalIdentifier::from_remote(r.public_id),
                    bytes: r.bytes,
                })
                .collect(),
            next_cursor: body.next_cursor.filter(|c| !c.is_empty()),
        })
    }

    async fn delete_by_ids(&self, ids: &[LogicalIdentifier]) -> Result<u64, RemoteError> {
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let query: Vec<(&str, String)> = chunk
                .iter()
                .map(|id| ("public_ids[]", id.as_str().to_string()))
                .collect();
            deleted += self.send_delete(&query).await?.deleted_count();
        }
        Ok(deleted)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        let mut deleted = 0;
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_DELETE_ROUNDS {
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(ref c) = cursor {
                query.push(("next_cursor", c.clone()));
            }

            let body = self.send_delete(&query).await?;
            let round = body.deleted_count();
            deleted += round;

            let more = body.partial || body.next_cursor.is_some();
            if !more || (round == 0 && body.next_cursor.is_none()) {
                return Ok(deleted);
            }
            cursor = body.next_cursor;
        }

        Err(RemoteError::InvalidResponse(format!(
            "delete of prefix '{}' still partial after {} rounds",
            prefix, MAX_DELETE_ROUNDS
        )))
    }
}

// ============ Wire types ============

#[derive(Debug, Deserialize)]
struct UploadResponse {
    public_id: String,
    #[serde(default)]
    existing: bool,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    resources: Vec<Resource>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    public_id: String,
    bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    deleted: HashMap<String, String>,
    #[serde(default)]
    partial: bool,
    next_cursor: Option<String>,
}

impl DeleteResponse {
    fn deleted_count(&self) -> u64 {
        self.deleted.values().filter(|v| *v == "deleted").count() as u64
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

// ============ Helpers ============

/// Cloudinary request signature: `sha256(sorted "k=v" joined by '&' + secret)`.
fn sign(params: &[(&str, String)], secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let to_sign = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

/// Pass successful responses through; map everything else onto [`RemoteError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&raw)
        .map(|e| e.error.message)
        .unwrap_or(raw);

    Err(classify(status, message))
}

fn classify(status: StatusCode, message: String) -> RemoteError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::RateLimited {
            status: code,
            message,
        }
    } else if status.is_server_error() {
        RemoteError::Server {
            status: code,
            message,
        }
    } else {
        RemoteError::Client {
            status: code,
            message,
        }
    }
}
