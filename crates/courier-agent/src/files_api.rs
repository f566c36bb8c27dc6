//! Provider Files API: upload inbound media once, reference it by file_id
//! in message content. Files expire server-side after ~24 h; expiry is
//! tracked locally in `user_files.expires_at`.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use courier_core::{CourierError, Result};

const API_VERSION: &str = "2023-06-01";
const FILES_BETA: &str = "files-api-2025-04-14";

pub struct FilesApiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    ttl_hours: u32,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
    #[serde(default)]
    size_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: String,
    pub size: i64,
    pub expires_at: DateTime<Utc>,
}

impl FilesApiClient {
    pub fn new(api_key: String, base_url: String, ttl_hours: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            ttl_hours,
        }
    }

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", FILES_BETA)
    }

    /// Upload bytes; returns the provider file id and the local expiry.
    pub async fn upload(&self, bytes: Vec<u8>, filename: &str, mime: &str) -> Result<UploadedFile> {
        let url = format!("{}/v1/files", self.base_url);
        let size = bytes.len() as i64;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| CourierError::Internal(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .headers(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| CourierError::ApiConnection(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, filename, "file upload failed");
            return Err(CourierError::Provider(format!(
                "file upload failed with status {status}"
            )));
        }

        let uploaded: FileUploadResponse = resp
            .json()
            .await
            .map_err(|e| CourierError::Provider(e.to_string()))?;

        debug!(file_id = %uploaded.id, size, mime, "file uploaded to provider");
        Ok(UploadedFile {
            file_id: uploaded.id,
            size: if uploaded.size_bytes > 0 {
                uploaded.size_bytes
            } else {
                size
            },
            expires_at: Utc::now() + Duration::hours(self.ttl_hours as i64),
        })
    }

    /// Download a previously uploaded file's content.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v1/files/{file_id}/content", self.base_url);
        let resp = self
            .headers(self.client.get(&url))
            .send()
            .await
            .map_err(|e| CourierError::ApiConnection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CourierError::Provider(format!(
                "file download failed with status {}",
                resp.status().as_u16()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CourierError::ApiConnection(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
