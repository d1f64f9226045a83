//! HTTP client for the Visionary job API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Response envelope used by every JSON endpoint of the server.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Error raised by the API with its machine-readable code.
#[derive(Debug, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET and unwrap the `data` field of the envelope.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.get(&url), &url).await
    }

    /// POST a JSON body and unwrap the `data` field of the envelope.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    /// GET a body that is not wrapped in the envelope (health endpoints).
    ///
    /// Non-2xx health responses still carry a report, so they are returned too.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {} ({})", url, status))?;

        if status.is_success() && api_resp.success {
            return api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"));
        }

        Err(ApiError {
            status: status.as_u16(),
            code: api_resp.error_code.unwrap_or_else(|| "UNKNOWN".into()),
            message: api_resp.error.unwrap_or_else(|| "Unknown error".into()),
        }
        .into())
    }
}
