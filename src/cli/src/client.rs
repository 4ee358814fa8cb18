//! HTTP client for communicating with the dsq server.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Success body of every JSON endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
}

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    code: String,
    numeric_code: u32,
    message: String,
}

/// A request the server rejected.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message} ({code} {numeric_code}, HTTP {status})")]
    Rejected {
        status: StatusCode,
        code: String,
        numeric_code: u32,
        message: String,
    },

    #[error("HTTP {status}: {body}")]
    Unexpected { status: StatusCode, body: String },

    #[error("server reported success without data")]
    MissingData,
}

/// HTTP client for the dsq API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            // Backfills run inside the request
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with query parameters and deserialize the response data.
    pub async fn get<T, Q>(&self, path: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = self.url(path);
        let request = self.client.get(&url).query(query);
        self.send(request, &url).await
    }

    /// POST a JSON body and deserialize the response data.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        let request = self.client.post(&url).json(body);
        self.send(request, &url).await
    }

    /// GET the full JSON body, whatever the status (for the health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<(StatusCode, serde_json::Value)> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        let body = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;
        Ok((status, body))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody { error }) => ApiError::Rejected {
                    status,
                    code: error.code,
                    numeric_code: error.numeric_code,
                    message: error.message,
                },
                Err(_) => ApiError::Unexpected { status, body },
            }
            .into());
        }

        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        match api_resp {
            ApiResponse {
                success: true,
                data: Some(data),
            } => Ok(data),
            _ => Err(ApiError::MissingData.into()),
        }
    }
}
