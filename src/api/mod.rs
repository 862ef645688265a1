//! Print service client -- GraphQL operations and plain HTTP endpoints.

pub mod graphql;
pub mod print;
pub mod template_files;
pub mod template_types;

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

pub use graphql::GraphQlError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("GraphQL error: {}", graphql::join_errors(.0))]
    GraphQl(Vec<GraphQlError>),

    #[error("response has no `{0}`")]
    MissingData(&'static str),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("cannot read {path}: {source}")]
    Upload {
        path: String,
        source: std::io::Error,
    },
}

/// Handle to one print service instance.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|e| ApiError::InvalidUrl(format!("{base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("printdesk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `path` must start with `/`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Where the rendered document for `token` can be downloaded.
    pub fn output_url(&self, token: &str) -> String {
        crate::loadtest::report::output_url(&self.base_url, token)
    }

    /// GET a JSON document from a non-GraphQL endpoint.
    pub async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(path);
        tracing::debug!(%url, "GET");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}
