//! GraphQL over HTTP: `{query, variables}` requests, `{data, errors}` responses,
//! and the multipart request variant used for file uploads.

use std::fmt;
use std::path::Path;

use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiClient, ApiError};

#[derive(Debug, Serialize)]
struct GraphQlRequest<'a, V> {
    query: &'a str,
    variables: V,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
        }
    }
}

impl fmt::Display for GraphQlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            return write!(f, "{}", self.message);
        }
        let path: Vec<String> = self
            .path
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        write!(f, "{} (at {})", self.message, path.join("."))
    }
}

pub(crate) fn join_errors(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A file attached to a multipart GraphQL request.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub async fn from_path(path: &Path) -> Result<Self, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::Upload {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_for(path).to_string();
        Ok(Self {
            file_name,
            mime,
            bytes,
        })
    }

    /// Replace the guessed content type with one the service declared.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }
}

/// Content type for the template formats the service renders.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("odt") => "application/vnd.oasis.opendocument.text",
        Some("ods") => "application/vnd.oasis.opendocument.spreadsheet",
        Some("html") | Some("htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

impl ApiClient {
    /// Run a query or mutation and decode its `data` member.
    pub async fn execute<V, T>(&self, query: &str, variables: V) -> Result<T, ApiError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.endpoint("/graphql"))
            .json(&GraphQlRequest { query, variables })
            .send()
            .await?;
        decode(response).await
    }

    /// Run a mutation whose `$file` variable is an upload.
    ///
    /// Follows the GraphQL multipart request layout: an `operations` part with
    /// `variables.file` set to null, a `map` part pointing file part `0` at it,
    /// then the file itself.
    pub async fn execute_upload<V, T>(
        &self,
        query: &str,
        variables: V,
        file: FileUpload,
    ) -> Result<T, ApiError>
    where
        V: Serialize,
        T: DeserializeOwned,
    {
        let form = upload_form(query, variables, file)?;
        let response = self
            .http
            .post(self.endpoint("/graphql"))
            .multipart(form)
            .send()
            .await?;
        decode(response).await
    }
}

fn upload_form<V: Serialize>(query: &str, variables: V, file: FileUpload) -> Result<Form, ApiError> {
    let mut variables = serde_json::to_value(variables)?;
    if let Value::Object(map) = &mut variables {
        map.insert("file".to_string(), Value::Null);
    }
    let operations = json!({ "query": query, "variables": variables });
    let map = json!({ "0": ["variables.file"] });

    let part = Part::bytes(file.bytes)
        .file_name(file.file_name)
        .mime_str(&file.mime)?;

    Ok(Form::new()
        .text("operations", operations.to_string())
        .text("map", map.to_string())
        .part("0", part))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    // Validation failures come back as 4xx with a regular error envelope.
    let envelope: Envelope<T> = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => return Err(ApiError::Decode(e)),
        Err(_) => {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            })
        }
    };

    if !envelope.errors.is_empty() {
        return Err(ApiError::GraphQl(envelope.errors));
    }
    envelope.data.ok_or(ApiError::MissingData("data"))
}
