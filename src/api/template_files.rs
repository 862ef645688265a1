//! Template file uploads and edits.

use std::path::Path;

use reqwest::header::{HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::graphql::FileUpload;
use super::{ApiClient, ApiError};

const CREATE_MUTATION: &str = r#"
mutation CreateTemplateFile($file: Upload!, $data: CreateTemplateFileInput!) {
  createTemplateFile(file: $file, data: $data) {
    id
    templateType {
      id
    }
  }
}
"#;

const UPDATE_MUTATION: &str = r#"
mutation UpdateTemplateFile($id: ID!, $data: UpdateTemplateFileInput!) {
  updateTemplateFile(id: $id, data: $data) {
    id
    title
    updatedAt
  }
}
"#;

const REMOVE_MUTATION: &str = r#"
mutation RemoveTemplateFile($id: ID!) {
  removeTemplateFile(id: $id) {
    id
    templateType {
      id
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateFileInput {
    pub template_type_id: String,
    pub title: String,
    pub is_current_file_of_its_type: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTemplateFileInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_current_file_of_its_type: Option<bool>,
}

impl UpdateTemplateFileInput {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.is_current_file_of_its_type.is_none()
    }
}

/// A file mutation result: the file and the template type it belongs to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOwner {
    pub id: String,
    pub template_type: TypeId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedFile {
    pub id: String,
    pub title: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateData {
    create_template_file: FileOwner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateData {
    update_template_file: UpdatedFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveData {
    remove_template_file: FileOwner,
}

/// Stored bytes of a template file as served by `/print/raw/{id}`.
#[derive(Debug, Clone)]
pub struct RawFile {
    /// Name from `Content-Disposition`, reduced to its last path component.
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub fn raw_file_path(id: &str) -> String {
    format!("/print/raw/{id}")
}

/// `filename` parameter of a `Content-Disposition` header value.
fn disposition_file_name(value: &str) -> Option<String> {
    let raw = value.split(';').map(str::trim).find_map(|part| {
        let (key, val) = part.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("filename")
            .then(|| val.trim().trim_matches('"').to_string())
    })?;
    let name = Path::new(&raw).file_name()?.to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

impl ApiClient {
    /// Fetch the stored content of a template file.
    pub async fn download_template_file(&self, id: &str) -> Result<RawFile, ApiError> {
        let url = self.endpoint(&raw_file_path(id));
        tracing::debug!(%url, "GET");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await?,
            });
        }
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let file_name = header(CONTENT_DISPOSITION).and_then(|v| disposition_file_name(&v));
        let content_type = header(CONTENT_TYPE);
        let bytes = response.bytes().await?.to_vec();
        tracing::info!(file = %id, bytes = bytes.len(), "downloaded template file");
        Ok(RawFile {
            file_name,
            content_type,
            bytes,
        })
    }

    pub async fn create_template_file(
        &self,
        file: FileUpload,
        input: &CreateTemplateFileInput,
    ) -> Result<FileOwner, ApiError> {
        tracing::info!(
            file = %file.file_name,
            bytes = file.bytes.len(),
            template_type = %input.template_type_id,
            "uploading template file"
        );
        let data: CreateData = self
            .execute_upload(CREATE_MUTATION, serde_json::json!({ "data": input }), file)
            .await?;
        Ok(data.create_template_file)
    }

    pub async fn update_template_file(
        &self,
        id: &str,
        input: &UpdateTemplateFileInput,
    ) -> Result<UpdatedFile, ApiError> {
        let data: UpdateData = self
            .execute(
                UPDATE_MUTATION,
                serde_json::json!({ "id": id, "data": input }),
            )
            .await?;
        Ok(data.update_template_file)
    }

    pub async fn remove_template_file(&self, id: &str) -> Result<FileOwner, ApiError> {
        let data: RemoveData = self
            .execute(REMOVE_MUTATION, serde_json::json!({ "id": id }))
            .await?;
        Ok(data.remove_template_file)
    }
}
