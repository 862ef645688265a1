//! Template type queries and mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ApiClient, ApiError};

pub const DEFAULT_PAGE_SIZE: u32 = 10;

const FIND_QUERY: &str = r#"
query FindTemplateTypes(
  $filter: TemplateTypesFilter = {}
  $options: TemplateTypesRequestOptions = {}
) {
  templateTypes(filter: $filter, options: $options) {
    total
    items {
      id
      owner
      title
      active
      currentFile {
        id
        title
      }
    }
  }
}
"#;

const GET_QUERY: &str = r#"
query GetTemplateType($id: ID!) {
  templateType(id: $id) {
    id
    owner
    title
    active
    pageOfFiles {
      total
      items {
        id
        title
        mimeType
        isCurrentFileOfItsType
        updatedAt
      }
    }
  }
}
"#;

const CREATE_MUTATION: &str = r#"
mutation CreateTemplateType($data: CreateTemplateTypeInput!) {
  createTemplateType(data: $data) {
    id
  }
}
"#;

const UPDATE_MUTATION: &str = r#"
mutation UpdateTemplateType($id: ID!, $data: UpdateTemplateTypeInput!) {
  updateTemplateType(id: $id, data: $data) {
    id
  }
}
"#;

const REMOVE_MUTATION: &str = r#"
mutation RemoveTemplateType($id: ID!) {
  removeTemplateType(id: $id) {
    id
  }
}
"#;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTypesFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common: Option<CommonFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owners: Option<Vec<String>>,
}

impl TemplateTypesFilter {
    /// Only templates flagged active, which is also the list default.
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommonFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<PageOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageOptions {
    pub limit: u32,
    pub offset: u32,
}

impl PageOptions {
    /// 1-based page number to limit/offset; `None` when the offset overflows.
    pub fn page(number: u32, size: u32) -> Option<Self> {
        let offset = number.saturating_sub(1).checked_mul(size)?;
        Some(Self {
            limit: size,
            offset,
        })
    }

    /// First page of the given size.
    pub fn first(size: u32) -> Self {
        Self {
            limit: size,
            offset: 0,
        }
    }

    /// 1-based page number this window starts on.
    pub fn number(&self) -> u32 {
        if self.limit == 0 {
            return 1;
        }
        self.offset / self.limit + 1
    }
}

impl Default for PageOptions {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTemplateTypeInput {
    pub owner: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateTemplateTypeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl UpdateTemplateTypeInput {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.active.is_none()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Page<T> {
    pub total: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn page_count(&self, size: u32) -> u64 {
        if size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(size))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FileRef {
    pub id: String,
    pub title: String,
}

/// Row of the template type list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateTypeSummary {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub active: bool,
    pub current_file: Option<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFileInfo {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    pub is_current_file_of_its_type: bool,
    pub updated_at: DateTime<Utc>,
}

/// Full template type card.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateType {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub active: bool,
    pub page_of_files: Page<TemplateFileInfo>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActivationError {
    #[error("template type {0} has no current file; mark one of its files as current first")]
    NoCurrentFile(String),
}

impl TemplateType {
    pub fn current_file(&self) -> Option<&TemplateFileInfo> {
        self.page_of_files
            .items
            .iter()
            .find(|f| f.is_current_file_of_its_type)
    }

    /// A template can only be printed, and so only activated, with a current file.
    pub fn can_activate(&self) -> Result<(), ActivationError> {
        match self.current_file() {
            Some(_) => Ok(()),
            None => Err(ActivationError::NoCurrentFile(self.id.clone())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Id {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindData {
    template_types: Page<TemplateTypeSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetData {
    template_type: Option<TemplateType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateData {
    create_template_type: Id,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateData {
    update_template_type: Id,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveData {
    remove_template_type: Id,
}

impl ApiClient {
    pub async fn find_template_types(
        &self,
        filter: &TemplateTypesFilter,
        options: &RequestOptions,
    ) -> Result<Page<TemplateTypeSummary>, ApiError> {
        let data: FindData = self
            .execute(
                FIND_QUERY,
                serde_json::json!({ "filter": filter, "options": options }),
            )
            .await?;
        Ok(data.template_types)
    }

    /// `Ok(None)` when no template type has this id.
    pub async fn template_type(&self, id: &str) -> Result<Option<TemplateType>, ApiError> {
        let data: GetData = self
            .execute(GET_QUERY, serde_json::json!({ "id": id }))
            .await?;
        Ok(data.template_type)
    }

    /// Returns the new id.
    pub async fn create_template_type(
        &self,
        input: &CreateTemplateTypeInput,
    ) -> Result<String, ApiError> {
        let data: CreateData = self
            .execute(CREATE_MUTATION, serde_json::json!({ "data": input }))
            .await?;
        Ok(data.create_template_type.id)
    }

    pub async fn update_template_type(
        &self,
        id: &str,
        input: &UpdateTemplateTypeInput,
    ) -> Result<String, ApiError> {
        let data: UpdateData = self
            .execute(
                UPDATE_MUTATION,
                serde_json::json!({ "id": id, "data": input }),
            )
            .await?;
        Ok(data.update_template_type.id)
    }

    pub async fn remove_template_type(&self, id: &str) -> Result<String, ApiError> {
        let data: RemoveData = self
            .execute(REMOVE_MUTATION, serde_json::json!({ "id": id }))
            .await?;
        Ok(data.remove_template_type.id)
    }
}
