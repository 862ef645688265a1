//! Print requests and the load-test view of the API.

use serde::Deserialize;
use serde_json::Value;

use super::template_types::{PageOptions, RequestOptions, TemplateTypesFilter};
use super::{ApiClient, ApiError};
use crate::loadtest::{PrintApi, TemplateRef, UserId};

const PRINT_QUERY: &str = r#"
query PrintTemplateType($id: ID!, $userId: Int!, $fillData: JSON = {}) {
  printTemplateType(id: $id, userId: $userId, fillData: $fillData) {
    token
  }
}
"#;

/// Upper bound on active templates pulled into a load test.
const ACTIVE_TEMPLATE_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
struct PrintOutput {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrintData {
    print_template_type: Option<PrintOutput>,
}

impl ApiClient {
    /// Queue a print job; returns the token its completion event will carry.
    pub async fn print_template_type(
        &self,
        id: &str,
        user_id: UserId,
        fill_data: &Value,
    ) -> Result<String, ApiError> {
        let data: PrintData = self
            .execute(
                PRINT_QUERY,
                serde_json::json!({ "id": id, "userId": user_id.get(), "fillData": fill_data }),
            )
            .await?;
        data.print_template_type
            .and_then(|p| p.token)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::MissingData("printTemplateType.token"))
    }
}

#[async_trait::async_trait]
impl PrintApi for ApiClient {
    async fn active_templates(&self) -> Result<Vec<TemplateRef>, ApiError> {
        let options = RequestOptions {
            page: Some(PageOptions::first(ACTIVE_TEMPLATE_LIMIT)),
        };
        let page = self
            .find_template_types(&TemplateTypesFilter::active(), &options)
            .await?;
        if page.total > page.items.len() as u64 {
            tracing::warn!(
                total = page.total,
                loaded = page.items.len(),
                "not every active template was loaded"
            );
        }
        Ok(page
            .items
            .into_iter()
            .map(|t| TemplateRef::new(t.id, t.title))
            .collect())
    }

    async fn print(&self, template_id: &str, user_id: UserId) -> Result<String, ApiError> {
        self.print_template_type(template_id, user_id, &Value::Object(Default::default()))
            .await
    }
}
