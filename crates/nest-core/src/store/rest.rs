//! REST Record Store - hosted Postgres behind a PostgREST-style API
//!
//! Features:
//! - `{url}/rest/v1/{table}` endpoints, `col=eq.value` filters
//! - Service key sent as `apikey` header and bearer token
//! - Conditional updates via an extra `version=eq.N` filter: an empty
//!   representation means the row moved on (or never existed)
//! - Unconditional updates read the current version first, then write
//!   the same way, retrying if another writer got in between

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;

use super::{row_id, row_version, value_text, Filter, RecordStore, Row, StoreError};

/// Remote store client
pub struct RestStore {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl RestStore {
    /// Create a client for `url` (project root, without `/rest/v1`)
    pub fn new(url: &str, service_key: &str) -> Result<Self, StoreError> {
        let base_url = url.trim().trim_end_matches('/').to_string();

        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(StoreError::Config(format!(
                "store URL must start with http:// or https:// (got '{}')",
                url
            )));
        }
        if service_key.trim().is_empty() {
            return Err(StoreError::Config("service key is empty".into()));
        }

        Ok(Self {
            base_url,
            service_key: service_key.trim().to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Filter conditions as query parameters
    fn filter_params(filter: &Filter) -> Vec<(String, String)> {
        filter
            .conditions()
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", value_text(value))))
            .collect()
    }

    /// Filter and body for a PATCH that lands only on `version`,
    /// moving the row to `version + 1`
    fn versioned_patch(id: &str, mut patch: Row, version: u64) -> (Filter, Row) {
        patch.remove("id");
        patch.remove("version");
        patch.insert("version".into(), Value::from(version + 1));
        (Filter::new().eq("id", id).eq("version", version), patch)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn rows(table: &str, resp: Response) -> Result<Vec<Row>, StoreError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                table: table.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<Vec<Row>>().await?)
    }
}

#[async_trait]
impl RecordStore for RestStore {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let mut params = Self::filter_params(filter);
        params.push(("select".into(), "*".into()));
        params.push(("order".into(), "id.asc".into()));

        let resp = self.request(Method::GET, table).query(&params).send().await?;
        Self::rows(table, resp).await
    }

    async fn fetch_one(&self, table: &str, filter: &Filter) -> Result<Option<Row>, StoreError> {
        let mut params = Self::filter_params(filter);
        params.push(("select".into(), "*".into()));
        params.push(("order".into(), "id.asc".into()));
        params.push(("limit".into(), "1".into()));

        let resp = self.request(Method::GET, table).query(&params).send().await?;
        Ok(Self::rows(table, resp).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        let id = row_id(&row).unwrap_or_else(|| "(new)".into());

        let resp = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;

        if resp.status().as_u16() == 409 {
            return Err(StoreError::Duplicate {
                table: table.to_string(),
                id,
            });
        }

        Self::rows(table, resp)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound {
                table: table.to_string(),
                id,
            })
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        patch: Row,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        let by_id = Filter::new().eq("id", id);
        let not_found = || StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        };

        loop {
            let version = match expected_version {
                Some(expected) => expected,
                None => row_version(&self.fetch_one(table, &by_id).await?.ok_or_else(not_found)?),
            };
            let (filter, body) = Self::versioned_patch(id, patch.clone(), version);

            let resp = self
                .request(Method::PATCH, table)
                .query(&Self::filter_params(&filter))
                .header("Prefer", "return=representation")
                .json(&body)
                .send()
                .await?;

            if let Some(row) = Self::rows(table, resp).await?.into_iter().next() {
                return Ok(row);
            }

            // Nothing matched: tell a moved version apart from a missing row
            match expected_version {
                Some(expected) if self.fetch_one(table, &by_id).await?.is_some() => {
                    return Err(StoreError::Conflict {
                        table: table.to_string(),
                        id: id.to_string(),
                        expected,
                    });
                }
                Some(_) => return Err(not_found()),
                None => tracing::debug!("{} {} changed during update, retrying", table, id),
            }
        }
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let resp = self
            .request(Method::DELETE, table)
            .query(&Self::filter_params(&Filter::new().eq("id", id)))
            .header("Prefer", "return=representation")
            .send()
            .await?;

        Ok(!Self::rows(table, resp).await?.is_empty())
    }
}
