use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    /// Case-insensitive LIKE; `%` wildcards are passed through.
    ILike(String, String),
    /// Array column contains every listed value.
    Contains(String, Vec<String>),
}

impl Filter {
    fn to_param(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{value}")),
            Filter::ILike(column, pattern) => (column.clone(), format!("ilike.{pattern}")),
            Filter::Contains(column, values) => {
                let quoted = values
                    .iter()
                    .map(|v| format!("\"{}\"", v.replace('"', "\\\"")))
                    .collect::<Vec<_>>()
                    .join(",");
                (column.clone(), format!("cs.{{{quoted}}}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.filters.push(Filter::ILike(column.into(), pattern.into()));
        self
    }

    pub fn contains(mut self, column: &str, values: Vec<String>) -> Self {
        self.filters.push(Filter::Contains(column.into(), values));
        self
    }

    pub fn newest_first(mut self, column: &str) -> Self {
        self.order = Some((column.into(), false));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Row filters only, for writes.
    fn filter_params(&self) -> Vec<(String, String)> {
        self.filters.iter().map(Filter::to_param).collect()
    }

    fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(self.filters.iter().map(Filter::to_param));
        if let Some((column, ascending)) = &self.order {
            let dir = if *ascending { "asc" } else { "desc" };
            params.push(("order".into(), format!("{column}.{dir}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Data, auth and storage operations the pipeline needs from the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Vec<Value>, SupabaseError>;
    async fn insert(&self, table: &str, row: Value) -> Result<(), SupabaseError>;
    /// Merges `changes` into every matching row. Returns the number of updated rows.
    async fn update(&self, query: &Query, changes: Value) -> Result<usize, SupabaseError>;
    /// Returns the number of deleted rows.
    async fn delete(&self, query: &Query) -> Result<usize, SupabaseError>;
    /// Stores bytes at `bucket/path` and returns the public URL.
    async fn store_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SupabaseError>;
    async fn user_for_token(&self, access_token: &str) -> Result<AuthUser, SupabaseError>;
    async fn sign_out(&self, access_token: &str) -> Result<(), SupabaseError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key))
    }

    pub fn new(base_url: &str, service_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        }
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{path}",
            self.base_url
        )
    }

    fn with_service_auth(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(request: RequestBuilder) -> Result<Response, SupabaseError> {
        let response = request
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SupabaseError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Number of rows echoed back by a `return=representation` write.
    async fn affected(request: RequestBuilder) -> Result<usize, SupabaseError> {
        let rows: Vec<Value> = Self::send(request)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(rows.len())
    }
}

#[async_trait]
impl Backend for SupabaseClient {
    async fn query(&self, query: &Query) -> Result<Vec<Value>, SupabaseError> {
        let url = format!("{}/rest/v1/{}", self.base_url, query.table);
        let request = self.with_service_auth(self.http.get(url).query(&query.params()));
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/{table}", self.base_url);
        let request = self
            .with_service_auth(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(&Value::Array(vec![row]));
        Self::send(request).await?;
        Ok(())
    }

    async fn update(&self, query: &Query, changes: Value) -> Result<usize, SupabaseError> {
        let url = format!("{}/rest/v1/{}", self.base_url, query.table);
        let request = self
            .with_service_auth(self.http.patch(url).query(&query.filter_params()))
            .header("Prefer", "return=representation")
            .json(&changes);
        Self::affected(request).await
    }

    async fn delete(&self, query: &Query) -> Result<usize, SupabaseError> {
        let url = format!("{}/rest/v1/{}", self.base_url, query.table);
        let request = self
            .with_service_auth(self.http.delete(url).query(&query.filter_params()))
            .header("Prefer", "return=representation");
        Self::affected(request).await
    }

    async fn store_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SupabaseError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);
        let request = self
            .with_service_auth(self.http.post(url))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes);
        Self::send(request).await?;
        Ok(self.public_url(bucket, path))
    }

    async fn user_for_token(&self, access_token: &str) -> Result<AuthUser, SupabaseError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        let request = self
            .http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(access_token);
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), SupabaseError> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        let request = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .bearer_auth(access_token);
        Self::send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_follow_rest_syntax() {
        let query = Query::table("listings")
            .contains("tags", vec!["vintage".into()])
            .ilike("name", "%jacket%")
            .newest_first("created_at")
            .limit(20);
        assert_eq!(
            query.params(),
            vec![
                ("select".to_string(), "*".to_string()),
                ("tags".to_string(), "cs.{\"vintage\"}".to_string()),
                ("name".to_string(), "ilike.%jacket%".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn public_url_points_at_bucket() {
        let client = SupabaseClient::new("https://proj.supabase.co/", "key".into());
        assert_eq!(
            client.public_url("listing-images", "u1/1700000000000-0.webp"),
            "https://proj.supabase.co/storage/v1/object/public/listing-images/u1/1700000000000-0.webp"
        );
    }
}
