use crate::config::SCRAPER_WEBHOOK_URL;
use crate::http::build_client;
use crate::images::deserialize_images;
use crate::models::SourceItem;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("scraper request failed: {0}")]
    Request(String),
    #[error("invalid scraper response: {0}")]
    Deserialize(String),
}

/// A social post as returned by the scraping webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub display_url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default, deserialize_with = "deserialize_images")]
    pub images: Vec<String>,
}

impl Post {
    /// Stable identity used for de-duplication across fetches.
    pub fn key(&self) -> &str {
        if self.url.is_empty() {
            self.display_url.as_deref().unwrap_or_default()
        } else {
            &self.url
        }
    }

    pub fn into_source_item(self) -> SourceItem {
        SourceItem {
            id: self.key().to_string(),
            images: self.images,
            display_url: self.display_url,
            caption: self.caption.unwrap_or_default(),
            fields: None,
        }
    }
}

/// Every shape the webhook has been seen to answer with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PostsResponse {
    List(Vec<Post>),
    Wrapped { data: Vec<Post> },
    Single(Post),
    Other(Value),
}

impl PostsResponse {
    pub fn into_posts(self) -> Vec<Post> {
        let posts = match self {
            PostsResponse::List(posts) | PostsResponse::Wrapped { data: posts } => posts,
            PostsResponse::Single(post) => vec![post],
            PostsResponse::Other(_) => Vec::new(),
        };
        posts
            .into_iter()
            .filter(|post| !post.key().is_empty())
            .collect()
    }
}

/// Paginated source that only supports "give me the newest N".
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn fetch_posts(&self, username: &str, limit: usize) -> Result<Vec<Post>, ScraperError>;
}

pub struct WebhookPostSource {
    http: Client,
    url: String,
}

impl WebhookPostSource {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            url: SCRAPER_WEBHOOK_URL.clone(),
        }
    }
}

#[async_trait]
impl PostSource for WebhookPostSource {
    async fn fetch_posts(&self, username: &str, limit: usize) -> Result<Vec<Post>, ScraperError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[("username", username), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|err| ScraperError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ScraperError::Request(format!("HTTP {}", response.status())));
        }
        let payload: PostsResponse = response
            .json()
            .await
            .map_err(|err| ScraperError::Deserialize(err.to_string()))?;
        let posts = payload.into_posts();
        debug!(target = "wayover.scraper", username, limit, received = posts.len(), "posts_fetched");
        Ok(posts)
    }
}
