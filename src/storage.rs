use crate::http::{build_client, request_timeout};
use crate::images::{ProxyOptions, proxy_url};
use crate::models::ImageInput;
use crate::supabase::Backend;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::{Rng, distr::Alphanumeric};
use reqwest::Client;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("source answered HTTP {0}")]
    Status(u16),
}

/// Retrieves image bytes from a remote source.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches through the resize proxy so every stored image is a re-encoded webp.
pub struct ProxyFetcher {
    http: Client,
}

impl ProxyFetcher {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

#[async_trait]
impl ImageFetcher for ProxyFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let target = proxy_url(url, &ProxyOptions::transfer());
        let response = self
            .http
            .get(target)
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreReport {
    /// Public URLs in input order; skipped inputs leave no gap.
    pub urls: Vec<String>,
    pub skipped: Vec<SkippedImage>,
}

pub struct ImageStore {
    backend: Arc<dyn Backend>,
    fetcher: Arc<dyn ImageFetcher>,
    bucket: String,
    call_timeout: Duration,
}

impl ImageStore {
    pub fn new(backend: Arc<dyn Backend>, fetcher: Arc<dyn ImageFetcher>, bucket: &str) -> Self {
        Self {
            backend,
            fetcher,
            bucket: bucket.to_string(),
            call_timeout: request_timeout(),
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Stores every input under `owner/`, one at a time and in order.
    ///
    /// A failing image is recorded in `skipped` and never aborts the rest.
    pub async fn store_all(&self, owner: &str, inputs: &[ImageInput]) -> StoreReport {
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut report = StoreReport::default();
        for (seq, input) in inputs.iter().enumerate() {
            match self.store_one(owner, stamp, seq, input).await {
                Ok(url) => report.urls.push(url),
                Err(reason) => {
                    warn!(
                        target = "wayover.storage",
                        owner = owner,
                        source = %short_label(input.label()),
                        reason = %reason,
                        "image_skipped"
                    );
                    report.skipped.push(SkippedImage {
                        source: input.label().to_string(),
                        reason,
                    });
                }
            }
        }
        report
    }

    async fn store_one(
        &self,
        owner: &str,
        stamp: i64,
        seq: usize,
        input: &ImageInput,
    ) -> Result<String, String> {
        let (bytes, ext) = match input {
            ImageInput::Local { file_name, data } => {
                let bytes = decode_local(data).ok_or_else(|| "invalid base64 payload".to_string())?;
                (bytes, extension_of(file_name))
            }
            ImageInput::Remote(url) => {
                let bytes = timeout(self.call_timeout, self.fetcher.fetch(url))
                    .await
                    .map_err(|_| "fetch timed out".to_string())?
                    .map_err(|err| err.to_string())?;
                (bytes, "webp".to_string())
            }
        };
        if bytes.is_empty() {
            return Err("empty image body".into());
        }

        let path = object_path(owner, stamp, seq, &ext);
        let url = timeout(
            self.call_timeout,
            self.backend
                .store_object(&self.bucket, &path, bytes, content_type_for(&ext)),
        )
        .await
        .map_err(|_| "storage write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        debug!(target = "wayover.storage", path = %path, "image_stored");
        Ok(url)
    }
}

/// `<owner>/<millis>-<seq>-<random>.<ext>`; the random suffix keeps two jobs
/// started in the same millisecond apart.
pub fn object_path(owner: &str, stamp: i64, seq: usize, ext: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("{owner}/{stamp}-{seq}-{suffix}.{ext}")
}

pub(crate) fn decode_local(data: &str) -> Option<Vec<u8>> {
    // Accept data URLs as produced by browser file readers.
    let payload = match data.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => data,
    };
    BASE64.decode(payload.trim()).ok()
}

pub(crate) fn extension_of(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| "jpg".into())
}

pub(crate) fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "image/jpeg",
    }
}

fn short_label(label: &str) -> &str {
    match label.char_indices().nth(80) {
        Some((idx, _)) => &label[..idx],
        None => label,
    }
}
