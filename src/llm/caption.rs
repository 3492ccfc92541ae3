use crate::config::CAPTION_WEBHOOK_URL;
use crate::http::{build_client, request_timeout};
use crate::models::{EnrichedFields, TagSet};
use crate::rates::{RateSource, round_cents, usd_rate};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("http error: {0}")]
    Http(String),
    #[error("timed out")]
    Timeout,
    #[error("no json object in response")]
    NoJson,
    #[error("response has no usable name")]
    MissingName,
}

/// Text-extraction service that turns a caption into listing fields.
/// Returns the raw response body; shape handling happens in the bridge.
#[async_trait]
pub trait CaptionEndpoint: Send + Sync {
    async fn parse(&self, caption: &str) -> Result<String, CaptionError>;
}

pub struct WebhookCaptionEndpoint {
    http: Client,
    url: String,
}

impl WebhookCaptionEndpoint {
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            url: CAPTION_WEBHOOK_URL.clone(),
        }
    }
}

#[async_trait]
impl CaptionEndpoint for WebhookCaptionEndpoint {
    async fn parse(&self, caption: &str) -> Result<String, CaptionError> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({ "caption": caption }))
            .send()
            .await
            .map_err(|err| CaptionError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptionError::Http(format!("HTTP {}", response.status())));
        }
        response
            .text()
            .await
            .map_err(|err| CaptionError::Http(err.to_string()))
    }
}

pub struct CaptionBridge {
    endpoint: Arc<dyn CaptionEndpoint>,
    rates: Arc<dyn RateSource>,
    call_timeout: Duration,
}

impl CaptionBridge {
    pub fn new(endpoint: Arc<dyn CaptionEndpoint>, rates: Arc<dyn RateSource>) -> Self {
        Self {
            endpoint,
            rates,
            call_timeout: request_timeout(),
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Structured fields for `caption`. Never fails: any transport, parse or
    /// content problem yields [`EnrichedFields::fallback`].
    pub async fn enrich(&self, caption: &str) -> EnrichedFields {
        if caption.trim().is_empty() {
            return EnrichedFields::fallback(caption);
        }
        match self.try_enrich(caption).await {
            Ok(fields) => fields,
            Err(err) => {
                warn!(target = "wayover.caption", error = %err, "caption_fallback");
                EnrichedFields::fallback(caption)
            }
        }
    }

    async fn try_enrich(&self, caption: &str) -> Result<EnrichedFields, CaptionError> {
        let body = timeout(self.call_timeout, self.endpoint.parse(caption))
            .await
            .map_err(|_| CaptionError::Timeout)??;
        let mut fields = interpret_response(&body, caption)?;
        if !fields.currency.eq_ignore_ascii_case("USD")
            && let Some(rate) = usd_rate(self.rates.as_ref(), &fields.currency).await
        {
            debug!(target = "wayover.caption", currency = %fields.currency, rate, "price_converted");
            if fields.price > 0.0 {
                fields.price = round_cents(fields.price * rate);
            }
            fields.currency = "USD".into();
        }
        Ok(fields)
    }
}

/// Reads the service response, accepting a bare object, an object wrapped as
/// `{"success": true, "data": {...}}`, or either embedded in surrounding text.
pub fn interpret_response(body: &str, caption: &str) -> Result<EnrichedFields, CaptionError> {
    let value = match serde_json::from_str::<Value>(body.trim()) {
        Ok(value) if value.is_object() => value,
        _ => {
            let span = extract_json_object(body).ok_or(CaptionError::NoJson)?;
            serde_json::from_str::<Value>(span).map_err(|_| CaptionError::NoJson)?
        }
    };
    let value = match value.get("success").and_then(Value::as_bool) {
        Some(true) => value.get("data").cloned().unwrap_or(Value::Null),
        _ => value,
    };

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(CaptionError::MissingName)?;

    let price = match value.get("price") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(raw)) => leading_number(raw).unwrap_or(0.0),
        _ => 0.0,
    };
    let price = if price.is_finite() && price > 0.0 { price } else { 0.0 };

    let currency = value
        .get("currency")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "USD".into());

    let description = value
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(caption)
        .to_string();

    let tags = value
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(EnrichedFields {
        name: name.to_string(),
        price,
        currency,
        description,
        tags: TagSet::from(tags).into(),
    })
}

/// First balanced `{...}` span in `text`, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// Mirrors how price text like "150000 IDR" or "35.5" is read.
fn leading_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let end = trimmed
        .char_indices()
        .find(|(idx, ch)| !(ch.is_ascii_digit() || *ch == '.' || (*idx == 0 && *ch == '-')))
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse::<f64>().ok()
}
