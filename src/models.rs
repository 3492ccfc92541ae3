use crate::config::MAX_TAGS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use thiserror::Error;

/// A draft listing as submitted from the add-listing form or the import editor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListingDraft {
    pub name: String,
    pub price: PriceField,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: TagSet,
    pub images: Vec<ImageInput>,
    #[serde(default)]
    pub listing_type: ListingType,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ImageInput {
    /// Bytes picked from the local device, base64 encoded.
    Local { file_name: String, data: String },
    Remote(String),
}

impl ImageInput {
    pub fn label(&self) -> &str {
        match self {
            ImageInput::Local { file_name, .. } => file_name,
            ImageInput::Remote(url) => url,
        }
    }
}

/// Form inputs carry the price as text, enrichment produces a number.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PriceField {
    Amount(f64),
    Text(String),
}

impl PriceField {
    /// Non-negative finite amount, or `None` when the input is unusable.
    pub fn parse(&self) -> Option<f64> {
        let value = match self {
            PriceField::Amount(value) => *value,
            PriceField::Text(raw) => raw.trim().parse::<f64>().ok()?,
        };
        (value.is_finite() && value >= 0.0).then_some(value)
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, PriceField::Text(raw) if raw.trim().is_empty())
    }
}

impl Default for PriceField {
    fn default() -> Self {
        PriceField::Text(String::new())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    #[default]
    #[serde(alias = "regular")]
    Standard,
    #[serde(alias = "live")]
    TimeBoxed,
}

impl ListingType {
    pub fn table(&self) -> &'static str {
        match self {
            ListingType::Standard => "listings",
            ListingType::TimeBoxed => "livelistings",
        }
    }

    pub fn from_path(segment: &str) -> Option<Self> {
        match segment.trim().to_lowercase().as_str() {
            "standard" | "regular" | "listings" => Some(ListingType::Standard),
            "time_boxed" | "live" | "livelistings" => Some(ListingType::TimeBoxed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("max 5 tags allowed")]
    Full,
    #[error("tag already added")]
    Duplicate,
}

/// Unique, lowercase, at most [`MAX_TAGS`] entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagSet(Vec<String>);

impl TagSet {
    /// Returns `Ok(false)` when the input is blank after trimming.
    pub fn add(&mut self, raw: &str) -> Result<bool, TagError> {
        let clean = raw.trim().to_lowercase();
        if clean.is_empty() {
            return Ok(false);
        }
        if self.0.contains(&clean) {
            return Err(TagError::Duplicate);
        }
        if self.0.len() >= MAX_TAGS {
            return Err(TagError::Full);
        }
        self.0.push(clean);
        Ok(true)
    }

    pub fn remove_at(&mut self, idx: usize) -> Option<String> {
        (idx < self.0.len()).then(|| self.0.remove(idx))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Lossy: duplicates and overflow are dropped rather than rejected.
impl From<Vec<String>> for TagSet {
    fn from(values: Vec<String>) -> Self {
        let mut set = TagSet::default();
        for value in values {
            let _ = set.add(&value);
        }
        set
    }
}

impl From<TagSet> for Vec<String> {
    fn from(value: TagSet) -> Self {
        value.0
    }
}

/// Structured fields derived from a free-text caption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedFields {
    pub name: String,
    pub price: f64,
    pub currency: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl EnrichedFields {
    pub const UNTITLED: &'static str = "Untitled Item";

    pub fn fallback(caption: &str) -> Self {
        Self {
            name: Self::UNTITLED.to_string(),
            price: 0.0,
            currency: "USD".to_string(),
            description: caption.to_string(),
            tags: Vec::new(),
        }
    }
}

/// An item selected for import, before it becomes a draft.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceItem {
    /// Stable source identifier (the post URL for scraped items).
    pub id: String,
    pub images: Vec<String>,
    pub display_url: Option<String>,
    #[serde(default)]
    pub caption: String,
    pub fields: Option<EnrichedFields>,
}

impl SourceItem {
    /// Image list, or the single display image when the list is empty.
    pub fn display_images(&self) -> Vec<String> {
        if !self.images.is_empty() {
            return self.images.clone();
        }
        self.display_url.clone().into_iter().collect()
    }
}

/// Row written to the `listings` / `livelistings` tables.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    pub name: String,
    pub price: f64,
    pub seller: String,
    pub seller_id: String,
    pub images: Vec<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "timeRemaining")]
    pub time_remaining: Option<u64>,
}

/// Outcome of one persisted submission, with a per-stage transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingReceipt {
    pub table: String,
    pub images: Vec<String>,
    pub skipped_images: usize,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
