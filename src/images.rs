use crate::config::IMAGE_PROXY_URL;
use serde::Deserialize;
use serde_json::Value;

/// Canonical list of image URLs from any stored representation.
///
/// Rows written before images were stored as arrays carry a JSON-encoded
/// string, and some sources hand over a bare URL. All of them land here:
///
/// - a list is returned in order (non-string entries are skipped)
/// - a string holding JSON is parsed; a parsed list is returned, a parsed
///   scalar becomes a one-element list
/// - any other string is treated as a single literal URL
/// - null, a blank string and every other type produce an empty list
pub fn normalize_images(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => strings_of(items),
        Value::String(raw) if raw.trim().is_empty() => Vec::new(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => strings_of(&items),
            Ok(Value::String(single)) => vec![single],
            Ok(Value::Null) => Vec::new(),
            Ok(_) | Err(_) => vec![raw.clone()],
        },
        _ => Vec::new(),
    }
}

fn strings_of(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}

/// Serde adapter for row fields that hold images in either representation.
pub fn deserialize_images<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_images(&value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    Thumbnail,
    Card,
}

impl ImageSize {
    pub fn width(&self) -> u32 {
        match self {
            ImageSize::Thumbnail => 150,
            ImageSize::Card => 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Option<&'static str>,
    pub quality: u8,
    pub format: &'static str,
}

impl ProxyOptions {
    pub fn sized(size: ImageSize) -> Self {
        Self {
            width: Some(size.width()),
            ..Self::transfer()
        }
    }

    /// Full-size re-encode used before storing a remote image.
    pub fn transfer() -> Self {
        Self {
            width: None,
            height: None,
            fit: None,
            quality: 80,
            format: "webp",
        }
    }
}

/// Rewrite a source URL through the resize/format-conversion proxy.
///
/// Local preview handles and generated avatars are returned untouched.
pub fn proxy_url(url: &str, options: &ProxyOptions) -> String {
    if url.is_empty() || url.starts_with("blob:") || url.contains("dicebear") {
        return url.to_string();
    }
    let mut out = format!("{}?url={}", IMAGE_PROXY_URL.as_str(), urlencoding::encode(url));
    if let Some(width) = options.width {
        out.push_str(&format!("&w={width}"));
    }
    if let Some(height) = options.height {
        out.push_str(&format!("&h={height}"));
    }
    if let Some(fit) = options.fit {
        out.push_str(&format!("&fit={fit}"));
    }
    out.push_str(&format!("&q={}&output={}", options.quality, options.format));
    out
}

/// Tiny blurred variant for progressive loading.
pub fn placeholder_url(url: &str) -> String {
    if url.is_empty() || url.starts_with("blob:") || url.contains("dicebear") {
        return url.to_string();
    }
    format!(
        "{}?url={}&w=20&q=30&blur=10",
        IMAGE_PROXY_URL.as_str(),
        urlencoding::encode(url)
    )
}
