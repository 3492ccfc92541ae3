//! In-memory stand-ins for every external collaborator.

use crate::llm::{CaptionEndpoint, CaptionError};
use crate::pipeline::{Collaborators, Pipeline};
use crate::rates::{RateError, RateSource};
use crate::scraper::{Post, PostSource, ScraperError};
use crate::session::SessionContext;
use crate::storage::{FetchError, ImageFetcher};
use crate::supabase::{AuthUser, Backend, Filter, Query, SupabaseError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

pub fn session_for(user_id: &str, email: Option<&str>) -> SessionContext {
    SessionContext {
        user_id: user_id.to_string(),
        email: email.map(str::to_string),
        access_token: format!("token-{user_id}"),
    }
}

pub fn pipeline_with(
    backend: Arc<InMemoryBackend>,
    fetcher: StubFetcher,
    captions: StubCaptionEndpoint,
) -> Pipeline {
    Pipeline::new(Collaborators {
        backend,
        fetcher: Arc::new(fetcher),
        posts: Arc::new(StubPostSource::with_posts(0)),
        captions: Arc::new(captions),
        rates: Arc::new(FixedRate::new(1.0)),
    })
}

#[derive(Default)]
pub struct InMemoryBackend {
    users: Mutex<HashMap<String, AuthUser>>,
    tables: Mutex<HashMap<String, Vec<Value>>>,
    objects: Mutex<Vec<(String, Vec<u8>)>>,
    fail_store: Mutex<Option<String>>,
    fail_inserts: AtomicBool,
    next_id: AtomicU64,
}

impl InMemoryBackend {
    pub fn add_user(&self, token: &str, id: &str, email: Option<&str>) {
        self.users.lock().unwrap().insert(
            token.to_string(),
            AuthUser {
                id: id.to_string(),
                email: email.map(str::to_string),
            },
        );
    }

    pub fn seed(&self, table: &str, row: Value) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// `bucket/path` of every stored object, in write order.
    pub fn stored_paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn stored_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(stored, _)| stored == path)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn fail_store_containing(&self, fragment: &str) {
        *self.fail_store.lock().unwrap() = Some(fragment.to_string());
    }

    pub fn fail_inserts(&self) {
        self.fail_inserts.store(true, Ordering::SeqCst);
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// `%` is the only wildcard the callers use.
fn ilike(value: &str, pattern: &str) -> bool {
    let value = value.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }
    let mut rest = value.as_str();
    for (idx, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if idx == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if idx == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

fn matches(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, expected) => row.get(column).map(text_of).as_deref() == Some(expected),
        Filter::ILike(column, pattern) => row
            .get(column)
            .and_then(Value::as_str)
            .is_some_and(|value| ilike(value, pattern)),
        Filter::Contains(column, wanted) => row
            .get(column)
            .and_then(Value::as_array)
            .is_some_and(|have| {
                wanted
                    .iter()
                    .all(|w| have.iter().any(|h| h.as_str() == Some(w.as_str())))
            }),
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn query(&self, query: &Query) -> Result<Vec<Value>, SupabaseError> {
        let mut rows: Vec<Value> = self
            .rows(&query.table)
            .into_iter()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .collect();
        if let Some((column, ascending)) = &query.order {
            rows.sort_by_key(|row| row.get(column).map(text_of).unwrap_or_default());
            if !ascending {
                rows.reverse();
            }
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<(), SupabaseError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(SupabaseError::Rejected {
                status: 500,
                body: "insert refused".into(),
            });
        }
        if let Some(obj) = row.as_object_mut()
            && !obj.contains_key("id")
        {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            obj.insert("id".into(), json!(id));
        }
        self.seed(table, row);
        Ok(())
    }

    async fn update(&self, query: &Query, changes: Value) -> Result<usize, SupabaseError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let mut updated = 0;
        for row in rows
            .iter_mut()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
        {
            if let (Some(target), Some(changes)) = (row.as_object_mut(), changes.as_object()) {
                for (column, value) in changes {
                    target.insert(column.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, query: &Query) -> Result<usize, SupabaseError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !query.filters.iter().all(|f| matches(row, f)));
        Ok(before - rows.len())
    }

    async fn store_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, SupabaseError> {
        if let Some(fragment) = self.fail_store.lock().unwrap().as_deref()
            && path.contains(fragment)
        {
            return Err(SupabaseError::Rejected {
                status: 500,
                body: "storage unavailable".into(),
            });
        }
        let key = format!("{bucket}/{path}");
        self.objects.lock().unwrap().push((key.clone(), bytes));
        Ok(format!("https://storage.test/{key}"))
    }

    async fn user_for_token(&self, access_token: &str) -> Result<AuthUser, SupabaseError> {
        self.users
            .lock()
            .unwrap()
            .get(access_token)
            .cloned()
            .ok_or(SupabaseError::Unauthorized)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), SupabaseError> {
        self.users.lock().unwrap().remove(access_token);
        Ok(())
    }
}

/// Serves a fixed body for known URLs and 404 for everything else.
#[derive(Default)]
pub struct StubFetcher {
    images: HashSet<String>,
    delay: Option<Duration>,
}

impl StubFetcher {
    pub fn with_image(mut self, url: &str) -> Self {
        self.images.insert(url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ImageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.images.contains(url) {
            Ok(format!("bytes of {url}").into_bytes())
        } else {
            Err(FetchError::Status(404))
        }
    }
}

pub struct StubCaptionEndpoint {
    reply: Option<String>,
    delay: Option<Duration>,
}

impl StubCaptionEndpoint {
    pub fn replying(body: &str) -> Self {
        Self {
            reply: Some(body.to_string()),
            delay: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl CaptionEndpoint for StubCaptionEndpoint {
    async fn parse(&self, _caption: &str) -> Result<String, CaptionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| CaptionError::Http("connection refused".into()))
    }
}

pub struct FixedRate(Option<f64>);

impl FixedRate {
    pub fn new(rate: f64) -> Self {
        Self(Some(rate))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl RateSource for FixedRate {
    async fn rate(&self, _from: &str, to: &str) -> Result<f64, RateError> {
        self.0
            .ok_or_else(|| RateError::Request(format!("no rate to {to}")))
    }
}

/// Always answers with its whole post list, whatever limit is asked for,
/// and records each requested limit.
pub struct StubPostSource {
    count: Mutex<usize>,
    limits: Mutex<Vec<usize>>,
    fail: bool,
}

impl StubPostSource {
    pub fn with_posts(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            limits: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_posts(0)
        }
    }

    pub fn set_posts(&self, count: usize) {
        *self.count.lock().unwrap() = count;
    }

    pub fn limits(&self) -> Vec<usize> {
        self.limits.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.limits.lock().unwrap().len()
    }
}

#[async_trait]
impl PostSource for StubPostSource {
    async fn fetch_posts(&self, _username: &str, limit: usize) -> Result<Vec<Post>, ScraperError> {
        self.limits.lock().unwrap().push(limit);
        if self.fail {
            return Err(ScraperError::Request("HTTP 502 Bad Gateway".into()));
        }
        let count = *self.count.lock().unwrap();
        Ok((1..=count)
            .map(|i| Post {
                url: format!("p{i}"),
                display_url: Some(format!("https://cdn/p{i}.jpg")),
                caption: Some(format!("caption {i}")),
                images: Vec::new(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ilike_wildcards() {
        assert!(ilike("Vintage Jacket", "%jacket%"));
        assert!(ilike("ThriftQueen", "thriftqueen"));
        assert!(!ilike("thriftqueen2", "thriftqueen"));
        assert!(ilike("denim jacket", "denim%"));
        assert!(!ilike("blue denim", "denim%"));
    }
}
