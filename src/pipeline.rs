use crate::config::{LISTING_IMAGES_BUCKET, LIVE_LISTING_DURATION_SECS, MAX_IMAGES};
use crate::llm::{CaptionBridge, CaptionEndpoint, WebhookCaptionEndpoint};
use crate::models::{ListingDraft, ListingReceipt, SourceItem, StageReport};
use crate::rates::{FrankfurterRates, RateSource};
use crate::scraper::{Post, PostSource, WebhookPostSource};
use crate::session::SessionContext;
use crate::storage::{ImageFetcher, ImageStore, ProxyFetcher, StoreReport};
use crate::supabase::{Backend, SupabaseClient};
use crate::writer::{ListingWriter, WrittenListing, validate_listing};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Debug, Clone, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// External services the pipeline talks to.
pub struct Collaborators {
    pub backend: Arc<dyn Backend>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub posts: Arc<dyn PostSource>,
    pub captions: Arc<dyn CaptionEndpoint>,
    pub rates: Arc<dyn RateSource>,
}

impl Collaborators {
    /// HTTP-backed collaborators; `None` when the backend is not configured.
    pub fn from_env() -> Option<Self> {
        let backend = SupabaseClient::from_env()?;
        Some(Self {
            backend: Arc::new(backend),
            fetcher: Arc::new(ProxyFetcher::new()),
            posts: Arc::new(WebhookPostSource::from_env()),
            captions: Arc::new(WebhookCaptionEndpoint::from_env()),
            rates: Arc::new(FrankfurterRates::from_env()),
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub backend: Arc<dyn Backend>,
    pub posts: Arc<dyn PostSource>,
    captions: Arc<CaptionBridge>,
    images: Arc<ImageStore>,
    writer: Arc<ListingWriter>,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators) -> Self {
        let Collaborators {
            backend,
            fetcher,
            posts,
            captions,
            rates,
        } = collaborators;
        let images = ImageStore::new(backend.clone(), fetcher, LISTING_IMAGES_BUCKET.as_str());
        let writer = ListingWriter::new(backend.clone(), *LIVE_LISTING_DURATION_SECS);
        Self {
            backend,
            posts,
            captions: Arc::new(CaptionBridge::new(captions, rates)),
            images: Arc::new(images),
            writer: Arc::new(writer),
        }
    }

    #[cfg(test)]
    pub fn with_captions(mut self, captions: CaptionBridge) -> Self {
        self.captions = Arc::new(captions);
        self
    }

    /// Synchronous checks run before a job is accepted.
    pub fn preflight(draft: &ListingDraft) -> Result<(), PipelineError> {
        validate_listing(&draft.name, &draft.price, draft.images.len(), "validate")?;
        if draft.images.len() > *MAX_IMAGES {
            return Err(PipelineError::invalid_input("validate", "too_many_images"));
        }
        Ok(())
    }

    /// Stores the draft's images, then inserts the listing row.
    pub async fn run(
        &self,
        session: &SessionContext,
        draft: &ListingDraft,
    ) -> Result<ListingReceipt, PipelineError> {
        let mut stages = Vec::new();

        let stored = self
            .capture_stage("store_images", &mut stages, async {
                let report = self.images.store_all(&session.user_id, &draft.images).await;
                if report.urls.is_empty() {
                    return Err(PipelineError::internal(
                        "store_images",
                        format!("none of {} images could be stored", draft.images.len()),
                    ));
                }
                let output = json!({
                    "stored": report.urls.len(),
                    "skipped": report.skipped,
                });
                Ok(StageOutcome::new(report, output))
            })
            .await?;
        let StoreReport { urls, skipped } = stored;

        let written = self
            .capture_stage("write_listing", &mut stages, async {
                let written = self.writer.write(session, draft, urls).await?;
                let output = json!({
                    "table": written.table,
                    "seller": written.record.seller,
                    "images": written.record.images.len(),
                });
                Ok(StageOutcome::new(written, output))
            })
            .await?;
        let WrittenListing { table, record } = written;

        Ok(ListingReceipt {
            table: table.to_string(),
            images: record.images,
            skipped_images: skipped.len(),
            stages,
        })
    }

    /// Turns selected posts into enriched source items, one caption call per
    /// post, all in flight together. Output order follows input order.
    pub async fn enrich(&self, posts: Vec<Post>) -> Vec<SourceItem> {
        let mut set = JoinSet::new();
        for (idx, post) in posts.into_iter().enumerate() {
            let bridge = self.captions.clone();
            set.spawn(async move {
                let mut item = post.into_source_item();
                item.fields = Some(bridge.enrich(&item.caption).await);
                (idx, item)
            });
        }
        let mut enriched = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => enriched.push(pair),
                Err(err) => warn!(target = "wayover.caption", error = %err, "enrichment_task_failed"),
            }
        }
        enriched.sort_by_key(|(idx, _)| *idx);
        enriched.into_iter().map(|(_, item)| item).collect()
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageInput, ListingType, PriceField, TagSet};
    use crate::testing::{
        FixedRate, InMemoryBackend, StubCaptionEndpoint, StubFetcher, pipeline_with, session_for,
    };
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde_json::json;
    use std::time::Duration;

    fn local(name: &str) -> ImageInput {
        ImageInput::Local {
            file_name: name.into(),
            data: BASE64.encode(name.as_bytes()),
        }
    }

    fn jacket(images: Vec<ImageInput>) -> ListingDraft {
        ListingDraft {
            name: "vintage jacket".into(),
            price: PriceField::Text("35".into()),
            description: String::new(),
            tags: TagSet::default(),
            images,
            listing_type: ListingType::Standard,
        }
    }

    #[tokio::test]
    async fn three_local_images_make_one_standard_row() {
        let backend = Arc::new(InMemoryBackend::default());
        let pipeline = pipeline_with(backend.clone(), StubFetcher::default(), StubCaptionEndpoint::failing());
        let draft = jacket(vec![local("a.jpg"), local("b.jpg"), local("c.jpg")]);

        let receipt = pipeline.run(&session_for("u1", Some("sam@example.com")), &draft).await.unwrap();

        assert_eq!(receipt.table, "listings");
        assert_eq!(receipt.images.len(), 3);
        let names: Vec<&str> = receipt.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["store_images", "write_listing"]);

        let paths = backend.stored_paths();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.starts_with("listing-images/u1/")));
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), 3);

        let rows = backend.rows("listings");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["price"], json!(35.0));
        assert_eq!(rows[0]["images"].as_array().unwrap().len(), 3);
        assert!(rows[0].get("timeRemaining").is_none());
    }

    #[tokio::test]
    async fn all_images_failing_fails_the_run() {
        let backend = Arc::new(InMemoryBackend::default());
        let pipeline = pipeline_with(backend.clone(), StubFetcher::default(), StubCaptionEndpoint::failing());
        let draft = jacket(vec![ImageInput::Remote("https://gone/1.jpg".into())]);

        let err = pipeline.run(&session_for("u1", None), &draft).await.unwrap_err();
        assert_eq!(err.stage(), "store_images");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert!(backend.rows("listings").is_empty());
    }

    #[tokio::test]
    async fn partial_image_failure_still_writes() {
        let backend = Arc::new(InMemoryBackend::default());
        let fetcher = StubFetcher::default().with_image("https://ok/1.jpg");
        let pipeline = pipeline_with(backend.clone(), fetcher, StubCaptionEndpoint::failing());
        let draft = jacket(vec![
            ImageInput::Remote("https://gone/0.jpg".into()),
            ImageInput::Remote("https://ok/1.jpg".into()),
        ]);
        let receipt = pipeline.run(&session_for("u1", None), &draft).await.unwrap();
        assert_eq!(receipt.images.len(), 1);
        assert_eq!(receipt.skipped_images, 1);
    }

    #[test]
    fn preflight_rejects_before_any_work() {
        let mut draft = jacket(vec![]);
        assert_eq!(
            Pipeline::preflight(&draft).unwrap_err().kind(),
            PipelineErrorKind::InvalidInput
        );
        draft.images = vec![local("a.jpg")];
        draft.name = "  ".into();
        assert!(Pipeline::preflight(&draft).is_err());
        draft.name = "tee".into();
        assert!(Pipeline::preflight(&draft).is_ok());
        draft.images = (0..11).map(|i| local(&format!("{i}.jpg"))).collect();
        assert_eq!(Pipeline::preflight(&draft).unwrap_err().detail(), "too_many_images");
    }

    #[tokio::test]
    async fn enrich_keeps_order_and_degrades_on_timeout() {
        let backend = Arc::new(InMemoryBackend::default());
        let endpoint = StubCaptionEndpoint::replying(r#"{"name":"late"}"#)
            .with_delay(Duration::from_secs(30));
        let captions = CaptionBridge::new(Arc::new(endpoint), Arc::new(FixedRate::new(1.0)))
            .with_timeout(Duration::from_millis(20));
        let pipeline = pipeline_with(backend, StubFetcher::default(), StubCaptionEndpoint::failing())
            .with_captions(captions);
        let posts = vec![
            Post {
                url: "https://ig/p/1".into(),
                caption: Some("first".into()),
                ..Post::default()
            },
            Post {
                url: "https://ig/p/2".into(),
                caption: Some("second".into()),
                images: vec!["https://cdn/2.jpg".into()],
                ..Post::default()
            },
        ];

        let items = pipeline.enrich(posts).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "https://ig/p/1");
        let fields = items[1].fields.as_ref().unwrap();
        assert_eq!(fields.name, "Untitled Item");
        assert_eq!(fields.price, 0.0);
        assert_eq!(fields.currency, "USD");
        assert!(fields.tags.is_empty());
        assert_eq!(fields.description, "second");
    }
}
