mod catalog;
mod config;
mod deck;
mod editor;
mod http;
mod idempotency;
mod images;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod prefetch;
mod profile;
mod rates;
mod scraper;
mod security;
mod session;
mod storage;
mod supabase;
#[cfg(test)]
mod testing;
mod writer;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use catalog::{BrowseFilter, Catalog, Listing, SellerListings};
use config::{AVATARS_BUCKET, IMPORT_BATCH_SIZE, IMPORT_PAGE_SIZE};
use deck::{DeckCard, SwipeDeck, next_index};
use editor::{EditorError, EditorView, FieldUpdate, ImportEditor};
use eyre::eyre;
use idempotency::{Claim, IdempotencyStore};
use jobs::{DismissError, JobCounts, JobInfo, JobQueue};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ListingDraft, ListingType};
use pipeline::{Collaborators, Pipeline, PipelineError, PipelineErrorKind};
use prefetch::{PageOutcome, PrefetchBuffer};
use profile::{Profile, ProfileError, ProfileStore, ProfileUpdate, SavedProfile};
use scraper::{Post, ScraperError};
use security::{AuthState, require_session};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::SessionContext;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use supabase::SupabaseError;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "wayover.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let collaborators = Collaborators::from_env()
        .ok_or_else(|| eyre!("SUPABASE_URL and a Supabase key must be set"))?;
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    crate::metrics::describe();
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());
    let state = AppState::new(Pipeline::new(collaborators), prometheus_handle, redis);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "wayover.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: JobQueue,
    auth: AuthState,
    catalog: Catalog,
    imports: Arc<Mutex<HashMap<String, Arc<Mutex<PrefetchBuffer>>>>>,
    editors: Arc<Mutex<HashMap<String, ImportEditor>>>,
    deck: Arc<RwLock<Option<Arc<SwipeDeck>>>>,
    idempotency: IdempotencyStore,
    profiles: ProfileStore,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    fn new(
        pipeline: Pipeline,
        prometheus_handle: PrometheusHandle,
        redis: Option<redis::Client>,
    ) -> Self {
        Self {
            queue: JobQueue::new(pipeline.clone()),
            auth: AuthState::new(pipeline.backend.clone()),
            catalog: Catalog::new(pipeline.backend.clone()),
            imports: Arc::new(Mutex::new(HashMap::new())),
            editors: Arc::new(Mutex::new(HashMap::new())),
            deck: Arc::new(RwLock::new(None)),
            idempotency: IdempotencyStore::from_env(redis),
            profiles: ProfileStore::new(pipeline.backend.clone(), AVATARS_BUCKET.as_str()),
            prometheus_handle,
            pipeline,
        }
    }
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/session/sign-out", post(sign_out))
        .route("/profile", get(get_profile).put(save_profile))
        .route("/listings", post(create_listing))
        .route("/listings/{kind}/{id}", delete(delete_listing))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(dismiss_job))
        .nest(
            "/imports",
            Router::new()
                .route("/posts", post(import_posts))
                .route("/enrich", post(enrich_posts))
                .route("/editor", get(get_editor).patch(update_editor))
                .route("/editor/tags", post(add_editor_tag))
                .route("/editor/tags/{idx}", delete(remove_editor_tag))
                .route("/editor/images/{idx}", delete(remove_editor_image))
                .route("/editor/next", post(submit_editor_item)),
        )
        .route("/deck", get(deck_cards))
        .route("/browse", get(browse))
        .route("/sellers/{username}/listings", get(seller_listings))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_session,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "wayover-api-rs",
    }))
}

// Local images travel base64 encoded inside the JSON body.
fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16 * 1024 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

async fn sign_out(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> StatusCode {
    crate::metrics::inc_requests("/session/sign-out");
    state
        .auth
        .sessions
        .invalidate(state.auth.backend.as_ref(), &session)
        .await;
    state.imports.lock().await.remove(&session.user_id);
    state.editors.lock().await.remove(&session.user_id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    replayed: bool,
}

/// Queue a listing for background upload.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Body: `ListingDraft`
/// - Response: `202` with the job id; a repeated `Idempotency-Key` answers
///   `200` with the job created the first time.
async fn create_listing(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(draft): Json<ListingDraft>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    crate::metrics::inc_requests("/listings");

    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|raw| format!("idem:{}:{raw}", session.user_id));

    if let Some(key) = &key {
        match state.idempotency.claim(key).await {
            Claim::Existing(job_id) => {
                info!(target = "wayover.api", %job_id, "idempotent_replay");
                return Ok((
                    StatusCode::OK,
                    Json(SubmitResponse {
                        job_id,
                        replayed: true,
                    }),
                ));
            }
            Claim::Pending => return Err(AppError::Conflict("submission_in_progress")),
            Claim::Fresh => {}
        }
    }

    match state.queue.submit(session, draft) {
        Ok(job_id) => {
            if let Some(key) = &key {
                state.idempotency.complete(key, job_id).await;
            }
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    job_id,
                    replayed: false,
                }),
            ))
        }
        Err(err) => {
            if let Some(key) = &key {
                state.idempotency.release(key).await;
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    counts: JobCounts,
    jobs: Vec<JobInfo>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Json<JobsResponse> {
    Json(JobsResponse {
        counts: state.queue.counts(&session.user_id),
        jobs: state.queue.list(&session.user_id),
    })
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::Pipeline(PipelineError::invalid_input("jobs", "invalid_job_id")))
}

async fn get_job(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .get(id)
        .filter(|job| job.owner_id == session.user_id)
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

async fn dismiss_job(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.queue.dismiss(&session.user_id, id)?))
}

#[derive(Debug, Deserialize)]
struct ImportPostsRequest {
    username: String,
    #[serde(default)]
    fresh: bool,
}

#[derive(Debug, Serialize)]
struct PostsPage {
    #[serde(flatten)]
    outcome: PageOutcome,
    shown: usize,
}

/// Next page of a user's posts, served from the look-ahead buffer when possible.
async fn import_posts(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(req): Json<ImportPostsRequest>,
) -> Result<Json<PostsPage>, AppError> {
    crate::metrics::inc_requests("/imports/posts");
    let username = req.username.trim().trim_start_matches('@').to_string();
    if username.is_empty() {
        return Err(AppError::BadRequest("username is required"));
    }

    let buffer = state
        .imports
        .lock()
        .await
        .entry(session.user_id.clone())
        .or_insert_with(|| {
            Arc::new(Mutex::new(PrefetchBuffer::new(&username, *IMPORT_BATCH_SIZE)))
        })
        .clone();
    let mut buffer = buffer.lock().await;
    if req.fresh || buffer.subject() != username {
        buffer.restart(&username);
    }
    let outcome = buffer
        .request_more(state.pipeline.posts.as_ref(), *IMPORT_PAGE_SIZE)
        .await?;
    Ok(Json(PostsPage {
        outcome,
        shown: buffer.shown().len(),
    }))
}

#[derive(Debug, Deserialize)]
struct EnrichRequest {
    posts: Vec<Post>,
}

/// Enriches the selected posts and opens them in the caller's import editor.
async fn enrich_posts(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(req): Json<EnrichRequest>,
) -> Result<Json<EditorView>, AppError> {
    crate::metrics::inc_requests("/imports/enrich");
    if req.posts.is_empty() {
        return Err(AppError::BadRequest("select at least one post"));
    }
    let items = state.pipeline.enrich(req.posts).await;
    let editor = ImportEditor::new(items);
    let view = editor.view().ok_or(EditorError::NoItem)?;
    state.editors.lock().await.insert(session.user_id, editor);
    Ok(Json(view))
}

async fn get_editor(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<EditorView>, AppError> {
    edit(&state, &session, |_| Ok(())).await
}

async fn update_editor(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(update): Json<FieldUpdate>,
) -> Result<Json<EditorView>, AppError> {
    edit(&state, &session, |editor| editor.update(update)).await
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    tag: String,
}

async fn add_editor_tag(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(req): Json<TagRequest>,
) -> Result<Json<EditorView>, AppError> {
    edit(&state, &session, |editor| editor.add_tag(&req.tag).map(|_| ())).await
}

async fn remove_editor_tag(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(idx): Path<usize>,
) -> Result<Json<EditorView>, AppError> {
    edit(&state, &session, |editor| editor.remove_tag(idx)).await
}

async fn remove_editor_image(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(idx): Path<usize>,
) -> Result<Json<EditorView>, AppError> {
    edit(&state, &session, |editor| editor.remove_image(idx)).await
}

async fn edit<F>(
    state: &AppState,
    session: &SessionContext,
    change: F,
) -> Result<Json<EditorView>, AppError>
where
    F: FnOnce(&mut ImportEditor) -> Result<(), EditorError>,
{
    let mut editors = state.editors.lock().await;
    let editor = editors
        .get_mut(&session.user_id)
        .ok_or(EditorError::NoItem)?;
    change(editor)?;
    Ok(Json(editor.view().ok_or(EditorError::NoItem)?))
}

#[derive(Debug, Deserialize)]
struct NextRequest {
    #[serde(default)]
    listing_type: ListingType,
}

#[derive(Debug, Serialize)]
struct NextResponse {
    job_id: Uuid,
    finished: bool,
    next: Option<EditorView>,
}

/// Queues the current import item and moves the editor forward.
async fn submit_editor_item(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(req): Json<NextRequest>,
) -> Result<Json<NextResponse>, AppError> {
    crate::metrics::inc_requests("/imports/editor/next");
    let mut editors = state.editors.lock().await;
    let editor = editors
        .get_mut(&session.user_id)
        .ok_or(EditorError::NoItem)?;
    let draft = editor.draft(req.listing_type)?;
    let job_id = state.queue.submit(session.clone(), draft)?;
    let finished = editor.advance();
    let next = editor.view();
    if finished {
        editors.remove(&session.user_id);
    }
    Ok(Json(NextResponse {
        job_id,
        finished,
        next,
    }))
}

#[derive(Debug, Deserialize)]
struct DeckQuery {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct DeckResponse {
    index: u64,
    next_index: u64,
    total: usize,
    seller: Option<String>,
    cards: Vec<DeckCard>,
}

async fn deck_cards(
    State(state): State<AppState>,
    Query(query): Query<DeckQuery>,
) -> Result<Json<DeckResponse>, AppError> {
    crate::metrics::inc_requests("/deck");
    let cached = state.deck.read().await.clone();
    let deck = match cached {
        Some(deck) if !query.refresh => deck,
        _ => {
            let fresh = Arc::new(SwipeDeck::load(state.pipeline.backend.as_ref()).await?);
            *state.deck.write().await = Some(fresh.clone());
            fresh
        }
    };
    Ok(Json(DeckResponse {
        index: query.index,
        next_index: next_index(query.index),
        total: deck.len(),
        seller: deck.top_seller(query.index).map(str::to_string),
        cards: deck.visible(query.index).into_iter().cloned().collect(),
    }))
}

async fn browse(
    State(state): State<AppState>,
    Query(filter): Query<BrowseFilter>,
) -> Result<Json<Vec<Listing>>, AppError> {
    crate::metrics::inc_requests("/browse");
    Ok(Json(state.catalog.browse(&filter).await?))
}

async fn seller_listings(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<SellerListings>, AppError> {
    state
        .catalog
        .seller_listings(&username, &session)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound("seller"))
}

async fn get_profile(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Result<Json<Profile>, AppError> {
    Ok(Json(state.profiles.own(&session).await?))
}

/// Onboarding: username, location and avatar.
async fn save_profile(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<SavedProfile>, AppError> {
    crate::metrics::inc_requests("/profile");
    Ok(Json(state.profiles.save(&session, update).await?))
}

async fn delete_listing(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let listing_type =
        ListingType::from_path(&kind).ok_or(AppError::BadRequest("unknown listing kind"))?;
    if state.catalog.delete_own(&session, listing_type, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("listing"))
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error(transparent)]
    Backend(#[from] SupabaseError),
    #[error(transparent)]
    Scraper(#[from] ScraperError),
    #[error(transparent)]
    Dismiss(#[from] DismissError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                return (status, Json(payload)).into_response();
            }
            AppError::Editor(EditorError::NoItem) => (StatusCode::NOT_FOUND, "no_import_in_progress"),
            AppError::Editor(EditorError::Tag(_)) => (StatusCode::BAD_REQUEST, "invalid_tag"),
            AppError::Editor(EditorError::Incomplete) => (StatusCode::BAD_REQUEST, "incomplete_item"),
            AppError::Backend(SupabaseError::Unauthorized) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::Backend(_) => (StatusCode::BAD_GATEWAY, "backend_unavailable"),
            AppError::Scraper(_) => (StatusCode::BAD_GATEWAY, "scraper_unavailable"),
            AppError::Dismiss(DismissError::NotFound) | AppError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::Dismiss(DismissError::InFlight) => (StatusCode::CONFLICT, "job_in_flight"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::Profile(ProfileError::UsernameRequired) => {
                (StatusCode::BAD_REQUEST, "invalid_profile")
            }
            AppError::Profile(ProfileError::NotFound) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Profile(ProfileError::Backend(SupabaseError::Unauthorized)) => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            AppError::Profile(ProfileError::Backend(_)) => {
                (StatusCode::BAD_GATEWAY, "backend_unavailable")
            }
        };
        if status.is_server_error() || status == StatusCode::BAD_GATEWAY {
            warn!(target = "wayover.api", error = %self, "request_failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
