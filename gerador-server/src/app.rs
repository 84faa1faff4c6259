use std::sync::Arc;

use axum::{
    extract::{Form, Json, State},
    http::header,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use gerador_core::{
    generate, validate_request, GeneratedImage, GenerationError, GenerationRequest, ModelLike,
    PNG_FILE_NAME, PNG_MIME_TYPE,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::ServiceError,
    page::{Page, PageView},
};

/// Server-wide overrides for request fields the caller left out.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationDefaults {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
}

impl GenerationDefaults {
    pub fn apply(&self, mut request: GenerationRequest) -> GenerationRequest {
        request.width = request.width.or(self.width);
        request.height = request.height.or(self.height);
        request.steps = request.steps.or(self.steps);
        request.guidance = request.guidance.or(self.guidance);
        request
    }
}

// Application state containing the preloaded model and the page template.
#[derive(Clone)]
pub struct AppState {
    model: Arc<dyn ModelLike>,
    generation_lock: Arc<Mutex<()>>,
    defaults: GenerationDefaults,
    page: Arc<Page>,
}

impl AppState {
    pub fn new(model: Arc<dyn ModelLike>, defaults: GenerationDefaults) -> anyhow::Result<Self> {
        Ok(Self {
            model,
            generation_lock: Arc::new(Mutex::new(())),
            defaults,
            page: Arc::new(Page::new()?),
        })
    }
}

#[derive(Deserialize)]
pub struct PromptForm {
    #[serde(default)]
    prompt: String,
}

#[derive(Serialize, Deserialize)]
pub struct GenerationResponse {
    pub image: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/download", post(download_handler))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Runs one generation on the blocking pool. Only one runs at a time.
///
/// The lock guard moves into the blocking task, so a caller that goes away
/// mid-generation keeps the lock held until inference actually finishes.
async fn run_generation(
    state: &AppState,
    request: GenerationRequest,
) -> Result<GeneratedImage, GenerationError> {
    let request = state.defaults.apply(request);
    validate_request(&request)?;

    let guard = Arc::clone(&state.generation_lock).lock_owned().await;
    let model = Arc::clone(&state.model);
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        generate(model.as_ref(), request)
    })
    .await
        .map_err(|e| {
            GenerationError::Inference(anyhow::Error::new(e).context("generation task failed"))
        })?
}

async fn health() -> &'static str {
    "ok"
}

async fn index(State(state): State<AppState>) -> Result<Html<String>, ServiceError> {
    Ok(Html(state.page.render(&PageView::Idle)?))
}

async fn submit(
    State(state): State<AppState>,
    Form(form): Form<PromptForm>,
) -> Result<Html<String>, ServiceError> {
    let outcome = run_generation(&state, GenerationRequest::from_prompt(form.prompt.clone())).await;
    if let Err(e) = &outcome {
        info!("generation from the UI did not produce an image: {e}");
    }
    let view = PageView::from_outcome(form.prompt, outcome);
    Ok(Html(state.page.render(&view)?))
}

/// Uses the preloaded model from `state` to generate an image (base64).
async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let image = run_generation(&state, req).await?;
    Ok(Json(GenerationResponse {
        image: BASE64_STANDARD.encode(&image.png),
    }))
}

/// Runs a fresh generation from the JSON body and returns it as a PNG
/// attachment. Nothing is remembered between requests, so pass the `seed` of
/// an earlier API call to get the same image again; the page itself offers
/// the displayed image for download straight from its data URI.
async fn download_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Result<Response, ServiceError> {
    let image = run_generation(&state, req).await?;
    Ok(png_attachment(image.png))
}

fn png_attachment(png: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, PNG_MIME_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{PNG_FILE_NAME}\""),
            ),
        ],
        png,
    )
        .into_response()
}
