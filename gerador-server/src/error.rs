use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gerador_core::GenerationError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("failed to render page: {0}")]
    Render(#[from] minijinja::Error),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Generation(
                GenerationError::EmptyPrompt | GenerationError::InvalidRequest(_),
            ) => StatusCode::BAD_REQUEST,
            ServiceError::Generation(GenerationError::Inference(_)) | ServiceError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
