use thiserror::Error;

/// Why a generation produced no image.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Por favor, digite um prompt.")]
    EmptyPrompt,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0:#}")]
    Inference(anyhow::Error),
}

impl From<anyhow::Error> for GenerationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Inference(err)
    }
}
