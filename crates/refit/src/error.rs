use refit_core::UpdateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("failed to render output: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Update(error) if error.is_fatal() => 2,
            _ => 1,
        }
    }
}
