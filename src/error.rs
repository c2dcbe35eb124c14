//! Top-level error type and its structured rendering.
//!
//! Every operation on [`AppContext`](crate::service::AppContext) fails with
//! an [`AppError`], which renders as `{error, status_code, meta}` carrying
//! the upstream status and model details where they exist.

use serde_json::{Value, json};
use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::sources::SourceError;
use crate::store::StoreError;
use crate::summary::SummaryError;
use crate::tts::TtsError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error("{0} is disabled (set ENABLE_DEV_ENDPOINTS=true)")]
    DevDisabled(&'static str),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Source(e) => AppError::Source(e),
            PipelineError::Store(e) => AppError::Store(e),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Source(e) => match e {
                SourceError::NoDataFound(_) | SourceError::UnknownCity(_) => 404,
                SourceError::NotConfigured(_) => 503,
                SourceError::Upstream { .. } | SourceError::Network(_) | SourceError::Parse(_) => {
                    502
                }
                SourceError::ChannelClosed => 500,
            },
            AppError::Store(_) => 500,
            AppError::Summary(e) => match e {
                SummaryError::AllModelsFailed { .. } => 502,
                SummaryError::Store(_) => 500,
            },
            AppError::Tts(e) => match e {
                TtsError::NotConfigured(_) => 400,
                TtsError::Upstream { status, .. } | TtsError::VoiceLookup { status } => *status,
                TtsError::Network(_) => 502,
                TtsError::AllModelsFailed { .. } => 500,
            },
            AppError::DevDisabled(_) => 403,
            AppError::BadRequest(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Io(_) | AppError::Config(_) | AppError::Output(_) => 500,
        }
    }

    pub fn meta(&self) -> Value {
        match self {
            AppError::Source(SourceError::Upstream { status, .. }) => {
                json!({ "upstream_status": status })
            }
            AppError::Source(SourceError::NotConfigured(vars)) => json!({ "missing": vars }),
            AppError::Summary(SummaryError::AllModelsFailed { tried, last_error }) => {
                json!({ "tried_models": tried, "last_error": last_error })
            }
            AppError::Tts(TtsError::Upstream { model, body, .. }) => {
                json!({ "model": model, "response": body })
            }
            AppError::Tts(TtsError::AllModelsFailed { tried }) => json!({ "tried_models": tried }),
            AppError::Tts(TtsError::NotConfigured(var)) => json!({ "missing": var }),
            _ => json!({}),
        }
    }

    /// `{error, status_code, meta}`
    pub fn to_json(&self) -> Value {
        json!({
            "error": self.to_string(),
            "status_code": self.status_code(),
            "meta": self.meta(),
        })
    }
}
