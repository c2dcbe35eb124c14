//! Sentiment scoring with a remote classifier and a keyword fallback.
//!
//! The scorer cleans the text, asks a three-class classifier
//! (positive / neutral / negative) for a label and confidence, and remaps the
//! confidence onto the signed `[-1, 1]` scale with a configurable [`ScoreCurve`].
//! When no classifier is configured, or the call fails, a keyword count over
//! curated word lists decides instead. Scoring never fails.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::models::{MoodLabel, Sentiment};
use crate::utils::{collapse_whitespace, round_to, truncate_chars};

/// Default classifier on the Hugging Face inference API.
pub const DEFAULT_MODEL: &str = "cardiffnlp/twitter-roberta-base-sentiment-latest";

const HF_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// Model input is cut to this many characters after cleaning.
pub const MAX_INPUT_CHARS: usize = 512;

/// Cleaned text shorter than this scores neutral without a model call.
const MIN_CLEAN_CHARS: usize = 3;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:https?://|www\.)\S+").unwrap());
static REMOVED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[(?:deleted|removed)\]").unwrap());
static EMPHASIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*|__|~~").unwrap());

static POSITIVE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "happy", "joy", "joyful", "excited", "love", "great", "amazing", "wonderful", "good",
        "best", "awesome", "perfect", "beautiful", "grateful", "thanks", "glad", "lovely",
        "celebrating", "success", "win", "won", "congratulations", "fantastic", "excellent",
        "brilliant", "cool", "nice", "thrilled",
    ]
    .into_iter()
    .collect()
});

static NEGATIVE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "sad", "angry", "hate", "terrible", "awful", "bad", "worst", "anxious", "stress",
        "stressed", "worried", "worry", "concern", "concerned", "problem", "broke", "broken",
        "rejected", "rejection", "frustrated", "frustration", "disappointed", "disappointing",
        "upset", "annoyed", "creep", "creepy", "scared", "fear", "afraid", "hurt", "pain",
        "painful", "horrible", "overwhelmed",
    ]
    .into_iter()
    .collect()
});

/// Raw classifier answer: the winning class and its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelOutput {
    pub label: String,
    #[serde(rename = "score")]
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("classifier returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("classifier returned no labels")]
    Empty,
}

/// A pretrained three-class sentiment classifier.
#[async_trait]
pub trait SentimentModel: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<ModelOutput, ModelError>;
}

/// Classifier hosted on the Hugging Face inference API.
pub struct HuggingFaceModel {
    http: reqwest::Client,
    token: String,
    model: String,
}

impl HuggingFaceModel {
    pub fn new(http: reqwest::Client, token: &str, model: &str) -> Self {
        Self {
            http,
            token: token.to_string(),
            model: model.to_string(),
        }
    }
}

impl fmt::Debug for HuggingFaceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuggingFaceModel")
            .field("model", &self.model)
            .finish()
    }
}

/// The inference API answers either `[[{label, score}]]` or `[{label, score}]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum InferenceResponse {
    Nested(Vec<Vec<ModelOutput>>),
    Flat(Vec<ModelOutput>),
}

impl InferenceResponse {
    fn best(self) -> Option<ModelOutput> {
        let outputs = match self {
            InferenceResponse::Nested(v) => v.into_iter().flatten().collect::<Vec<_>>(),
            InferenceResponse::Flat(v) => v,
        };
        outputs
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

#[async_trait]
impl SentimentModel for HuggingFaceModel {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn classify(&self, text: &str) -> Result<ModelOutput, ModelError> {
        let url = format!("{}/{}", HF_INFERENCE_URL, self.model);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "inputs": text }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: InferenceResponse = resp.json().await?;
        parsed.best().ok_or(ModelError::Empty)
    }
}

/// How a classifier confidence maps onto the signed score scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScoreCurve {
    /// Positive confidence lands in `[floor, 1]`, negative in `[-1, -floor]`,
    /// neutral in `[-floor, floor]`.
    Offset { floor: f64 },
    /// Score is the confidence itself, signed by label; neutral is `0`.
    Linear,
}

impl Default for ScoreCurve {
    fn default() -> Self {
        ScoreCurve::Offset { floor: 0.3 }
    }
}

impl ScoreCurve {
    pub fn map(&self, label: MoodLabel, confidence: f64) -> f64 {
        let c = confidence.clamp(0.0, 1.0);
        let score = match (*self, label) {
            (ScoreCurve::Offset { floor }, MoodLabel::Joyful) => floor + c * (1.0 - floor),
            (ScoreCurve::Offset { floor }, MoodLabel::Anxious) => -(floor + c * (1.0 - floor)),
            (ScoreCurve::Offset { floor }, MoodLabel::Neutral) => (c - 0.5) * 2.0 * floor,
            (ScoreCurve::Linear, MoodLabel::Joyful) => c,
            (ScoreCurve::Linear, MoodLabel::Anxious) => -c,
            (ScoreCurve::Linear, MoodLabel::Neutral) => 0.0,
        };
        round_to(score.clamp(-1.0, 1.0), 3)
    }
}

impl FromStr for ScoreCurve {
    type Err = String;

    /// Accepts `linear`, `offset` or `offset:<floor>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "linear" => Ok(ScoreCurve::Linear),
            None if s == "offset" => Ok(ScoreCurve::default()),
            Some(("offset", floor)) => {
                let floor: f64 = floor
                    .parse()
                    .map_err(|_| format!("invalid offset floor: {floor}"))?;
                if (0.0..1.0).contains(&floor) {
                    Ok(ScoreCurve::Offset { floor })
                } else {
                    Err(format!("offset floor must be in [0, 1): {floor}"))
                }
            }
            _ => Err(format!("unknown score curve: {s}")),
        }
    }
}

/// Map a classifier label onto the application's three labels.
pub fn map_model_label(label: &str) -> MoodLabel {
    match label.to_ascii_lowercase().as_str() {
        "positive" | "pos" | "label_2" => MoodLabel::Joyful,
        "negative" | "neg" | "label_0" => MoodLabel::Anxious,
        _ => MoodLabel::Neutral,
    }
}

/// Strip URLs, removal markers and markdown emphasis, then fold whitespace.
pub fn clean_text(text: &str) -> String {
    let text = URL_RE.replace_all(text, "");
    let text = REMOVED_RE.replace_all(&text, "");
    let text = EMPHASIS_RE.replace_all(&text, "");
    collapse_whitespace(&text)
}

/// Keyword-count heuristic used when the classifier is unavailable.
pub fn keyword_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    let mut positive = 0usize;
    let mut negative = 0usize;
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if POSITIVE_WORDS.contains(word) {
            positive += 1;
        } else if NEGATIVE_WORDS.contains(word) {
            negative += 1;
        }
    }

    if positive > negative {
        Sentiment {
            label: MoodLabel::Joyful,
            score: round_to((0.4 + positive as f64 * 0.15).min(0.9), 3),
        }
    } else if negative > positive {
        Sentiment {
            label: MoodLabel::Anxious,
            score: round_to((-0.4 - negative as f64 * 0.15).max(-0.9), 3),
        }
    } else {
        Sentiment::neutral()
    }
}

/// Text to `{label, score}` scorer.
pub struct SentimentScorer {
    model: Option<Arc<dyn SentimentModel>>,
    curve: ScoreCurve,
}

impl fmt::Debug for SentimentScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentimentScorer")
            .field("model", &self.model.as_ref().map(|m| m.name().to_string()))
            .field("curve", &self.curve)
            .finish()
    }
}

impl SentimentScorer {
    pub fn new(model: Option<Arc<dyn SentimentModel>>, curve: ScoreCurve) -> Self {
        Self { model, curve }
    }

    /// A scorer that only ever uses the keyword heuristic.
    pub fn keyword_only() -> Self {
        Self::new(None, ScoreCurve::default())
    }

    /// Whether a classifier is configured.
    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    pub async fn analyze(&self, text: &str) -> Sentiment {
        let cleaned = clean_text(text);
        if cleaned.chars().count() < MIN_CLEAN_CHARS {
            return Sentiment::neutral();
        }
        let cleaned = truncate_chars(&cleaned, MAX_INPUT_CHARS);

        if let Some(model) = &self.model {
            let t0 = Instant::now();
            match model.classify(&cleaned).await {
                Ok(out) => {
                    let label = map_model_label(&out.label);
                    let score = self.curve.map(label, out.confidence);
                    debug!(
                        model = model.name(),
                        %label,
                        score,
                        elapsed_ms = t0.elapsed().as_millis() as u64,
                        "Classifier scored text"
                    );
                    return Sentiment { label, score };
                }
                Err(e) => {
                    warn!(model = model.name(), error = %e, "Classifier failed; using keyword fallback");
                }
            }
        }

        keyword_sentiment(&cleaned)
    }

    /// Same result as [`analyze`](Self::analyze), as `(score, label)`.
    pub async fn analyze_text(&self, text: &str) -> (f64, MoodLabel) {
        let s = self.analyze(text).await;
        (s.score, s.label)
    }
}
