//! Text-to-speech through the ElevenLabs API.
//!
//! Voices may be given as ids or display names. An ASCII-alphanumeric token
//! of 20 to 24 characters is taken as an id; anything else is looked up by name in the
//! account's voice list (cached per process) and falls back to the default
//! voice when it cannot be resolved.
//!
//! Models are tried in order: explicit override, configured model, then the
//! preference list. A "model deprecated for free tier" rejection moves on to
//! the next model; any other failure is final.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const API_BASE: &str = "https://api.elevenlabs.io/v1";

pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

pub const PREFERRED_MODELS: &[&str] = &[
    "eleven_multilingual_v2",
    "eleven_monolingual_v2",
    "eleven_turbo_v2",
];

const TIER_UNSUPPORTED: &str = "model_deprecated_free_tier";

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("text-to-speech is not configured (set {0})")]
    NotConfigured(&'static str),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unable to list voices (status {status})")]
    VoiceLookup { status: u16 },
    #[error("TTS failed ({status}) with model {model}: {body}")]
    Upstream {
        status: u16,
        body: String,
        model: String,
    },
    #[error("all models failed (tried: {})", tried.join(", "))]
    AllModelsFailed { tried: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
}

/// Raw outcome of one synthesis request.
#[derive(Debug, Clone)]
pub struct SpeechReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Transport seam over the speech API.
#[async_trait]
pub trait SpeechApi: Send + Sync {
    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError>;
    async fn speak(&self, voice_id: &str, model: &str, text: &str) -> Result<SpeechReply, TtsError>;
}

pub struct ElevenLabsApi {
    http: reqwest::Client,
    api_key: String,
}

impl ElevenLabsApi {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VoiceList {
    #[serde(default)]
    voices: Vec<Voice>,
}

#[async_trait]
impl SpeechApi for ElevenLabsApi {
    async fn list_voices(&self) -> Result<Vec<Voice>, TtsError> {
        let resp = self
            .http
            .get(format!("{API_BASE}/voices"))
            .header("xi-api-key", &self.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TtsError::VoiceLookup {
                status: status.as_u16(),
            });
        }
        let list: VoiceList = resp.json().await?;
        Ok(list.voices)
    }

    async fn speak(&self, voice_id: &str, model: &str, text: &str) -> Result<SpeechReply, TtsError> {
        let resp = self
            .http
            .post(format!("{API_BASE}/text-to-speech/{voice_id}"))
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .timeout(std::time::Duration::from_secs(30))
            .json(&serde_json::json!({
                "text": text,
                "model_id": model,
                "voice_settings": {"stability": 0.5, "similarity_boost": 0.5},
            }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        Ok(SpeechReply { status, body })
    }
}

/// Whether `token` has the shape of a voice id rather than a display name.
pub fn looks_like_voice_id(token: &str) -> bool {
    (20..=24).contains(&token.len()) && token.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Override, then configured model, then the preference list; no repeats.
pub fn candidate_models(override_model: Option<&str>, configured: Option<&str>) -> Vec<String> {
    let mut models: Vec<String> = Vec::new();
    for m in override_model
        .into_iter()
        .chain(configured)
        .chain(PREFERRED_MODELS.iter().copied())
    {
        let m = m.trim();
        if !m.is_empty() && !models.iter().any(|existing| existing == m) {
            models.push(m.to_string());
        }
    }
    models
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    status: Option<String>,
}

/// Whether an error body says the model is not available on this tier.
pub fn is_tier_unsupported(body: &[u8]) -> bool {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.detail.status)
        .is_some_and(|s| s == TIER_UNSUPPORTED)
}

pub struct AudioRenderer {
    api: Option<Arc<dyn SpeechApi>>,
    default_voice: String,
    configured_model: Option<String>,
    voice_cache: Mutex<HashMap<String, String>>,
}

impl fmt::Debug for AudioRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRenderer")
            .field("configured", &self.api.is_some())
            .field("default_voice", &self.default_voice)
            .field("configured_model", &self.configured_model)
            .finish()
    }
}

impl AudioRenderer {
    pub fn new(
        api: Option<Arc<dyn SpeechApi>>,
        default_voice: &str,
        configured_model: Option<String>,
    ) -> Self {
        Self {
            api,
            default_voice: default_voice.to_string(),
            configured_model,
            voice_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api.is_some()
    }

    async fn resolve_voice(&self, api: &dyn SpeechApi, voice: &str) -> String {
        if looks_like_voice_id(voice) {
            return voice.to_string();
        }
        if let Some(id) = self.voice_cache.lock().await.get(voice) {
            return id.clone();
        }
        match api.list_voices().await {
            Ok(voices) => match voices.into_iter().find(|v| v.name == voice) {
                Some(found) => {
                    debug!(name = voice, id = %found.voice_id, "Resolved voice name");
                    self.voice_cache
                        .lock()
                        .await
                        .insert(voice.to_string(), found.voice_id.clone());
                    found.voice_id
                }
                None => {
                    warn!(name = voice, "Voice name not found; using default voice");
                    self.default_voice.clone()
                }
            },
            Err(e) => {
                warn!(name = voice, error = %e, "Voice lookup failed; using default voice");
                self.default_voice.clone()
            }
        }
    }

    /// Render `text` to MP3 bytes.
    #[instrument(level = "info", skip(self, text), fields(chars = text.chars().count()))]
    pub async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        model: Option<&str>,
    ) -> Result<Vec<u8>, TtsError> {
        let api = self
            .api
            .as_deref()
            .ok_or(TtsError::NotConfigured("ELEVENLABS_API_KEY"))?;
        let voice_id = self
            .resolve_voice(api, voice.unwrap_or(&self.default_voice))
            .await;

        let mut tried = Vec::new();
        for candidate in candidate_models(model, self.configured_model.as_deref()) {
            tried.push(candidate.clone());
            let reply = api.speak(&voice_id, &candidate, text).await?;
            if reply.status == 200 {
                info!(model = %candidate, bytes = reply.body.len(), "Synthesized audio");
                return Ok(reply.body);
            }
            if is_tier_unsupported(&reply.body) {
                warn!(model = %candidate, "Model unavailable on current tier; trying next");
                continue;
            }
            return Err(TtsError::Upstream {
                status: reply.status,
                body: String::from_utf8_lossy(&reply.body).into_owned(),
                model: candidate,
            });
        }
        Err(TtsError::AllModelsFailed { tried })
    }
}
