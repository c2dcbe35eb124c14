//! Response envelopes for synthesized summary audio.

use base64::{Engine as _, engine::general_purpose};
use clap::ValueEnum;
use serde::Serialize;
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

use crate::utils::ensure_writable_parent;

pub const MIME_TYPE: &str = "audio/mpeg";

/// How audio is handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AudioFormat {
    /// JSON with the MP3 bytes base64-encoded.
    #[default]
    Base64,
    /// JSON with a `data:` URL.
    Url,
    /// Raw MP3 bytes.
    Stream,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Base64 {
        audio_base64: String,
        mime_type: &'static str,
        summary: String,
        bytes: usize,
    },
    Url {
        url: String,
        mime_type: &'static str,
        summary: String,
    },
    #[serde(skip)]
    Stream(Vec<u8>),
}

impl AudioPayload {
    pub fn new(format: AudioFormat, audio: Vec<u8>, summary: &str) -> Self {
        match format {
            AudioFormat::Base64 => AudioPayload::Base64 {
                bytes: audio.len(),
                audio_base64: general_purpose::STANDARD.encode(&audio),
                mime_type: MIME_TYPE,
                summary: summary.to_string(),
            },
            AudioFormat::Url => AudioPayload::Url {
                url: format!(
                    "data:{MIME_TYPE};base64,{}",
                    general_purpose::STANDARD.encode(&audio)
                ),
                mime_type: MIME_TYPE,
                summary: summary.to_string(),
            },
            AudioFormat::Stream => AudioPayload::Stream(audio),
        }
    }
}

/// Write raw audio bytes to `path`.
#[instrument(level = "info", skip_all, fields(path = %path.display(), bytes = audio.len()))]
pub async fn write_audio(audio: &[u8], path: &Path) -> Result<(), Box<dyn Error>> {
    ensure_writable_parent(path).await?;
    fs::write(path, audio).await?;
    info!("Wrote audio file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_envelope() {
        let payload = AudioPayload::new(AudioFormat::Base64, b"ID3".to_vec(), "calm");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["audio_base64"], "SUQz");
        assert_eq!(json["mime_type"], "audio/mpeg");
        assert_eq!(json["bytes"], 3);
    }

    #[test]
    fn test_url_envelope() {
        let payload = AudioPayload::new(AudioFormat::Url, b"ID3".to_vec(), "calm");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["url"], "data:audio/mpeg;base64,SUQz");
        assert_eq!(json["summary"], "calm");
    }

    #[test]
    fn test_stream_keeps_raw_bytes() {
        match AudioPayload::new(AudioFormat::Stream, vec![1, 2, 3], "calm") {
            AudioPayload::Stream(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_audio() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("summary.mp3");
        write_audio(&[0xFF, 0xFB], &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF, 0xFB]);
    }
}
