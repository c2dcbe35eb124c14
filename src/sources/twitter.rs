//! Twitter/X upstream over the v2 API with an app bearer token.
//!
//! Batch pulls use recent search; the stream uses the filtered stream
//! endpoint, which delivers one JSON object per line with blank keep-alive
//! lines in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{PostSink, SourceError, Upstream};
use crate::models::RawPost;
use crate::utils::truncate_chars;

const API_BASE: &str = "https://api.twitter.com/2";
const DEFAULT_RULE: &str = "lang:en -is:retweet";
const BATCH_TEXT_MAX_CHARS: usize = 500;
const STREAM_TEXT_MAX_CHARS: usize = 1000;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    author_id: Option<String>,
}

impl Tweet {
    fn into_post(self, max_chars: usize) -> RawPost {
        let mut post = RawPost::new("twitter", truncate_chars(&self.text, max_chars));
        post.timestamp = self.created_at.unwrap_or_else(Utc::now);
        post.url = Some(format!("https://twitter.com/i/web/status/{}", self.id));
        post.author = self.author_id;
        post.id = Some(self.id);
        post
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: Tweet,
}

/// Parse one filtered-stream line; `Ok(None)` for keep-alives.
fn parse_stream_line(line: &str) -> Result<Option<RawPost>, SourceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let envelope: StreamEnvelope = serde_json::from_str(line)?;
    Ok(Some(envelope.data.into_post(STREAM_TEXT_MAX_CHARS)))
}

pub struct TwitterClient {
    http: reqwest::Client,
    bearer: String,
    rules: Vec<String>,
}

impl TwitterClient {
    pub fn new(http: reqwest::Client, bearer: &str) -> Self {
        Self {
            http,
            bearer: bearer.to_string(),
            rules: vec![DEFAULT_RULE.to_string()],
        }
    }

    async fn search_recent(&self, query: &str, limit: usize) -> Result<Vec<RawPost>, SourceError> {
        // the API rejects max_results outside 10..=100
        let max_results = limit.clamp(10, 100).to_string();
        let resp = self
            .http
            .get(format!("{API_BASE}/tweets/search/recent"))
            .bearer_auth(&self.bearer)
            .query(&[
                ("query", query),
                ("max_results", max_results.as_str()),
                ("tweet.fields", "created_at,author_id,geo"),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let found: SearchResponse = resp.json().await?;
        let mut posts: Vec<RawPost> = found
            .data
            .into_iter()
            .map(|t| t.into_post(BATCH_TEXT_MAX_CHARS))
            .collect();
        posts.truncate(limit);
        Ok(posts)
    }

    /// Register stream rules. Failures are logged; existing rules still apply.
    async fn ensure_rules(&self) {
        let add: Vec<_> = self
            .rules
            .iter()
            .map(|r| serde_json::json!({ "value": r }))
            .collect();
        let result = self
            .http
            .post(format!("{API_BASE}/tweets/search/stream/rules"))
            .bearer_auth(&self.bearer)
            .json(&serde_json::json!({ "add": add }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => debug!(rules = ?self.rules, "Stream rules set"),
            Ok(resp) => warn!(status = resp.status().as_u16(), "Could not set stream rules"),
            Err(e) => warn!(error = %e, "Could not set stream rules"),
        }
    }

    /// Read one stream connection until it ends. Returns `Ok(false)` once the
    /// sink is closed.
    async fn read_stream(&self, sink: &PostSink, cancel: &CancellationToken) -> Result<bool, SourceError> {
        let resp = self
            .http
            .get(format!("{API_BASE}/tweets/search/stream"))
            .bearer_auth(&self.bearer)
            .query(&[("tweet.fields", "created_at,author_id,geo")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        info!("Connected to Twitter stream");

        let mut bytes = Box::pin(resp.bytes_stream());
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(true),
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(true);
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk?));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                match parse_stream_line(&line) {
                    Ok(Some(post)) => {
                        if sink.push(post).is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping malformed stream line"),
                }
            }
        }
    }
}

#[async_trait]
impl Upstream for TwitterClient {
    fn platform(&self) -> &'static str {
        "twitter"
    }

    #[instrument(level = "info", skip(self))]
    async fn recent(&self, limit: usize) -> Result<Vec<RawPost>, SourceError> {
        let posts = self.search_recent(DEFAULT_RULE, limit).await?;
        info!(count = posts.len(), "Fetched recent tweets");
        Ok(posts)
    }

    #[instrument(level = "info", skip(self))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawPost>, SourceError> {
        self.search_recent(&format!("{query} {DEFAULT_RULE}"), limit)
            .await
    }

    /// Hold the filtered stream open, reconnecting with doubling backoff.
    async fn stream(&self, sink: PostSink, cancel: CancellationToken) -> Result<(), SourceError> {
        self.ensure_rules().await;
        let mut delay = Duration::from_secs(5);
        while !cancel.is_cancelled() {
            match self.read_stream(&sink, &cancel).await {
                Ok(false) => {
                    warn!("Twitter stream sink closed");
                    return Ok(());
                }
                Ok(true) => delay = Duration::from_secs(5),
                Err(e) => {
                    warn!(error = %e, delay_s = delay.as_secs(), "Twitter stream dropped");
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }
}
