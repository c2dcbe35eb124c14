//! Reddit upstream over the OAuth API.
//!
//! Authenticates with the application-only `client_credentials` grant and
//! talks to `oauth.reddit.com`. Reddit carries no geodata, so every post leaves
//! here unlocated and is anchored by the fetcher.
//!
//! # Endpoints
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | token | `POST www.reddit.com/api/v1/access_token` |
//! | recent | `GET /r/worldnews+news/hot` |
//! | search | `GET /search?q=..&sort=new&t=week` |
//! | stream | `GET /r/{subs}/comments`, polled |

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{PostSink, SourceError, Upstream};
use crate::models::RawPost;
use crate::utils::truncate_chars;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";
const WEB_BASE: &str = "https://www.reddit.com";
const RECENT_SUBREDDITS: &str = "worldnews+news";
const BATCH_TEXT_MAX_CHARS: usize = 500;
const STREAM_TEXT_MAX_CHARS: usize = 1000;
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Refresh the token this long before Reddit says it expires.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    data: ThingData,
}

/// Submission or comment fields; only what both share plus their text.
#[derive(Debug, Deserialize)]
struct ThingData {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    created_utc: Option<f64>,
}

impl ThingData {
    fn text(&self) -> String {
        match (&self.title, &self.body) {
            (Some(title), _) => match self.selftext.as_deref() {
                Some(extra) if !extra.trim().is_empty() => format!("{title} {extra}"),
                _ => title.clone(),
            },
            (None, Some(body)) => body.clone(),
            (None, None) => String::new(),
        }
    }

    fn created(&self) -> DateTime<Utc> {
        self.created_utc
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single())
            .unwrap_or_else(Utc::now)
    }

    fn into_post(self, max_chars: usize) -> RawPost {
        let mut post = RawPost::new("reddit", truncate_chars(&self.text(), max_chars));
        post.timestamp = self.created();
        post.url = self
            .permalink
            .as_deref()
            .and_then(|p| Url::parse(WEB_BASE).and_then(|base| base.join(p)).ok())
            .map(String::from);
        post.author = self.author;
        post.id = Some(self.id);
        post
    }
}

impl Listing {
    pub(crate) fn into_posts(self, max_chars: usize) -> Vec<RawPost> {
        self.data
            .children
            .into_iter()
            .map(|thing| thing.data.into_post(max_chars))
            .filter(|p| !p.text.trim().is_empty())
            .collect()
    }
}

/// Application-only Reddit client.
pub struct RedditClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    user_agent: String,
    stream_subreddits: Vec<String>,
    token: Mutex<Option<CachedToken>>,
}

impl RedditClient {
    pub fn new(
        http: reqwest::Client,
        client_id: &str,
        client_secret: &str,
        user_agent: &str,
        stream_subreddits: Vec<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            user_agent: user_agent.to_string(),
            stream_subreddits,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .form(&[("grant_type", "client_credentials")])
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
        let token: TokenResponse = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
        debug!(expires_in = token.expires_in, "Obtained Reddit access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn get_listing(&self, path_and_query: &str) -> Result<Listing, SourceError> {
        let token = self.access_token().await?;
        let url = format!("{API_BASE}{path_and_query}");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
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
        Ok(resp.json().await?)
    }

    async fn poll_comments(&self, subs: &str) -> Result<Vec<RawPost>, SourceError> {
        let listing = self
            .get_listing(&format!("/r/{subs}/comments?limit=100&raw_json=1"))
            .await?;
        Ok(listing.into_posts(STREAM_TEXT_MAX_CHARS))
    }
}

#[async_trait]
impl Upstream for RedditClient {
    fn platform(&self) -> &'static str {
        "reddit"
    }

    #[instrument(level = "info", skip(self))]
    async fn recent(&self, limit: usize) -> Result<Vec<RawPost>, SourceError> {
        let listing = self
            .get_listing(&format!(
                "/r/{RECENT_SUBREDDITS}/hot?limit={}&raw_json=1",
                limit.clamp(1, 100)
            ))
            .await?;
        let mut posts = listing.into_posts(BATCH_TEXT_MAX_CHARS);
        posts.truncate(limit);
        info!(count = posts.len(), "Fetched Reddit hot posts");
        Ok(posts)
    }

    #[instrument(level = "info", skip(self))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawPost>, SourceError> {
        let listing = self
            .get_listing(&format!(
                "/search?q={}&sort=new&t=week&limit={}&raw_json=1",
                urlencoding::encode(query),
                limit.clamp(1, 100)
            ))
            .await?;
        Ok(listing.into_posts(BATCH_TEXT_MAX_CHARS))
    }

    /// Poll new comments, skipping whatever existed before the first poll.
    async fn stream(&self, sink: PostSink, cancel: CancellationToken) -> Result<(), SourceError> {
        let subs = self.stream_subreddits.join("+");
        info!(%subs, "Reddit comment stream started");
        let mut watermark: Option<DateTime<Utc>> = None;

        loop {
            match self.poll_comments(&subs).await {
                Ok(posts) => {
                    let newest = posts.iter().map(|p| p.timestamp).max();
                    if let Some(mark) = watermark {
                        for post in posts.into_iter().filter(|p| p.timestamp > mark) {
                            if let Err(e) = sink.push(post) {
                                warn!(error = %e, "Reddit stream sink closed");
                                return Ok(());
                            }
                        }
                    }
                    watermark = watermark.max(newest).or(Some(Utc::now()));
                }
                Err(e) => warn!(error = %e, "Reddit comment poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(STREAM_POLL_INTERVAL) => {}
            }
        }
    }
}
