//! Ingestion: post source -> sentiment scorer -> mood store.
//!
//! Three drivers share the same scoring path:
//!
//! 1. **Refresh**: one on-demand pull, batch or per city
//! 2. **Scheduler**: a long-lived loop running one bounded per-city cycle
//!    (one post per city) every `max(60s, interval)`
//! 3. **Stream consumer**: drains the post channel fed by the stream
//!    producers, inserting one point at a time
//!
//! Single-item failures are logged and skipped; a failing cycle never ends
//! the scheduler, and a failing item never ends the consumer. Both background
//! drivers stop at their next suspension point once the cancellation token
//! fires.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::models::{MoodPoint, RawPost};
use crate::sentiment::SentimentScorer;
use crate::sources::{PostFetcher, SourceError};
use crate::store::{MoodStore, StoreError};

/// Floor for the scheduler's sleep between cycles.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Raw stream posts retained for inspection.
pub const STREAM_DEBUG_CAPACITY: usize = 200;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// Recent posts across platforms.
    #[default]
    Batch,
    /// A bounded number of posts for every curated city.
    PerCity,
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(RefreshMode::Batch),
            "city" | "per-city" | "per_city" => Ok(RefreshMode::PerCity),
            other => Err(format!("unknown refresh mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub message: String,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct Pipeline {
    fetcher: Arc<PostFetcher>,
    scorer: Arc<SentimentScorer>,
    store: Arc<MoodStore>,
    recent_stream: Mutex<VecDeque<RawPost>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("fetcher", &self.fetcher)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(fetcher: Arc<PostFetcher>, scorer: Arc<SentimentScorer>, store: Arc<MoodStore>) -> Self {
        Self {
            fetcher,
            scorer,
            store,
            recent_stream: Mutex::new(VecDeque::with_capacity(STREAM_DEBUG_CAPACITY)),
        }
    }

    /// Score `posts` into mood points, skipping any that cannot be converted.
    pub async fn score_posts(&self, posts: &[RawPost]) -> Vec<MoodPoint> {
        let mut points = Vec::with_capacity(posts.len());
        for post in posts {
            let sentiment = self.scorer.analyze(&post.text).await;
            match MoodPoint::from_post(post, sentiment, Utc::now()) {
                Ok(point) => points.push(point),
                Err(e) => warn!(id = ?post.id, error = %e, "Skipping post"),
            }
        }
        points
    }

    /// Score and store `posts`; returns how many points were written.
    pub async fn ingest(&self, posts: &[RawPost]) -> Result<usize, StoreError> {
        let points = self.score_posts(posts).await;
        let count = points.len();
        if count > 0 {
            self.store.insert_moods(points).await?;
        }
        Ok(count)
    }

    /// One on-demand pull, scored and stored.
    #[instrument(level = "info", skip(self))]
    pub async fn refresh(
        &self,
        mode: RefreshMode,
        reddit_only: bool,
        limit: usize,
    ) -> Result<RefreshReport, PipelineError> {
        let posts = match mode {
            RefreshMode::Batch => self.fetcher.fetch_recent_posts(limit, reddit_only).await?,
            RefreshMode::PerCity => {
                let cities = self.fetcher.cities().cities();
                let per_city = (limit / cities.len().max(1)).max(1);
                self.fetcher.fetch_reddit_city_posts(cities, per_city).await?
            }
        };

        if posts.is_empty() {
            return Ok(RefreshReport {
                message: "No new posts fetched".to_string(),
                count: 0,
                timestamp: Utc::now(),
            });
        }

        let count = self.ingest(&posts).await?;
        info!(fetched = posts.len(), stored = count, "Refresh complete");
        Ok(RefreshReport {
            message: "Moods refreshed successfully".to_string(),
            count,
            timestamp: Utc::now(),
        })
    }

    async fn scheduled_cycle(&self) -> Result<usize, PipelineError> {
        let posts = self
            .fetcher
            .fetch_reddit_city_posts(self.fetcher.cities().cities(), 1)
            .await?;
        Ok(self.ingest(&posts).await?)
    }

    /// Run one per-city cycle now and then every `max(60s, interval)`.
    pub async fn run_scheduler(&self, interval: Duration, cancel: CancellationToken) {
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        info!(interval_s = interval.as_secs(), "Background refresh started");
        loop {
            match self.scheduled_cycle().await {
                Ok(count) => info!(count, "Scheduled refresh stored points"),
                Err(e) => error!(error = %e, "Scheduled refresh failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Background refresh stopped");
    }

    /// Drain the stream channel until it closes or `cancel` fires.
    ///
    /// Returns the number of points written.
    pub async fn consume_stream(
        &self,
        mut rx: UnboundedReceiver<RawPost>,
        cancel: CancellationToken,
    ) -> usize {
        info!("Stream consumer started");
        let mut stored = 0usize;
        loop {
            let mut post = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(post) => post,
                    None => break,
                },
            };
            self.remember(&post);
            self.fetcher.anchor(&mut post, false);

            let sentiment = self.scorer.analyze(&post.text).await;
            let point = match MoodPoint::from_post(&post, sentiment, Utc::now()) {
                Ok(point) => point,
                Err(e) => {
                    warn!(id = ?post.id, error = %e, "Skipping stream post");
                    continue;
                }
            };
            match self.store.insert_moods(vec![point]).await {
                Ok(()) => {
                    stored += 1;
                    debug!(id = ?post.id, source = %post.source, "Stored stream post");
                }
                Err(e) => error!(id = ?post.id, error = %e, "Failed to store stream post"),
            }
        }
        info!(stored, "Stream consumer stopped");
        stored
    }

    fn remember(&self, post: &RawPost) {
        let mut recent = self
            .recent_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recent.len() == STREAM_DEBUG_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(post.clone());
    }

    /// The most recent raw stream posts, oldest first.
    pub fn recent_stream_posts(&self) -> Vec<RawPost> {
        self.recent_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
