//! Post sources: upstream clients, deduplicating stream sink and batch fetches.
//!
//! Each upstream platform implements [`Upstream`] and offers three ways in:
//!
//! | Operation | Used by |
//! |-----------|---------|
//! | `recent` | batch refresh |
//! | `search` | per-city fetches |
//! | `stream` | continuous ingestion |
//!
//! # Supported Platforms
//!
//! | Platform | Module | Credentials |
//! |----------|--------|-------------|
//! | Reddit | [`reddit`] | app client id + secret |
//! | Twitter/X | [`twitter`] | bearer token |
//!
//! [`PostFetcher`] layers the fetch policy over whatever upstreams are configured:
//! city anchoring, the 20-character minimum for city matches and the
//! [`FallbackPolicy`] that decides between failing closed and synthesizing
//! filler posts when upstream data is missing.
//!
//! Stream producers never touch shared collections. They hand every post to a
//! [`PostSink`], which drops ids seen within the dedup window and enqueues the
//! rest on a single unbounded channel read by the ingestion consumer.

pub mod reddit;
pub mod synthetic;
pub mod twitter;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cities::{City, CityDirectory, DEFAULT_WITHIN_KM};
use crate::models::RawPost;

/// Ids remembered by the stream dedup window.
pub const DEDUP_CAPACITY: usize = 5000;

/// City matches shorter than this are discarded.
pub const MIN_CITY_POST_CHARS: usize = 20;

/// Concurrent per-city searches.
const CITY_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no upstream post source configured (set {0})")]
    NotConfigured(&'static str),
    #[error("no posts found for {0}")]
    NoDataFound(String),
    #[error("unknown city: {0}")]
    UnknownCity(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("unexpected upstream payload: {0}")]
    Parse(String),
    #[error("post channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Parse(err.to_string())
    }
}

/// What to do when upstream data is unavailable. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Propagate an error.
    #[default]
    Strict,
    /// Synthesize filler posts flagged `is_fallback`.
    Lenient,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(FallbackPolicy::Strict),
            "lenient" => Ok(FallbackPolicy::Lenient),
            other => Err(format!("unknown fallback policy: {other}")),
        }
    }
}

/// A social platform client.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Platform identifier stamped on every post ("reddit", "twitter").
    fn platform(&self) -> &'static str;

    /// Best-effort pull of recent posts.
    async fn recent(&self, limit: usize) -> Result<Vec<RawPost>, SourceError>;

    /// Posts textually matching `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RawPost>, SourceError>;

    /// Push new posts into `sink` until `cancel` fires.
    async fn stream(&self, sink: PostSink, cancel: CancellationToken) -> Result<(), SourceError>;
}

/// Bounded set of recently seen post ids, evicting the oldest first.
#[derive(Debug)]
pub struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; returns `false` if it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Thread-safe handoff from stream producers to the ingestion consumer.
#[derive(Clone)]
pub struct PostSink {
    tx: mpsc::UnboundedSender<RawPost>,
    recent: Arc<Mutex<RecentIds>>,
}

impl fmt::Debug for PostSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostSink")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl PostSink {
    /// A sink and the receiving end of its delivery channel.
    pub fn channel(dedup_capacity: usize) -> (Self, mpsc::UnboundedReceiver<RawPost>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            recent: Arc::new(Mutex::new(RecentIds::new(dedup_capacity))),
        };
        (sink, rx)
    }

    /// Enqueue a post unless its id was seen recently.
    ///
    /// Returns `Ok(false)` for a dropped duplicate. Posts without an id are
    /// always delivered.
    pub fn push(&self, post: RawPost) -> Result<bool, SourceError> {
        if let Some(id) = post.id.as_deref() {
            let fresh = self
                .recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id);
            if !fresh {
                debug!(id, "Dropping duplicate post");
                return Ok(false);
            }
        }
        self.tx.send(post).map_err(|_| SourceError::ChannelClosed)?;
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Batch and stream access to every configured upstream.
pub struct PostFetcher {
    upstreams: Vec<Arc<dyn Upstream>>,
    cities: Arc<CityDirectory>,
    policy: FallbackPolicy,
}

impl fmt::Debug for PostFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostFetcher")
            .field(
                "upstreams",
                &self.upstreams.iter().map(|u| u.platform()).collect::<Vec<_>>(),
            )
            .field("cities", &self.cities.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl PostFetcher {
    pub fn new(
        upstreams: Vec<Arc<dyn Upstream>>,
        cities: Arc<CityDirectory>,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            upstreams,
            cities,
            policy,
        }
    }

    /// Whether at least one upstream client is configured.
    pub fn is_ready(&self) -> bool {
        !self.upstreams.is_empty()
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn cities(&self) -> &CityDirectory {
        &self.cities
    }

    fn reddit(&self) -> Option<&Arc<dyn Upstream>> {
        self.upstreams.iter().find(|u| u.platform() == "reddit")
    }

    /// Attach a curated city to `post`.
    ///
    /// A city named in the text wins; otherwise coordinates are snapped to the
    /// nearest city within range. With `place_randomly`, posts with neither are
    /// put on a random curated city.
    pub fn anchor(&self, post: &mut RawPost, place_randomly: bool) {
        if post.city_name.is_some() {
            return;
        }
        let city = if let Some(city) = self.cities.mentioned_in(&post.text) {
            Some(city.clone())
        } else if let (Some(lat), Some(lng)) = (post.lat, post.lng) {
            self.cities
                .nearest(lat, lng, DEFAULT_WITHIN_KM)
                .map(|hit| hit.city)
        } else if place_randomly {
            self.cities.random().cloned()
        } else {
            None
        };
        if let Some(city) = city {
            place_in_city(post, &city);
        }
    }

    /// Recent posts from every upstream (or Reddit only), interleaved.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_recent_posts(
        &self,
        limit: usize,
        reddit_only: bool,
    ) -> Result<Vec<RawPost>, SourceError> {
        let active: Vec<&Arc<dyn Upstream>> = self
            .upstreams
            .iter()
            .filter(|u| !reddit_only || u.platform() == "reddit")
            .collect();

        if active.is_empty() {
            return match self.policy {
                FallbackPolicy::Strict => Err(SourceError::NotConfigured(
                    "REDDIT_CLIENT_ID/REDDIT_CLIENT_SECRET or TWITTER_BEARER_TOKEN",
                )),
                FallbackPolicy::Lenient => {
                    warn!(limit, "No upstream configured; synthesizing posts");
                    Ok(self.synthesize_anywhere(limit))
                }
            };
        }

        // Each upstream is asked for the full limit so a failed or short
        // peer does not shrink the batch; batches interleave to keep the mix.
        let results = futures::future::join_all(
            active.iter().map(|u| async move { (u.platform(), u.recent(limit).await) }),
        )
        .await;

        let mut batches = Vec::new();
        for (platform, result) in results {
            match result {
                Ok(batch) => {
                    info!(platform, count = batch.len(), "Fetched recent posts");
                    batches.push(batch.into_iter());
                }
                Err(e) => error!(platform, error = %e, "Recent post fetch failed"),
            }
        }

        let mut posts = Vec::with_capacity(limit);
        while posts.len() < limit && !batches.is_empty() {
            batches.retain_mut(|batch| match batch.next() {
                Some(post) => {
                    posts.push(post);
                    true
                }
                None => false,
            });
        }

        if posts.is_empty() {
            return match self.policy {
                FallbackPolicy::Strict => Err(SourceError::NoDataFound("recent posts".to_string())),
                FallbackPolicy::Lenient => {
                    warn!(limit, "Upstreams returned nothing; synthesizing posts");
                    Ok(self.synthesize_anywhere(limit))
                }
            };
        }

        posts.truncate(limit);
        for post in &mut posts {
            self.anchor(post, true);
        }
        Ok(posts)
    }

    /// Reddit posts that mention `city`, at least [`MIN_CITY_POST_CHARS`] long.
    #[instrument(level = "info", skip(self))]
    pub async fn fetch_city_posts(
        &self,
        city: &str,
        limit: usize,
    ) -> Result<Vec<RawPost>, SourceError> {
        let city = self
            .cities
            .find(city)
            .cloned()
            .ok_or_else(|| SourceError::UnknownCity(city.to_string()))?;

        let Some(reddit) = self.reddit() else {
            return match self.policy {
                FallbackPolicy::Strict => {
                    Err(SourceError::NotConfigured("REDDIT_CLIENT_ID/REDDIT_CLIENT_SECRET"))
                }
                FallbackPolicy::Lenient => Ok(synthetic::posts_for_city(&city, limit)),
            };
        };

        let posts = search_city(reddit.as_ref(), &city, limit).await?;
        info!(city = %city.name, count = posts.len(), "Fetched city posts");

        if posts.is_empty() {
            return match self.policy {
                FallbackPolicy::Strict => Err(SourceError::NoDataFound(city.name.clone())),
                FallbackPolicy::Lenient => {
                    warn!(city = %city.name, "No qualifying posts; synthesizing");
                    Ok(synthetic::posts_for_city(&city, limit))
                }
            };
        }
        Ok(posts)
    }

    /// Up to `per_city` Reddit posts for each city, searched concurrently.
    #[instrument(level = "info", skip_all, fields(cities = cities.len(), per_city))]
    pub async fn fetch_reddit_city_posts(
        &self,
        cities: &[City],
        per_city: usize,
    ) -> Result<Vec<RawPost>, SourceError> {
        let Some(reddit) = self.reddit() else {
            return match self.policy {
                FallbackPolicy::Strict => {
                    Err(SourceError::NotConfigured("REDDIT_CLIENT_ID/REDDIT_CLIENT_SECRET"))
                }
                FallbackPolicy::Lenient => Ok(cities
                    .iter()
                    .flat_map(|c| synthetic::posts_for_city(c, per_city))
                    .collect()),
            };
        };

        let per_city_results: Vec<(City, Vec<RawPost>)> = stream::iter(cities.iter().cloned())
            .map(|city| {
                let reddit = Arc::clone(reddit);
                async move {
                    match search_city(reddit.as_ref(), &city, per_city).await {
                        Ok(posts) => (city, posts),
                        Err(e) => {
                            warn!(city = %city.name, error = %e, "City search failed");
                            (city, Vec::new())
                        }
                    }
                }
            })
            .buffer_unordered(CITY_FETCH_CONCURRENCY)
            .collect()
            .await;

        let found: usize = per_city_results.iter().map(|(_, p)| p.len()).sum();
        info!(found, "Per-city fetch complete");

        match self.policy {
            FallbackPolicy::Strict if found == 0 => {
                Err(SourceError::NoDataFound("any city".to_string()))
            }
            FallbackPolicy::Strict => Ok(per_city_results.into_iter().flat_map(|(_, p)| p).collect()),
            FallbackPolicy::Lenient => Ok(per_city_results
                .into_iter()
                .flat_map(|(city, posts)| {
                    if posts.is_empty() {
                        synthetic::posts_for_city(&city, per_city)
                    } else {
                        posts
                    }
                })
                .collect()),
        }
    }

    /// Launch one producer task per upstream, all feeding `sink`.
    pub fn start_streams(&self, sink: PostSink, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.upstreams
            .iter()
            .map(|upstream| {
                let upstream = Arc::clone(upstream);
                let sink = sink.clone();
                let cancel = cancel.clone();
                info!(platform = upstream.platform(), "Starting stream producer");
                tokio::spawn(async move {
                    let platform = upstream.platform();
                    match upstream.stream(sink, cancel).await {
                        Ok(()) => info!(platform, "Stream producer stopped"),
                        Err(e) => error!(platform, error = %e, "Stream producer crashed"),
                    }
                })
            })
            .collect()
    }

    fn synthesize_anywhere(&self, limit: usize) -> Vec<RawPost> {
        let mut posts = synthetic::posts(limit);
        for post in &mut posts {
            self.anchor(post, true);
        }
        posts
    }
}

fn place_in_city(post: &mut RawPost, city: &City) {
    post.lat = Some(city.lat);
    post.lng = Some(city.lng);
    post.city_name = Some(city.name.clone());
    post.country = post.country.take().or_else(|| city.country());
}

async fn search_city(
    upstream: &dyn Upstream,
    city: &City,
    limit: usize,
) -> Result<Vec<RawPost>, SourceError> {
    // over-fetch; short matches are dropped below
    let found = upstream.search(city.short_name(), limit * 2).await?;
    Ok(found
        .into_iter()
        .filter(|p| p.text.trim().chars().count() >= MIN_CITY_POST_CHARS)
        .take(limit)
        .map(|mut p| {
            place_in_city(&mut p, city);
            p
        })
        .collect())
}
