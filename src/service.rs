//! Application context and the operations exposed on top of it.
//!
//! [`AppContext`] is built once at startup from [`Settings`] and owns every
//! collaborator: city directory, post fetcher, sentiment scorer, mood store,
//! ingestion pipeline, summary generator and audio renderer. Each public
//! method is one operation and returns the JSON-serializable shape the CLI
//! prints.
//!
//! ## Degradation
//!
//! | Missing | Behavior |
//! |---------|----------|
//! | `DATABASE_URL` or unreachable store | in-memory storage, capped at 1000 items |
//! | `HF_API_TOKEN` | keyword sentiment heuristic |
//! | `OPENROUTER_API_KEY` | deterministic summary template |
//! | Reddit / Twitter credentials | `NotConfigured`, or synthetic posts when lenient |
//! | `ELEVENLABS_API_KEY` | audio operation fails with `NotConfigured` |

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cities::{City, CityDirectory, NearestCity};
use crate::cli::Settings;
use crate::error::AppError;
use crate::llm::{FALLBACK_MODELS, ModelCascade, OpenRouterClient};
use crate::models::{MoodPoint, MoodStatistics, PostItem, RawPost};
use crate::outputs::audio::{AudioFormat, AudioPayload};
use crate::pipeline::{Pipeline, RefreshMode, RefreshReport};
use crate::sentiment::{HuggingFaceModel, SentimentModel, SentimentScorer};
use crate::sources::reddit::RedditClient;
use crate::sources::twitter::TwitterClient;
use crate::sources::{
    DEDUP_CAPACITY, FallbackPolicy, PostFetcher, PostSink, SourceError, Upstream, synthetic,
};
use crate::store::{MoodQuery, MoodStore};
use crate::summary::{LATEST_WINDOW, SummaryGenerator, latest_per_city};
use crate::tts::{AudioRenderer, ElevenLabsApi, SpeechApi};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Platforms a seeded point is attributed to.
const SEED_SOURCES: &[&str] = &["reddit", "twitter"];

const NO_UPSTREAM: &str = "REDDIT_CLIENT_ID/REDDIT_CLIENT_SECRET or TWITTER_BEARER_TOKEN";

/// Filters for [`AppContext::list_moods`].
#[derive(Debug, Clone, Default)]
pub struct MoodsRequest {
    pub limit: usize,
    pub source: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub hours: Option<i64>,
    pub only_city: bool,
    pub unique_per_city: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub database: bool,
    pub sentiment_model: bool,
    pub post_source: bool,
    pub text_generation: bool,
    pub text_to_speech: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub data_points: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityPosts {
    pub city: String,
    pub count: usize,
    pub posts: Vec<PostItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CityReport {
    pub city: String,
    pub posts: Vec<PostItem>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyPosts {
    pub city: NearestCity,
    pub posts: Vec<PostItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevReport {
    pub message: String,
    pub count: usize,
}

pub struct AppContext {
    cities: Arc<CityDirectory>,
    fetcher: Arc<PostFetcher>,
    scorer: Arc<SentimentScorer>,
    store: Arc<MoodStore>,
    pipeline: Arc<Pipeline>,
    summaries: SummaryGenerator,
    audio: AudioRenderer,
    dev_enabled: bool,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("fetcher", &self.fetcher)
            .field("scorer", &self.scorer)
            .field("store", &self.store)
            .field("summaries", &self.summaries)
            .field("audio", &self.audio)
            .field("dev_enabled", &self.dev_enabled)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(
        fetcher: Arc<PostFetcher>,
        scorer: Arc<SentimentScorer>,
        store: Arc<MoodStore>,
        summaries: SummaryGenerator,
        audio: AudioRenderer,
        dev_enabled: bool,
    ) -> Self {
        let cities = Arc::new(fetcher.cities().clone());
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&fetcher),
            Arc::clone(&scorer),
            Arc::clone(&store),
        ));
        Self {
            cities,
            fetcher,
            scorer,
            store,
            pipeline,
            summaries,
            audio,
            dev_enabled,
        }
    }

    /// Wire every collaborator from `settings`.
    #[instrument(level = "info", skip_all)]
    pub async fn build(settings: &Settings) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client: {e}")))?;

        let cities = match &settings.cities_file {
            Some(path) => CityDirectory::from_yaml_file(path)
                .await
                .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?,
            None => CityDirectory::builtin(),
        };

        let mut upstreams: Vec<Arc<dyn Upstream>> = Vec::new();
        match (&settings.reddit_client_id, &settings.reddit_client_secret) {
            (Some(id), Some(secret)) => upstreams.push(Arc::new(RedditClient::new(
                http.clone(),
                id,
                secret,
                &settings.reddit_user_agent,
                settings.reddit_stream_subreddits.clone(),
            ))),
            _ => info!("Reddit credentials not set; Reddit disabled"),
        }
        match &settings.twitter_bearer_token {
            Some(bearer) => upstreams.push(Arc::new(TwitterClient::new(http.clone(), bearer))),
            None => info!("Twitter bearer token not set; Twitter disabled"),
        }

        let policy = if settings.allow_synthetic_posts {
            FallbackPolicy::Lenient
        } else {
            FallbackPolicy::Strict
        };
        let fetcher = Arc::new(PostFetcher::new(upstreams, Arc::new(cities), policy));

        let model = settings.hf_api_token.as_deref().map(|token| {
            Arc::new(HuggingFaceModel::new(
                http.clone(),
                token,
                &settings.sentiment_model,
            )) as Arc<dyn SentimentModel>
        });
        let scorer = Arc::new(SentimentScorer::new(model, settings.score_curve));

        let cascade = settings.openrouter_api_key.as_deref().map(|key| {
            ModelCascade::new(
                Arc::new(OpenRouterClient::new(http.clone(), key)),
                &settings.openrouter_model,
                FALLBACK_MODELS,
            )
        });
        let summaries = SummaryGenerator::new(settings.summary(), cascade);

        let speech = settings
            .elevenlabs_api_key
            .as_deref()
            .map(|key| Arc::new(ElevenLabsApi::new(http.clone(), key)) as Arc<dyn SpeechApi>);
        let audio = AudioRenderer::new(
            speech,
            &settings.elevenlabs_voice_id,
            settings.elevenlabs_model.clone(),
        );

        let store = Arc::new(MoodStore::connect(settings.database_url.as_deref()).await);

        let ctx = Self::new(
            fetcher,
            scorer,
            store,
            summaries,
            audio,
            settings.enable_dev_endpoints,
        );
        info!(?ctx, "Application context ready");
        Ok(ctx)
    }

    pub async fn health(&self) -> Health {
        Health {
            status: "healthy",
            timestamp: Utc::now(),
            services: ServiceStatus {
                database: self.store.check_connection().await,
                sentiment_model: self.scorer.is_ready(),
                post_source: self.fetcher.is_ready(),
                text_generation: self.summaries.uses_model(),
                text_to_speech: self.audio.is_configured(),
            },
        }
    }

    /// Stored mood points, newest first.
    ///
    /// City filters run after the query, so a wider window is read and cut
    /// back to `limit` afterwards.
    pub async fn list_moods(&self, req: &MoodsRequest) -> Result<Vec<MoodPoint>, AppError> {
        if let (Some(min), Some(max)) = (req.min_score, req.max_score) {
            if min > max {
                return Err(AppError::BadRequest(format!(
                    "min_score {min} is greater than max_score {max}"
                )));
            }
        }
        let window = if req.only_city || req.unique_per_city {
            req.limit.saturating_mul(5).max(LATEST_WINDOW)
        } else {
            req.limit
        };

        let mut query = MoodQuery::new(window).score_range(req.min_score, req.max_score);
        if let Some(source) = &req.source {
            query = query.source(source.clone());
        }
        if let Some(hours) = req.hours {
            query = query.hours(hours);
        }

        let mut points = self.store.get_moods(&query).await?;
        if req.only_city {
            points.retain(MoodPoint::is_city_anchored);
        }
        if req.unique_per_city {
            points = latest_per_city(points);
        }
        points.truncate(req.limit);
        Ok(points)
    }

    pub async fn refresh(
        &self,
        mode: RefreshMode,
        reddit_only: bool,
        limit: usize,
    ) -> Result<RefreshReport, AppError> {
        Ok(self.pipeline.refresh(mode, reddit_only, limit).await?)
    }

    pub async fn summary(&self) -> Result<SummaryResponse, AppError> {
        let latest = self.summaries.get_latest_summary(&self.store).await?;
        Ok(SummaryResponse {
            summary: latest.text.to_string(),
            timestamp: Utc::now(),
            data_points: latest.points,
        })
    }

    /// Render the latest summary to speech in the requested envelope.
    #[instrument(level = "info", skip(self))]
    pub async fn summary_audio(
        &self,
        format: AudioFormat,
        voice: Option<&str>,
        model: Option<&str>,
    ) -> Result<AudioPayload, AppError> {
        if !self.audio.is_configured() {
            return Err(crate::tts::TtsError::NotConfigured("ELEVENLABS_API_KEY").into());
        }
        let latest = self.summaries.get_latest_summary(&self.store).await?;
        let audio = self.audio.synthesize(&latest.text, voice, model).await?;
        Ok(AudioPayload::new(format, audio, &latest.text))
    }

    pub async fn stats(&self) -> Result<MoodStatistics, AppError> {
        Ok(self.store.get_statistics().await?)
    }

    fn city(&self, name: &str) -> Result<&City, AppError> {
        self.cities
            .find(name)
            .ok_or_else(|| SourceError::UnknownCity(name.to_string()).into())
    }

    /// Fetch, score and optionally persist live posts for `city`.
    async fn live_posts(
        &self,
        city: &City,
        limit: usize,
        save: bool,
    ) -> Result<Vec<PostItem>, AppError> {
        let posts = self.fetcher.fetch_city_posts(&city.name, limit).await?;
        let mut items = Vec::with_capacity(posts.len());
        let mut points = Vec::new();
        for post in &posts {
            let sentiment = self.scorer.analyze(&post.text).await;
            items.push(PostItem::from_post(post, &city.name, sentiment));
            if save {
                match MoodPoint::from_post(post, sentiment, Utc::now()) {
                    Ok(point) => points.push(point),
                    Err(e) => warn!(id = ?post.id, error = %e, "Skipping post"),
                }
            }
        }
        if save {
            self.store.insert_posts(items.clone()).await?;
            self.store.insert_moods(points).await?;
            info!(city = %city.name, count = items.len(), "Saved live city posts");
        }
        Ok(items)
    }

    /// Posts for a curated city, from the store or fetched live.
    #[instrument(level = "info", skip(self))]
    pub async fn posts(
        &self,
        city: &str,
        limit: usize,
        live: bool,
        save: bool,
    ) -> Result<CityPosts, AppError> {
        let city = self.city(city)?;
        let posts = if live {
            self.live_posts(city, limit, save).await?
        } else {
            self.store.get_posts_by_city(&city.name, limit).await?
        };
        Ok(CityPosts {
            city: city.name.clone(),
            count: posts.len(),
            posts,
        })
    }

    /// Posts for a curated city plus a summary of its recorded mood.
    ///
    /// Live posts are always persisted so the summary reflects them.
    #[instrument(level = "info", skip(self))]
    pub async fn city_posts(
        &self,
        city: &str,
        limit: usize,
        live: bool,
    ) -> Result<CityReport, AppError> {
        let city = self.city(city)?;
        let posts = if live {
            self.live_posts(city, limit, true).await?
        } else {
            self.store.get_posts_by_city(&city.name, limit).await?
        };
        let summary = self.summaries.city_summary(&self.store, &city.name).await?;
        Ok(CityReport {
            city: city.name.clone(),
            posts,
            summary: summary.to_string(),
        })
    }

    /// Stored posts of the curated city nearest `(lat, lng)`.
    pub async fn posts_near(
        &self,
        lat: f64,
        lng: f64,
        limit: usize,
        within_km: f64,
    ) -> Result<NearbyPosts, AppError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(AppError::BadRequest(format!(
                "coordinates out of range: ({lat}, {lng})"
            )));
        }
        let nearest = self.cities.nearest(lat, lng, within_km).ok_or_else(|| {
            AppError::NotFound(format!(
                "no curated city within {within_km} km of ({lat}, {lng})"
            ))
        })?;
        let posts = self
            .store
            .get_posts_by_city(&nearest.city.name, limit)
            .await?;
        Ok(NearbyPosts {
            city: nearest,
            posts,
        })
    }

    /// One sample mood point per curated city.
    #[instrument(level = "info", skip(self))]
    pub async fn seed(&self) -> Result<DevReport, AppError> {
        if !self.dev_enabled {
            return Err(AppError::DevDisabled("seed"));
        }
        let posts: Vec<RawPost> = {
            let mut rng = rand::rng();
            self.cities
                .cities()
                .iter()
                .map(|city| {
                    let text = synthetic::SAMPLE_TEXTS
                        .choose(&mut rng)
                        .copied()
                        .unwrap_or_default();
                    let source = SEED_SOURCES.choose(&mut rng).copied().unwrap_or("reddit");
                    let mut post =
                        RawPost::new(source, format!("{text} (seeded for {})", city.name));
                    post.lat = Some(city.lat);
                    post.lng = Some(city.lng);
                    post.city_name = Some(city.name.clone());
                    post.country = city.country();
                    post.is_fallback = true;
                    post
                })
                .collect()
        };
        let count = self.pipeline.ingest(&posts).await?;
        info!(count, "Seeded mood points");
        Ok(DevReport {
            message: format!("Seeded {count} mood points (one per curated city)"),
            count,
        })
    }

    pub async fn clear(&self) -> Result<DevReport, AppError> {
        if !self.dev_enabled {
            return Err(AppError::DevDisabled("clear"));
        }
        self.store.clear().await?;
        warn!("Cleared all mood points and posts");
        Ok(DevReport {
            message: "Cleared all mood points and posts".to_string(),
            count: 0,
        })
    }

    /// Read up to `count` deduplicated stream posts, giving up after `max_wait`.
    #[instrument(level = "info", skip(self))]
    pub async fn collect(&self, count: usize, max_wait: Duration) -> Result<Vec<RawPost>, AppError> {
        if !self.fetcher.is_ready() {
            return Err(SourceError::NotConfigured(NO_UPSTREAM).into());
        }
        let cancel = CancellationToken::new();
        let (sink, mut rx) = PostSink::channel(DEDUP_CAPACITY);
        let producers = self.fetcher.start_streams(sink, cancel.clone());

        let mut collected = Vec::with_capacity(count);
        let deadline = tokio::time::sleep(max_wait);
        tokio::pin!(deadline);
        while collected.len() < count {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(collected = collected.len(), wanted = count, "Collection timed out");
                    break;
                }
                next = rx.recv() => match next {
                    Some(post) => {
                        debug!(n = collected.len() + 1, source = %post.source, "Collected post");
                        collected.push(post);
                    }
                    None => break,
                },
            }
        }

        cancel.cancel();
        drop(rx);
        for result in futures::future::join_all(producers).await {
            if let Err(e) = result {
                warn!(error = %e, "Stream producer task failed");
            }
        }
        info!(count = collected.len(), "Collection finished");
        Ok(collected)
    }

    /// Spawn the scheduled refresh loop and the stream drivers.
    ///
    /// Every returned task stops once `cancel` fires; await them to finish
    /// any write in flight.
    pub fn start_background(
        &self,
        refresh_every: Option<Duration>,
        streams: bool,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(interval) = refresh_every {
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                pipeline.run_scheduler(interval, cancel).await;
            }));
        }

        if streams {
            if self.fetcher.is_ready() {
                let (sink, rx) = PostSink::channel(DEDUP_CAPACITY);
                handles.extend(self.fetcher.start_streams(sink, cancel.clone()));
                let pipeline = Arc::clone(&self.pipeline);
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    pipeline.consume_stream(rx, cancel).await;
                }));
            } else {
                warn!("Streams enabled but no upstream is configured; skipping");
            }
        }

        info!(tasks = handles.len(), "Background tasks started");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::tests::StubUpstream;
    use crate::summary::SummarySettings;
    use crate::tts::tests::FakeSpeech;
    use crate::tts::DEFAULT_VOICE_ID;

    fn directory() -> Arc<CityDirectory> {
        Arc::new(CityDirectory::new(vec![
            City::new("Toronto, Canada", 43.6532, -79.3832),
            City::new("Lima, Peru", -12.0464, -77.0428),
        ]))
    }

    fn context(
        upstreams: Vec<Arc<StubUpstream>>,
        policy: FallbackPolicy,
        speech: Option<Arc<FakeSpeech>>,
        dev_enabled: bool,
    ) -> AppContext {
        let upstreams = upstreams
            .into_iter()
            .map(|u| u as Arc<dyn Upstream>)
            .collect();
        let speech = speech.map(|s| s as Arc<dyn SpeechApi>);
        AppContext::new(
            Arc::new(PostFetcher::new(upstreams, directory(), policy)),
            Arc::new(SentimentScorer::keyword_only()),
            Arc::new(MoodStore::in_memory()),
            SummaryGenerator::new(SummarySettings::default(), None),
            AudioRenderer::new(speech, DEFAULT_VOICE_ID, None),
            dev_enabled,
        )
    }

    fn city_texts() -> Vec<&'static str> {
        vec![
            "Toronto feels wonderful and happy this spring",
            "Great festival downtown, everyone is excited",
            "Transit delays are terrible and stressful today",
            "too short",
            "meh",
        ]
    }

    #[tokio::test]
    async fn test_health_reports_configuration() {
        let ctx = context(vec![], FallbackPolicy::Strict, None, false);
        let health = ctx.health().await;
        assert_eq!(health.status, "healthy");
        assert!(!health.services.database);
        assert!(!health.services.sentiment_model);
        assert!(!health.services.post_source);
        assert!(!health.services.text_to_speech);
    }

    #[tokio::test]
    async fn test_seed_requires_dev_flag() {
        let ctx = context(vec![], FallbackPolicy::Strict, None, false);
        assert!(matches!(ctx.seed().await, Err(AppError::DevDisabled("seed"))));
        assert!(matches!(ctx.clear().await, Err(AppError::DevDisabled("clear"))));
    }

    #[tokio::test]
    async fn test_seed_then_summary_and_clear() {
        let ctx = context(vec![], FallbackPolicy::Strict, None, true);
        let report = ctx.seed().await.unwrap();
        assert_eq!(report.count, 2);

        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.total_points, 2);

        let summary = ctx.summary().await.unwrap();
        assert_eq!(summary.data_points, 2);
        assert!(summary.summary.starts_with("Global emotional overview: 2 recent mood points"));

        ctx.clear().await.unwrap();
        assert_eq!(ctx.stats().await.unwrap().total_points, 0);
    }

    #[tokio::test]
    async fn test_list_moods_unique_per_city() {
        let ctx = context(vec![], FallbackPolicy::Lenient, None, false);
        ctx.refresh(RefreshMode::PerCity, false, 6).await.unwrap();

        let all = ctx
            .list_moods(&MoodsRequest {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 6);

        let unique = ctx
            .list_moods(&MoodsRequest {
                limit: 100,
                unique_per_city: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unique.len(), 2);
        assert!(unique.iter().all(MoodPoint::is_city_anchored));
    }

    #[tokio::test]
    async fn test_list_moods_rejects_inverted_range() {
        let ctx = context(vec![], FallbackPolicy::Strict, None, false);
        let err = ctx
            .list_moods(&MoodsRequest {
                limit: 10,
                min_score: Some(0.5),
                max_score: Some(-0.5),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_live_posts_filter_short_and_save() {
        let stub = Arc::new(StubUpstream::new("reddit", &city_texts()));
        let ctx = context(vec![stub], FallbackPolicy::Strict, None, false);

        let live = ctx.posts("Toronto", 5, true, true).await.unwrap();
        assert_eq!(live.city, "Toronto, Canada");
        assert_eq!(live.count, 3);
        assert!(live.posts.iter().all(|p| p.platform == "reddit"));

        let stored = ctx.posts("toronto", 10, false, false).await.unwrap();
        assert_eq!(stored.count, 3);
        assert_eq!(ctx.stats().await.unwrap().total_points, 3);
    }

    #[tokio::test]
    async fn test_live_posts_without_save_store_nothing() {
        let stub = Arc::new(StubUpstream::new("reddit", &city_texts()));
        let ctx = context(vec![stub], FallbackPolicy::Strict, None, false);

        ctx.posts("Toronto", 5, true, false).await.unwrap();
        assert_eq!(ctx.posts("Toronto", 10, false, false).await.unwrap().count, 0);
        assert_eq!(ctx.stats().await.unwrap().total_points, 0);
    }

    #[tokio::test]
    async fn test_city_report_includes_city_summary() {
        let stub = Arc::new(StubUpstream::new("reddit", &city_texts()));
        let ctx = context(vec![stub], FallbackPolicy::Strict, None, false);

        let report = ctx.city_posts("Toronto", 5, true).await.unwrap();
        assert_eq!(report.posts.len(), 3);
        assert!(report
            .summary
            .starts_with("Emotional overview for Toronto, Canada: Analyzed 3 recent"));
    }

    #[tokio::test]
    async fn test_unknown_city_is_not_found() {
        let ctx = context(vec![], FallbackPolicy::Lenient, None, false);
        let err = ctx.posts("Atlantis", 5, false, false).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_posts_near() {
        let stub = Arc::new(StubUpstream::new("reddit", &city_texts()));
        let ctx = context(vec![stub], FallbackPolicy::Strict, None, false);
        ctx.posts("Toronto", 5, true, true).await.unwrap();

        let near = ctx.posts_near(43.70, -79.40, 10, 50.0).await.unwrap();
        assert_eq!(near.city.city.name, "Toronto, Canada");
        assert!((near.city.distance_km - 5.4).abs() < 0.05);
        assert_eq!(near.posts.len(), 3);

        let err = ctx.posts_near(0.0, 0.0, 10, 50.0).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_summary_audio_requires_key() {
        let ctx = context(vec![], FallbackPolicy::Strict, None, false);
        let err = ctx
            .summary_audio(AudioFormat::Base64, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.meta()["missing"], "ELEVENLABS_API_KEY");
    }

    #[tokio::test]
    async fn test_summary_audio_data_url() {
        let speech = Arc::new(FakeSpeech::new(&[]));
        let ctx = context(vec![], FallbackPolicy::Strict, Some(speech), false);

        let payload = ctx
            .summary_audio(AudioFormat::Url, None, None)
            .await
            .unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["url"]
            .as_str()
            .unwrap()
            .starts_with("data:audio/mpeg;base64,"));
        assert_eq!(json["summary"], crate::summary::NO_DATA_TEXT);
    }

    #[tokio::test]
    async fn test_collect_dedups_stream() {
        let mut stub = StubUpstream::new("reddit", &["first post", "second post", "third post"]);
        stub.posts[2].id = stub.posts[0].id.clone();
        let ctx = context(vec![Arc::new(stub)], FallbackPolicy::Strict, None, false);

        let posts = ctx.collect(5, Duration::from_millis(200)).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].text, "first post");
    }

    #[tokio::test]
    async fn test_collect_without_upstream() {
        let ctx = context(vec![], FallbackPolicy::Lenient, None, false);
        let err = ctx.collect(5, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_background_streams_store_and_stop() {
        let stub = Arc::new(StubUpstream::new("reddit", &["Lima is lovely tonight", "calm evening"]));
        let ctx = context(vec![stub], FallbackPolicy::Strict, None, false);
        let cancel = CancellationToken::new();

        let handles = ctx.start_background(None, true, &cancel);
        assert_eq!(handles.len(), 2);

        for _ in 0..50 {
            if ctx.stats().await.unwrap().total_points == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let moods = ctx
            .list_moods(&MoodsRequest {
                limit: 10,
                only_city: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(moods.len(), 1);
        assert_eq!(moods[0].city_name.as_deref(), Some("Lima, Peru"));
    }
}
