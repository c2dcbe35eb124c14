//! Mood point and post persistence with an in-memory fallback.
//!
//! The backing store is a SQL database holding each record as a JSON document
//! next to the few columns queries filter and sort on. If the database cannot be
//! reached at startup the store logs once and keeps everything in bounded
//! in-memory ring buffers for the rest of the process lifetime.
//!
//! Both backends apply the same [`MoodQuery`] semantics: only matching records,
//! newest first, at most `limit` of them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::models::{MoodPoint, MoodStatistics, PostItem};
use crate::utils::round_to;

/// Most-recent records kept per collection by the in-memory backend.
pub const MEMORY_CAPACITY: usize = 1000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS moods (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp_ms INTEGER NOT NULL,
        lat REAL NOT NULL,
        lng REAL NOT NULL,
        source TEXT NOT NULL,
        label TEXT NOT NULL,
        score REAL NOT NULL,
        city_name TEXT,
        doc TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_moods_timestamp ON moods (timestamp_ms DESC)",
    "CREATE INDEX IF NOT EXISTS idx_moods_location ON moods (lat, lng)",
    "CREATE INDEX IF NOT EXISTS idx_moods_source ON moods (source)",
    "CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        city_name TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        doc TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_posts_city ON posts (city_name, created_at_ms DESC)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document encoding error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Filters for [`MoodStore::get_moods`].
#[derive(Debug, Clone, PartialEq)]
pub struct MoodQuery {
    pub limit: usize,
    pub source: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    /// Only points observed within the last `hours`.
    pub hours: Option<i64>,
    pub city_name: Option<String>,
}

impl MoodQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            source: None,
            min_score: None,
            max_score: None,
            hours: None,
            city_name: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn score_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_score = min;
        self.max_score = max;
        self
    }

    pub fn hours(mut self, hours: i64) -> Self {
        self.hours = Some(hours);
        self
    }

    pub fn city(mut self, city_name: impl Into<String>) -> Self {
        self.city_name = Some(city_name.into());
        self
    }

    /// Oldest timestamp still in the window. A window reaching past the
    /// representable range has no cutoff.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.hours
            .and_then(ChronoDuration::try_hours)
            .and_then(|window| now.checked_sub_signed(window))
    }

    fn matches(&self, point: &MoodPoint, cutoff: Option<DateTime<Utc>>) -> bool {
        self.source.as_ref().is_none_or(|s| &point.source == s)
            && self.min_score.is_none_or(|min| point.score >= min)
            && self.max_score.is_none_or(|max| point.score <= max)
            && cutoff.is_none_or(|c| point.timestamp >= c)
            && self
                .city_name
                .as_ref()
                .is_none_or(|c| point.city_name.as_ref() == Some(c))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    moods: VecDeque<MoodPoint>,
    posts: VecDeque<PostItem>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, items: impl IntoIterator<Item = T>) {
    for item in items {
        buf.push_back(item);
        while buf.len() > MEMORY_CAPACITY {
            buf.pop_front();
        }
    }
}

#[derive(Debug)]
enum Backend {
    Sql(SqlitePool),
    Memory(Mutex<MemoryState>),
}

/// Store for mood points and per-city posts.
#[derive(Debug)]
pub struct MoodStore {
    backend: Backend,
}

impl MoodStore {
    /// A store that never touches a database.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(MemoryState::default())),
        }
    }

    /// Connect to the backing store, falling back to memory on any failure.
    #[instrument(level = "info", skip_all)]
    pub async fn connect(database_url: Option<&str>) -> Self {
        let Some(url) = database_url else {
            info!("No database configured; using in-memory storage");
            return Self::in_memory();
        };

        // every connection to an in-memory SQLite database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await;

        match pool {
            Ok(pool) => match Self::from_pool(pool).await {
                Ok(store) => {
                    info!("Connected to database");
                    store
                }
                Err(e) => {
                    warn!(error = %e, "Database schema setup failed; using in-memory storage (data will be lost on restart)");
                    Self::in_memory()
                }
            },
            Err(e) => {
                warn!(error = %e, "Database connection failed; using in-memory storage (data will be lost on restart)");
                Self::in_memory()
            }
        }
    }

    /// Wrap an open pool, creating tables and indexes if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            backend: Backend::Sql(pool),
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Sql(_))
    }

    /// Ping the backing store. Always `false` for the in-memory backend.
    pub async fn check_connection(&self) -> bool {
        match &self.backend {
            Backend::Sql(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
            Backend::Memory(_) => false,
        }
    }

    /// Append mood points, preserving their order.
    #[instrument(level = "debug", skip_all, fields(count = moods.len()))]
    pub async fn insert_moods(&self, moods: Vec<MoodPoint>) -> Result<(), StoreError> {
        if moods.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                push_bounded(&mut state.moods, moods);
            }
            Backend::Sql(pool) => {
                let count = moods.len();
                let mut tx = pool.begin().await?;
                for mood in &moods {
                    sqlx::query(
                        "INSERT INTO moods (timestamp_ms, lat, lng, source, label, score, city_name, doc)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(mood.timestamp.timestamp_millis())
                    .bind(mood.lat)
                    .bind(mood.lng)
                    .bind(&mood.source)
                    .bind(&mood.label)
                    .bind(mood.score)
                    .bind(&mood.city_name)
                    .bind(serde_json::to_string(mood)?)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                debug!(count, "Inserted mood points");
            }
        }
        Ok(())
    }

    pub async fn get_moods(&self, query: &MoodQuery) -> Result<Vec<MoodPoint>, StoreError> {
        let cutoff = query.cutoff(Utc::now());
        match &self.backend {
            Backend::Memory(state) => {
                let state = state.lock().await;
                // newest insertions first so equal timestamps keep recency order
                let mut moods: Vec<MoodPoint> = state
                    .moods
                    .iter()
                    .rev()
                    .filter(|m| query.matches(m, cutoff))
                    .cloned()
                    .collect();
                moods.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                moods.truncate(query.limit);
                Ok(moods)
            }
            Backend::Sql(pool) => {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT doc FROM moods WHERE 1 = 1");
                if let Some(source) = &query.source {
                    qb.push(" AND source = ").push_bind(source.clone());
                }
                if let Some(min) = query.min_score {
                    qb.push(" AND score >= ").push_bind(min);
                }
                if let Some(max) = query.max_score {
                    qb.push(" AND score <= ").push_bind(max);
                }
                if let Some(cutoff) = cutoff {
                    qb.push(" AND timestamp_ms >= ").push_bind(cutoff.timestamp_millis());
                }
                if let Some(city) = &query.city_name {
                    qb.push(" AND city_name = ").push_bind(city.clone());
                }
                qb.push(" ORDER BY timestamp_ms DESC, id DESC LIMIT ")
                    .push_bind(query.limit as i64);

                let rows = qb.build().fetch_all(pool).await?;
                rows.iter()
                    .map(|row| {
                        let doc: String = row.try_get("doc")?;
                        Ok(serde_json::from_str(&doc)?)
                    })
                    .collect()
            }
        }
    }

    /// Unfiltered aggregates over every stored mood point.
    pub async fn get_statistics(&self) -> Result<MoodStatistics, StoreError> {
        match &self.backend {
            Backend::Memory(state) => {
                let state = state.lock().await;
                let mut stats = MoodStatistics {
                    total_points: state.moods.len() as u64,
                    ..Default::default()
                };
                let mut sum = 0.0;
                for mood in &state.moods {
                    *stats.by_source.entry(mood.source.clone()).or_default() += 1;
                    *stats.by_label.entry(mood.label.clone()).or_default() += 1;
                    sum += mood.score;
                }
                if !state.moods.is_empty() {
                    stats.average_score = round_to(sum / state.moods.len() as f64, 3);
                }
                Ok(stats)
            }
            Backend::Sql(pool) => {
                let row = sqlx::query("SELECT COUNT(*) AS total, AVG(score) AS avg FROM moods")
                    .fetch_one(pool)
                    .await?;
                let total: i64 = row.try_get("total")?;
                let avg: Option<f64> = row.try_get("avg")?;

                Ok(MoodStatistics {
                    total_points: total as u64,
                    by_source: Self::count_by(pool, "source").await?,
                    by_label: Self::count_by(pool, "label").await?,
                    average_score: round_to(avg.unwrap_or(0.0), 3),
                })
            }
        }
    }

    async fn count_by(
        pool: &SqlitePool,
        column: &'static str,
    ) -> Result<BTreeMap<String, u64>, StoreError> {
        let sql = format!("SELECT {column} AS key, COUNT(*) AS n FROM moods GROUP BY {column}");
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let n: i64 = row.try_get("n")?;
            out.insert(key, n as u64);
        }
        Ok(out)
    }

    pub async fn insert_posts(&self, posts: Vec<PostItem>) -> Result<(), StoreError> {
        if posts.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                push_bounded(&mut state.posts, posts);
            }
            Backend::Sql(pool) => {
                let mut tx = pool.begin().await?;
                for post in &posts {
                    sqlx::query("INSERT INTO posts (city_name, created_at_ms, doc) VALUES (?, ?, ?)")
                        .bind(&post.city_name)
                        .bind(post.created_at.timestamp_millis())
                        .bind(serde_json::to_string(post)?)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Stored posts for one city, newest first.
    pub async fn get_posts_by_city(
        &self,
        city_name: &str,
        limit: usize,
    ) -> Result<Vec<PostItem>, StoreError> {
        match &self.backend {
            Backend::Memory(state) => {
                let state = state.lock().await;
                let mut posts: Vec<PostItem> = state
                    .posts
                    .iter()
                    .rev()
                    .filter(|p| p.city_name == city_name)
                    .cloned()
                    .collect();
                posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                posts.truncate(limit);
                Ok(posts)
            }
            Backend::Sql(pool) => {
                let rows = sqlx::query(
                    "SELECT doc FROM posts WHERE city_name = ?
                     ORDER BY created_at_ms DESC, id DESC LIMIT ?",
                )
                .bind(city_name)
                .bind(limit as i64)
                .fetch_all(pool)
                .await?;
                rows.iter()
                    .map(|row| {
                        let doc: String = row.try_get("doc")?;
                        Ok(serde_json::from_str(&doc)?)
                    })
                    .collect()
            }
        }
    }

    /// Remove every mood point and post.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                state.moods.clear();
                state.posts.clear();
            }
            Backend::Sql(pool) => {
                sqlx::query("DELETE FROM moods").execute(pool).await?;
                sqlx::query("DELETE FROM posts").execute(pool).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: usize, score: f64, source: &str, minutes_ago: i64) -> MoodPoint {
        MoodPoint {
            lat: 10.0,
            lng: 20.0,
            label: if score > 0.3 {
                "joyful"
            } else if score < -0.3 {
                "anxious"
            } else {
                "neutral"
            }
            .to_string(),
            score,
            source: source.to_string(),
            text: Some(format!("point {i}")),
            city_name: Some(format!("City {}", i % 3)),
            timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
            is_fallback: false,
            country: None,
            platform: Some(source.to_string()),
            post_text: None,
            post_url: None,
            post_author: None,
            post_id: Some(i.to_string()),
        }
    }

    fn sample() -> Vec<MoodPoint> {
        (0..30)
            .map(|i| {
                let score = (i as f64 / 15.0) - 1.0;
                let source = if i % 2 == 0 { "reddit" } else { "twitter" };
                point(i, score, source, (i as i64 * 37) % 300)
            })
            .collect()
    }

    async fn sql_store() -> MoodStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");
        MoodStore::from_pool(pool).await.unwrap()
    }

    fn assert_newest_first(moods: &[MoodPoint]) {
        assert!(moods.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_memory_eviction_keeps_most_recent() {
        let store = MoodStore::in_memory();
        for i in 0..1200 {
            store.insert_moods(vec![point(i, 0.0, "reddit", 0)]).await.unwrap();
        }
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_points, 1000);

        let Backend::Memory(state) = &store.backend else {
            panic!("expected memory backend");
        };
        let state = state.lock().await;
        assert_eq!(state.moods.front().unwrap().post_id.as_deref(), Some("200"));
        assert_eq!(state.moods.back().unwrap().post_id.as_deref(), Some("1199"));
    }

    #[tokio::test]
    async fn test_limit_and_order_hold_for_both_backends() {
        for store in [MoodStore::in_memory(), sql_store().await] {
            store.insert_moods(sample()).await.unwrap();
            for limit in [0, 1, 7, 30, 100] {
                let moods = store.get_moods(&MoodQuery::new(limit)).await.unwrap();
                assert!(moods.len() <= limit);
                assert_newest_first(&moods);
            }
        }
    }

    #[tokio::test]
    async fn test_filters_agree_across_backends() {
        let memory = MoodStore::in_memory();
        let sql = sql_store().await;
        memory.insert_moods(sample()).await.unwrap();
        sql.insert_moods(sample()).await.unwrap();

        let queries = [
            MoodQuery::new(100).source("reddit"),
            MoodQuery::new(100).score_range(Some(-0.2), Some(0.5)),
            MoodQuery::new(5).source("twitter").score_range(Some(0.0), None),
            MoodQuery::new(100).hours(2),
            MoodQuery::new(100).city("City 1"),
        ];
        for query in queries {
            let a = memory.get_moods(&query).await.unwrap();
            let b = sql.get_moods(&query).await.unwrap();
            let ids = |v: &[MoodPoint]| v.iter().map(|m| m.post_id.clone()).collect::<Vec<_>>();
            assert_eq!(ids(&a), ids(&b), "query {query:?}");
            assert!(a.iter().all(|m| query.matches(m, query.cutoff(Utc::now()))));
        }
    }

    #[tokio::test]
    async fn test_statistics_agree_across_backends() {
        let memory = MoodStore::in_memory();
        let sql = sql_store().await;
        memory.insert_moods(sample()).await.unwrap();
        sql.insert_moods(sample()).await.unwrap();

        let a = memory.get_statistics().await.unwrap();
        let b = sql.get_statistics().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.total_points, 30);
        assert_eq!(a.by_source.get("reddit"), Some(&15));
    }

    #[tokio::test]
    async fn test_empty_statistics() {
        let stats = MoodStore::in_memory().get_statistics().await.unwrap();
        assert_eq!(stats, MoodStatistics::default());
        let stats = sql_store().await.get_statistics().await.unwrap();
        assert_eq!(stats.total_points, 0);
        assert_eq!(stats.average_score, 0.0);
    }

    #[tokio::test]
    async fn test_posts_by_city() {
        for store in [MoodStore::in_memory(), sql_store().await] {
            let posts = (0..4)
                .map(|i| PostItem {
                    id: Some(i.to_string()),
                    city_name: if i < 3 { "Toronto, Canada" } else { "Lima, Peru" }.to_string(),
                    country: None,
                    platform: "reddit".to_string(),
                    text: format!("post {i}"),
                    url: None,
                    author: None,
                    score: 0.1,
                    label: "neutral".to_string(),
                    created_at: Utc::now() - ChronoDuration::minutes(i),
                })
                .collect();
            store.insert_posts(posts).await.unwrap();
            let got = store.get_posts_by_city("Toronto, Canada", 2).await.unwrap();
            assert_eq!(got.len(), 2);
            assert_eq!(got[0].id.as_deref(), Some("0"));
            assert!(store.get_posts_by_city("Oslo", 5).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_clear() {
        for store in [MoodStore::in_memory(), sql_store().await] {
            store.insert_moods(sample()).await.unwrap();
            store.clear().await.unwrap();
            assert!(store.get_moods(&MoodQuery::new(10)).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unreachable_database_falls_back_to_memory() {
        let store = MoodStore::connect(Some("sqlite:/definitely/not/here/pulse.db")).await;
        assert!(!store.is_persistent());
        assert!(!store.check_connection().await);
        store.insert_moods(sample()).await.unwrap();
        assert_eq!(store.get_moods(&MoodQuery::new(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_connect_to_memory_database() {
        let store = MoodStore::connect(Some("sqlite::memory:")).await;
        assert!(store.is_persistent());
        assert!(store.check_connection().await);
    }

    #[tokio::test]
    async fn test_huge_hours_window_keeps_everything() {
        for store in [MoodStore::in_memory(), sql_store().await] {
            store.insert_moods(sample()).await.unwrap();
            let all = store.get_moods(&MoodQuery::new(100)).await.unwrap();
            for hours in [10_000_000_000, i64::MAX] {
                let got = store
                    .get_moods(&MoodQuery::new(100).hours(hours))
                    .await
                    .unwrap();
                assert_eq!(got.len(), all.len());
            }
        }
    }
}
