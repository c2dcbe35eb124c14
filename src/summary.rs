//! Mood summaries: aggregation, prompt building, generation and a single-slot cache.
//!
//! A summary is generated from a window of mood points. With a text
//! generation backend configured, the aggregate numbers go into a prompt that
//! runs through the [`ModelCascade`]; when every model fails, the caller gets
//! [`SummaryError::AllModelsFailed`]. Without a backend, a deterministic
//! sentence is built locally from the same numbers.
//!
//! Results are cached in one slot keyed by the window shape (count, first and
//! last timestamps), the active style, the city-inclusion flag and the
//! optional city filter. A different key replaces the slot; an entry older
//! than the TTL is regenerated.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::llm::ModelCascade;
use crate::models::MoodPoint;
use crate::store::{MoodQuery, MoodStore, StoreError};
use crate::utils::{collapse_whitespace, round_to};

pub const NO_DATA_TEXT: &str = "No mood data available yet.";

/// Points considered by the latest-per-city summary.
pub const LATEST_WINDOW: usize = 500;

const SYSTEM_PROMPT: &str = "You are an empathetic AI that analyzes social media sentiment to \
understand how people feel in different cities. Your summaries should be insightful, human, and \
narrative-driven. Focus on the lived experiences and emotions of city residents based on their \
Reddit posts. Avoid being overly statistical - instead, paint a picture of the city's emotional \
atmosphere. Be specific about what's making people happy, anxious, or neutral.";

const CONTROL_TOKENS: &[&str] = &[
    "<s>",
    "</s>",
    "[/s]",
    "[/S]",
    "[INST]",
    "[/INST]",
    "[B_INST]",
    "[/B_INST]",
    "[B_Assitant]",
    "[/B_Assitant]",
    "B_INST",
    "/B_INST",
    "<|im_start|>",
    "<|im_end|>",
    "<|assistant|>",
    "<|user|>",
];

static BRACKET_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[/?[A-Z_]+\]").unwrap());

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("all summary models failed ({}); last error: {last_error}", tried.join(", "))]
    AllModelsFailed {
        tried: Vec<String>,
        last_error: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tone directive passed to the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SummaryStyle {
    #[default]
    Concise,
    Trend,
    Narrative,
}

impl SummaryStyle {
    fn hint(&self) -> &'static str {
        match self {
            SummaryStyle::Concise => "Be succinct (3-5 sentences).",
            SummaryStyle::Trend => "Emphasize short-term movements, momentum, and balance shifts.",
            SummaryStyle::Narrative => "Use a calm, human tone; avoid statistics-heavy phrasing.",
        }
    }
}

impl FromStr for SummaryStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concise" => Ok(SummaryStyle::Concise),
            "trend" => Ok(SummaryStyle::Trend),
            "narrative" => Ok(SummaryStyle::Narrative),
            other => Err(format!("unknown summary style: {other}")),
        }
    }
}

impl fmt::Display for SummaryStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SummaryStyle::Concise => "concise",
            SummaryStyle::Trend => "trend",
            SummaryStyle::Narrative => "narrative",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SummarySettings {
    pub pos_threshold: f64,
    pub neg_threshold: f64,
    pub style: SummaryStyle,
    pub include_cities: bool,
    pub cache_ttl: Duration,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            pos_threshold: 0.3,
            neg_threshold: -0.3,
            style: SummaryStyle::Concise,
            include_cities: false,
            cache_ttl: Duration::from_secs(45),
        }
    }
}

/// Distribution and central tendency of a window of mood points.
#[derive(Debug, Clone, PartialEq)]
pub struct MoodAggregate {
    pub total: usize,
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
    pub average_score: f64,
    pub median_score: f64,
    /// City names in window order, repeats included.
    pub cities: Vec<String>,
}

impl MoodAggregate {
    pub fn from_points(points: &[MoodPoint], settings: &SummarySettings) -> Self {
        let total = points.len();
        let positive = points
            .iter()
            .filter(|p| p.score > settings.pos_threshold)
            .count();
        let negative = points
            .iter()
            .filter(|p| p.score < settings.neg_threshold)
            .count();

        let scores: Vec<f64> = points.iter().map(|p| p.score).sorted_by(f64::total_cmp).collect();
        let average_score = if scores.is_empty() {
            0.0
        } else {
            round_to(scores.iter().sum::<f64>() / scores.len() as f64, 3)
        };
        let median_score = match scores.len() {
            0 => 0.0,
            n if n % 2 == 1 => round_to(scores[n / 2], 3),
            n => round_to((scores[n / 2 - 1] + scores[n / 2]) / 2.0, 3),
        };

        Self {
            total,
            positive,
            neutral: total - positive - negative,
            negative,
            average_score,
            median_score,
            cities: points.iter().filter_map(|p| p.city_name.clone()).collect(),
        }
    }

    /// Share of the window, rounded to one decimal.
    pub fn pct(&self, n: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            round_to(n as f64 / self.total as f64 * 100.0, 1)
        }
    }

    pub fn tone(&self) -> &'static str {
        if self.positive > self.negative {
            "optimistic"
        } else if self.negative > self.positive {
            "concerned"
        } else {
            "balanced"
        }
    }
}

/// Render a score the way it reads in prose: always at least one decimal.
fn fmt_score(value: f64) -> String {
    let s = value.to_string();
    if s.contains('.') { s } else { format!("{value:.1}") }
}

/// Strip model control tokens and bracketed tags, then fold whitespace.
pub fn clean_output(text: &str) -> String {
    let mut cleaned = text.to_string();
    for token in CONTROL_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    let cleaned = BRACKET_TAG_RE.replace_all(&cleaned, "");
    collapse_whitespace(&cleaned)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    count: usize,
    first_ts: Option<DateTime<Utc>>,
    last_ts: Option<DateTime<Utc>>,
    style: SummaryStyle,
    include_cities: bool,
    city: Option<String>,
}

#[derive(Debug)]
struct CachedSummary {
    key: CacheKey,
    text: Arc<str>,
    stored_at: Instant,
}

/// Summary of the newest point per city.
#[derive(Debug, Clone)]
pub struct LatestSummary {
    pub text: Arc<str>,
    pub points: usize,
}

pub struct SummaryGenerator {
    settings: SummarySettings,
    cascade: Option<ModelCascade>,
    cache: Mutex<Option<CachedSummary>>,
}

impl fmt::Debug for SummaryGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryGenerator")
            .field("settings", &self.settings)
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

impl SummaryGenerator {
    pub fn new(settings: SummarySettings, cascade: Option<ModelCascade>) -> Self {
        Self {
            settings,
            cascade,
            cache: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SummarySettings {
        &self.settings
    }

    /// Whether a generation backend is configured.
    pub fn uses_model(&self) -> bool {
        self.cascade.is_some()
    }

    fn cache_key(&self, points: &[MoodPoint], city: Option<&str>) -> CacheKey {
        CacheKey {
            count: points.len(),
            first_ts: points.first().map(|p| p.timestamp),
            last_ts: points.last().map(|p| p.timestamp),
            style: self.settings.style,
            include_cities: self.settings.include_cities,
            city: city.map(str::to_string),
        }
    }

    /// Summarize `points`, optionally scoped to one city.
    #[instrument(level = "info", skip(self, points), fields(points = points.len()))]
    pub async fn generate_summary(
        &self,
        points: &[MoodPoint],
        city: Option<&str>,
    ) -> Result<Arc<str>, SummaryError> {
        if points.is_empty() {
            return Ok(Arc::from(NO_DATA_TEXT));
        }

        let key = self.cache_key(points, city);
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.as_ref() {
                if hit.key == key && hit.stored_at.elapsed() < self.settings.cache_ttl {
                    debug!("Summary cache hit");
                    return Ok(Arc::clone(&hit.text));
                }
            }
        }

        let agg = MoodAggregate::from_points(points, &self.settings);
        let text: Arc<str> = match &self.cascade {
            Some(cascade) => {
                let prompt = self.build_prompt(&agg, city);
                let raw = cascade.complete(SYSTEM_PROMPT, &prompt).await.map_err(|e| {
                    SummaryError::AllModelsFailed {
                        tried: e.tried,
                        last_error: e.last_error,
                    }
                })?;
                Arc::from(clean_output(&raw))
            }
            None => Arc::from(self.fallback_summary(&agg, city)),
        };
        info!(total = agg.total, tone = agg.tone(), "Generated summary");

        *self.cache.lock().await = Some(CachedSummary {
            key,
            text: Arc::clone(&text),
            stored_at: Instant::now(),
        });
        Ok(text)
    }

    /// Summary over the newest point of each city among the latest points.
    pub async fn get_latest_summary(&self, store: &MoodStore) -> Result<LatestSummary, SummaryError> {
        let recent = store.get_moods(&MoodQuery::new(LATEST_WINDOW)).await?;
        let latest = latest_per_city(recent);
        let text = self.generate_summary(&latest, None).await?;
        Ok(LatestSummary {
            text,
            points: latest.len(),
        })
    }

    /// Summary over the latest points recorded for `city`.
    pub async fn city_summary(&self, store: &MoodStore, city: &str) -> Result<Arc<str>, SummaryError> {
        let points = store
            .get_moods(&MoodQuery::new(LATEST_WINDOW).city(city))
            .await?;
        self.generate_summary(&points, Some(city)).await
    }

    pub fn build_prompt(&self, agg: &MoodAggregate, city: Option<&str>) -> String {
        let (pos, neu, neg) = (agg.pct(agg.positive), agg.pct(agg.neutral), agg.pct(agg.negative));
        let median = fmt_score(agg.median_score);

        if let Some(city) = city {
            return format!(
                "Analyze sentiment from {total} recent Reddit posts discussing {city}. \
                 Sentiment distribution: {pos:.1}% positive, {neu:.1}% neutral, {neg:.1}% negative. \
                 Average sentiment: {avg}, Median: {median}. \
                 Based on these Reddit discussions, write a natural, human-readable summary about \
                 the emotional climate and current mood in {city}. Focus on what people are \
                 experiencing and feeling in the city. Mention key themes like social life, \
                 infrastructure, work/career, relationships, or community issues if the sentiment \
                 suggests these. Write 4-6 sentences in a narrative style. Don't just recite \
                 statistics - tell a story about the city's current mood.",
                total = agg.total,
                avg = fmt_score(agg.average_score),
            );
        }

        let location_rule = if self.settings.include_cities {
            "You may mention at most 3 representative cities."
        } else {
            "Do not mention specific city or country names; speak at a global level."
        };
        format!(
            "Data window: {total} mood points using score thresholds (>{pos_t} positive, <{neg_t} negative). \
             Distribution: Positive {pos:.1}%, Neutral {neu:.1}%, Negative {neg:.1}%. \
             Median score: {median}. {location_rule} {hint} \
             Write one cohesive paragraph; no bullet lists.",
            total = agg.total,
            pos_t = fmt_score(self.settings.pos_threshold),
            neg_t = fmt_score(self.settings.neg_threshold),
            hint = self.settings.style.hint(),
        )
    }

    pub fn fallback_summary(&self, agg: &MoodAggregate, city: Option<&str>) -> String {
        if agg.total == 0 {
            return NO_DATA_TEXT.to_string();
        }
        let (pos, neu, neg) = (agg.pct(agg.positive), agg.pct(agg.neutral), agg.pct(agg.negative));
        let median = fmt_score(agg.median_score);
        let tone = agg.tone();

        if let Some(city) = city {
            return format!(
                "Emotional overview for {city}: Analyzed {total} recent social media posts. \
                 Sentiment distribution shows {pos:.1}% positive, {neu:.1}% neutral, and {neg:.1}% \
                 negative expressions. The median sentiment score is {median}, indicating the \
                 overall emotional climate in {city} appears {tone}. This reflects the current \
                 mood based on recent online discussions from the city.",
                total = agg.total,
            );
        }

        let place = if self.settings.include_cities {
            if agg.cities.is_empty() {
                "various regions".to_string()
            } else {
                agg.cities.iter().take(4).join(", ")
            }
        } else {
            match agg.cities.iter().unique().count() {
                0 => "multiple regions worldwide".to_string(),
                n => format!("{n} cities worldwide"),
            }
        };

        format!(
            "Global emotional overview: {total} recent mood points across {place}. \
             Positive {pos:.1}%, Neutral {neu:.1}%, Negative {neg:.1}%. \
             Median sentiment score {median}. Emotional climate appears {tone}.",
            total = agg.total,
        )
    }
}

/// Keep the first (newest) point per city; points without a city are dropped.
pub fn latest_per_city(points: Vec<MoodPoint>) -> Vec<MoodPoint> {
    points
        .into_iter()
        .filter(|p| p.city_name.is_some())
        .unique_by(|p| p.city_name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::tests::ScriptedGenerator;
    use crate::llm::{DEFAULT_MODEL, FALLBACK_MODELS};
    use crate::models::{RawPost, Sentiment};
    use chrono::Duration as ChronoDuration;

    fn point(score: f64, city: Option<&str>, minutes_ago: i64) -> MoodPoint {
        let mut post = RawPost::new("reddit", "text");
        post.city_name = city.map(str::to_string);
        let sentiment = Sentiment {
            label: crate::models::MoodLabel::Neutral,
            score,
        };
        MoodPoint::from_post(&post, sentiment, Utc::now() - ChronoDuration::minutes(minutes_ago))
            .unwrap()
    }

    fn sixty_twenty_twenty() -> Vec<MoodPoint> {
        let scores = [0.8, 0.7, 0.6, 0.5, 0.4, 0.9, -0.6, -0.8, 0.1, -0.1];
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| point(*s, Some("Toronto, Canada"), i as i64))
            .collect()
    }

    #[test]
    fn test_aggregate_counts_and_median() {
        let agg = MoodAggregate::from_points(&sixty_twenty_twenty(), &SummarySettings::default());
        assert_eq!((agg.positive, agg.neutral, agg.negative), (6, 2, 2));
        assert_eq!(agg.median_score, 0.45);
        assert_eq!(agg.average_score, 0.25);
        assert_eq!(agg.tone(), "optimistic");
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let points = vec![point(0.3, None, 0), point(-0.3, None, 1)];
        let agg = MoodAggregate::from_points(&points, &SummarySettings::default());
        assert_eq!((agg.positive, agg.neutral, agg.negative), (0, 2, 0));
        assert_eq!(agg.tone(), "balanced");
    }

    #[tokio::test]
    async fn test_fallback_summary_distribution() {
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        let text = generator
            .generate_summary(&sixty_twenty_twenty(), None)
            .await
            .unwrap();
        assert!(text.contains("Positive 60.0%, Neutral 20.0%, Negative 20.0%"), "{text}");
        assert!(text.contains("appears optimistic"));
        assert!(text.contains("across 1 cities worldwide"));
        assert!(text.contains("Median sentiment score 0.45"));
    }

    #[tokio::test]
    async fn test_fallback_summary_with_city_sample() {
        let settings = SummarySettings {
            include_cities: true,
            ..SummarySettings::default()
        };
        let generator = SummaryGenerator::new(settings, None);
        let points = vec![point(-0.9, Some("Lima, Peru"), 0), point(0.0, None, 1)];
        let text = generator.generate_summary(&points, None).await.unwrap();
        assert!(text.contains("across Lima, Peru."));
        assert!(text.contains("appears concerned"));
        assert!(text.contains("Median sentiment score -0.45"));
    }

    #[tokio::test]
    async fn test_city_fallback_mentions_city() {
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        let text = generator
            .generate_summary(&[point(0.0, Some("Oslo, Norway"), 0)], Some("Oslo, Norway"))
            .await
            .unwrap();
        assert!(text.starts_with("Emotional overview for Oslo, Norway: Analyzed 1 recent"));
        assert!(text.contains("median sentiment score is 0.0"));
        assert!(text.contains("appears balanced"));
    }

    #[tokio::test]
    async fn test_empty_window() {
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        assert_eq!(&*generator.generate_summary(&[], None).await.unwrap(), NO_DATA_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_within_ttl_and_expiry() {
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        let points = sixty_twenty_twenty();

        let first = generator.generate_summary(&points, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let second = generator.generate_summary(&points, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::advance(Duration::from_secs(16)).await;
        let third = generator.generate_summary(&points, None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first, third);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_misses_on_changed_window() {
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        let points = sixty_twenty_twenty();
        let first = generator.generate_summary(&points, None).await.unwrap();
        let fewer = generator.generate_summary(&points[..9], None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fewer));
        let city = generator
            .generate_summary(&points[..9], Some("Toronto, Canada"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&fewer, &city));
    }

    #[tokio::test]
    async fn test_model_output_is_cleaned() {
        let scripted = Arc::new(ScriptedGenerator::new(
            &[],
            "<s>[INST] The world feels  hopeful today.[/INST] <|im_end|>",
        ));
        let cascade = ModelCascade::new(scripted, DEFAULT_MODEL, FALLBACK_MODELS);
        let generator = SummaryGenerator::new(SummarySettings::default(), Some(cascade));
        let text = generator
            .generate_summary(&sixty_twenty_twenty(), None)
            .await
            .unwrap();
        assert_eq!(&*text, "The world feels hopeful today.");
    }

    #[tokio::test]
    async fn test_all_models_failed_surfaces() {
        let all: Vec<&str> = std::iter::once(DEFAULT_MODEL)
            .chain(FALLBACK_MODELS.iter().copied())
            .collect();
        let scripted = Arc::new(ScriptedGenerator::new(&all, ""));
        let cascade = ModelCascade::new(scripted, DEFAULT_MODEL, FALLBACK_MODELS);
        let generator = SummaryGenerator::new(SummarySettings::default(), Some(cascade));
        let err = generator
            .generate_summary(&sixty_twenty_twenty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SummaryError::AllModelsFailed { ref tried, .. } if tried.len() == 4));
    }

    #[test]
    fn test_prompt_embeds_thresholds_and_style() {
        let settings = SummarySettings {
            style: SummaryStyle::Trend,
            ..SummarySettings::default()
        };
        let generator = SummaryGenerator::new(settings, None);
        let agg = MoodAggregate::from_points(&sixty_twenty_twenty(), generator.settings());
        let prompt = generator.build_prompt(&agg, None);
        assert!(prompt.contains("(>0.3 positive, <-0.3 negative)"));
        assert!(prompt.contains("Positive 60.0%"));
        assert!(prompt.contains("momentum"));
        assert!(prompt.contains("Do not mention specific city"));

        let city_prompt = generator.build_prompt(&agg, Some("Toronto"));
        assert!(city_prompt.starts_with("Analyze sentiment from 10 recent Reddit posts discussing Toronto."));
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(clean_output("[B_INST] Hello   there [/SYS_TAG]\n"), "Hello there");
        assert_eq!(clean_output(""), "");
        // lower-case brackets are content, not tags
        assert_eq!(clean_output("see [note]"), "see [note]");
    }

    #[test]
    fn test_latest_per_city_keeps_newest() {
        let points = vec![
            point(0.5, Some("A"), 0),
            point(0.1, None, 1),
            point(-0.5, Some("A"), 2),
            point(0.2, Some("B"), 3),
        ];
        let latest = latest_per_city(points);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].score, 0.5);
        assert_eq!(latest[1].city_name.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_latest_summary_from_store() {
        let store = MoodStore::in_memory();
        store.insert_moods(sixty_twenty_twenty()).await.unwrap();
        let generator = SummaryGenerator::new(SummarySettings::default(), None);
        let latest = generator.get_latest_summary(&store).await.unwrap();
        assert_eq!(latest.points, 1);

        let city = generator.city_summary(&store, "Toronto, Canada").await.unwrap();
        assert!(city.contains("Analyzed 10 recent"));
    }

    #[test]
    fn test_style_from_str() {
        assert_eq!("Narrative".parse::<SummaryStyle>().unwrap(), SummaryStyle::Narrative);
        assert!("verbose".parse::<SummaryStyle>().is_err());
    }
}
