//! Data models for posts, scored mood points and aggregate statistics.
//!
//! This module defines the core data structures used throughout the application:
//! - [`RawPost`]: an unscored post as delivered by a post source
//! - [`MoodPoint`]: a scored, geolocated observation persisted by the store
//! - [`PostItem`]: a scored post kept for per-city post queries
//! - [`Sentiment`] / [`MoodLabel`]: the scorer's output
//! - [`MoodStatistics`]: full-table aggregates
//!
//! `RawPost` is the ingestion boundary. Every field either has a serde default or
//! is optional, so partial upstream records never fail to decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::utils::truncate_chars;

/// Maximum number of characters of post text stored on a mood point.
pub const MOOD_TEXT_MAX_CHARS: usize = 200;

/// Emotion label attached to every scored observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoodLabel {
    Joyful,
    Anxious,
    Neutral,
}

impl MoodLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoodLabel::Joyful => "joyful",
            MoodLabel::Anxious => "anxious",
            MoodLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for MoodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label and signed score produced together from one piece of text.
///
/// The two fields are only ever constructed by the sentiment scorer, which keeps
/// them consistent with each other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: MoodLabel,
    /// Signed magnitude in `[-1, 1]`.
    pub score: f64,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            label: MoodLabel::Neutral,
            score: 0.0,
        }
    }
}

fn default_source() -> String {
    "unknown".to_string()
}

/// A post as delivered by a post source, before scoring.
///
/// Created by a source, consumed exactly once by the ingestion pipeline and
/// discarded after conversion to a [`MoodPoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    /// Origin platform ("reddit", "twitter", "synthetic").
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    /// Set for synthesized filler text.
    #[serde(default)]
    pub is_fallback: bool,
}

impl RawPost {
    /// A post with only text and platform set; everything else defaulted.
    pub fn new(source: &str, text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            lat: None,
            lng: None,
            source: source.to_string(),
            timestamp: Utc::now(),
            city_name: None,
            country: None,
            url: None,
            author: None,
            is_fallback: false,
        }
    }

    pub fn has_location(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }
}

/// Rejected coordinates when building a mood point.
#[derive(Debug, Error, PartialEq)]
pub enum MoodPointError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
    #[error("score {0} outside [-1, 1]")]
    Score(f64),
}

/// A scored, geolocated sentiment observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodPoint {
    pub lat: f64,
    pub lng: f64,
    /// Conventionally one of `joyful`, `anxious`, `neutral`.
    pub label: String,
    pub score: f64,
    pub source: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub city_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub post_text: Option<String>,
    #[serde(default)]
    pub post_url: Option<String>,
    #[serde(default)]
    pub post_author: Option<String>,
    #[serde(default)]
    pub post_id: Option<String>,
}

impl MoodPoint {
    /// Build a mood point from a post and the sentiment scored from its text.
    ///
    /// Missing coordinates default to `(0, 0)`; the stored snippet is cut to
    /// [`MOOD_TEXT_MAX_CHARS`]. Out-of-range coordinates are rejected.
    pub fn from_post(
        post: &RawPost,
        sentiment: Sentiment,
        now: DateTime<Utc>,
    ) -> Result<Self, MoodPointError> {
        let lat = post.lat.unwrap_or(0.0);
        let lng = post.lng.unwrap_or(0.0);
        if !(-90.0..=90.0).contains(&lat) {
            return Err(MoodPointError::Latitude(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(MoodPointError::Longitude(lng));
        }
        if !(-1.0..=1.0).contains(&sentiment.score) {
            return Err(MoodPointError::Score(sentiment.score));
        }
        let source = if post.source.trim().is_empty() {
            default_source()
        } else {
            post.source.clone()
        };
        Ok(Self {
            lat,
            lng,
            label: sentiment.label.to_string(),
            score: sentiment.score,
            source: source.clone(),
            text: Some(truncate_chars(&post.text, MOOD_TEXT_MAX_CHARS)),
            city_name: post.city_name.clone(),
            timestamp: now,
            is_fallback: post.is_fallback,
            country: post.country.clone(),
            platform: Some(source),
            post_text: None,
            post_url: post.url.clone(),
            post_author: post.author.clone(),
            post_id: post.id.clone(),
        })
    }

    /// Whether the point is tied to a curated city.
    pub fn is_city_anchored(&self) -> bool {
        self.city_name.is_some()
    }
}

/// A scored post persisted for direct per-city queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostItem {
    #[serde(default)]
    pub id: Option<String>,
    pub city_name: String,
    #[serde(default)]
    pub country: Option<String>,
    /// "reddit" | "twitter" | "synthetic"
    pub platform: String,
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub score: f64,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl PostItem {
    pub fn from_post(post: &RawPost, city_name: &str, sentiment: Sentiment) -> Self {
        Self {
            id: post.id.clone(),
            city_name: city_name.to_string(),
            country: post.country.clone(),
            platform: post.source.clone(),
            text: post.text.clone(),
            url: post.url.clone(),
            author: post.author.clone(),
            score: sentiment.score,
            label: sentiment.label.to_string(),
            created_at: post.timestamp,
        }
    }
}

/// Full-table aggregates over stored mood points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoodStatistics {
    pub total_points: u64,
    pub by_source: BTreeMap<String, u64>,
    pub by_label: BTreeMap<String, u64>,
    pub average_score: f64,
}
