//! Command-line interface definitions for Earth's Pulse.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every deployment setting can be provided via a command-line flag or an
//! environment variable; each subcommand maps onto one operation of
//! [`AppContext`](crate::service::AppContext) and prints its JSON result.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::cities::DEFAULT_WITHIN_KM;
use crate::outputs::audio::AudioFormat;
use crate::pipeline::RefreshMode;
use crate::sentiment::ScoreCurve;
use crate::summary::{SummarySettings, SummaryStyle};

/// Command-line arguments for the Earth's Pulse application.
///
/// # Examples
///
/// ```sh
/// # Pull recent posts, score and store them
/// earth_pulse refresh --limit 50
///
/// # Global mood summary backed by a SQLite file
/// DATABASE_URL=sqlite://pulse.db earth_pulse summary
///
/// # Long-running ingestion with streams and scheduled refresh
/// earth_pulse --enable-streams --enable-background-refresh run
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

/// Deployment settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// SQLite connection string; in-memory storage when unset or unreachable
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Reddit application id
    #[arg(long, env = "REDDIT_CLIENT_ID", global = true, hide_env_values = true)]
    pub reddit_client_id: Option<String>,

    /// Reddit application secret
    #[arg(long, env = "REDDIT_CLIENT_SECRET", global = true, hide_env_values = true)]
    pub reddit_client_secret: Option<String>,

    #[arg(long, env = "REDDIT_USER_AGENT", default_value = "EarthPulse/1.0", global = true)]
    pub reddit_user_agent: String,

    /// Twitter API v2 bearer token
    #[arg(long, env = "TWITTER_BEARER_TOKEN", global = true, hide_env_values = true)]
    pub twitter_bearer_token: Option<String>,

    /// Hugging Face inference token; keyword scoring only when unset
    #[arg(long, env = "HF_API_TOKEN", global = true, hide_env_values = true)]
    pub hf_api_token: Option<String>,

    #[arg(
        long,
        env = "SENTIMENT_MODEL",
        default_value = crate::sentiment::DEFAULT_MODEL,
        global = true
    )]
    pub sentiment_model: String,

    /// Confidence-to-score curve: `offset`, `offset:<floor>` or `linear`
    #[arg(long, env = "SENTIMENT_SCORE_CURVE", default_value = "offset", global = true)]
    pub score_curve: ScoreCurve,

    #[arg(long, env = "SENTIMENT_POS_THRESHOLD", default_value_t = 0.3, global = true)]
    pub pos_threshold: f64,

    #[arg(
        long,
        env = "SENTIMENT_NEG_THRESHOLD",
        default_value_t = -0.3,
        allow_hyphen_values = true,
        global = true
    )]
    pub neg_threshold: f64,

    /// OpenRouter key; deterministic summaries when unset
    #[arg(long, env = "OPENROUTER_API_KEY", global = true, hide_env_values = true)]
    pub openrouter_api_key: Option<String>,

    #[arg(
        long,
        env = "OPENROUTER_MODEL",
        default_value = crate::llm::DEFAULT_MODEL,
        global = true
    )]
    pub openrouter_model: String,

    /// Summary cache lifetime in seconds
    #[arg(long, env = "SUMMARY_CACHE_TTL", default_value_t = 45, global = true)]
    pub summary_cache_ttl: u64,

    /// concise | trend | narrative
    #[arg(long, env = "SUMMARY_STYLE", default_value = "concise", global = true)]
    pub summary_style: SummaryStyle,

    /// Let global summaries name representative cities
    #[arg(long, env = "SUMMARY_INCLUDE_CITIES", global = true)]
    pub summary_include_cities: bool,

    #[arg(long, env = "ELEVENLABS_API_KEY", global = true, hide_env_values = true)]
    pub elevenlabs_api_key: Option<String>,

    #[arg(
        long,
        env = "ELEVENLABS_VOICE_ID",
        default_value = crate::tts::DEFAULT_VOICE_ID,
        global = true
    )]
    pub elevenlabs_voice_id: String,

    #[arg(long, env = "ELEVENLABS_MODEL", global = true)]
    pub elevenlabs_model: Option<String>,

    /// Run the per-city refresh loop under `run`
    #[arg(long, env = "ENABLE_BACKGROUND_REFRESH", global = true)]
    pub enable_background_refresh: bool,

    /// Seconds between scheduled refreshes (never less than 60)
    #[arg(long, env = "REFRESH_INTERVAL_SECONDS", default_value_t = 300, global = true)]
    pub refresh_interval_seconds: u64,

    /// Run the live stream producers and consumer under `run`
    #[arg(long, env = "ENABLE_STREAMS", global = true)]
    pub enable_streams: bool,

    #[arg(
        long,
        env = "REDDIT_STREAM_SUBREDDITS",
        default_value = "news,worldnews",
        value_delimiter = ',',
        global = true
    )]
    pub reddit_stream_subreddits: Vec<String>,

    /// Synthesize filler posts instead of failing when upstream data is missing
    #[arg(long, env = "ALLOW_SYNTHETIC_POSTS", global = true)]
    pub allow_synthetic_posts: bool,

    /// Enable the seed and clear operations
    #[arg(long, env = "ENABLE_DEV_ENDPOINTS", global = true)]
    pub enable_dev_endpoints: bool,

    /// YAML list of `{name, lat, lng, country?}`; built-in cities when unset
    #[arg(long, env = "CITIES_FILE", global = true)]
    pub cities_file: Option<PathBuf>,
}

impl Settings {
    pub fn summary(&self) -> SummarySettings {
        SummarySettings {
            pos_threshold: self.pos_threshold,
            neg_threshold: self.neg_threshold,
            style: self.summary_style,
            include_cities: self.summary_include_cities,
            cache_ttl: Duration::from_secs(self.summary_cache_ttl),
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.enable_background_refresh
            .then(|| Duration::from_secs(self.refresh_interval_seconds))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the enabled background drivers and wait for Ctrl-C
    Run,

    /// Pull posts once, score and store them
    Refresh {
        /// batch | city
        #[arg(long, default_value = "batch")]
        mode: RefreshMode,
        #[arg(long)]
        reddit_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// List stored mood points, newest first
    Moods {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        min_score: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        max_score: Option<f64>,
        /// Only points observed in the last N hours
        #[arg(long)]
        hours: Option<i64>,
        /// Drop points not anchored to a curated city
        #[arg(long)]
        only_city: bool,
        /// Keep only the newest point per city
        #[arg(long)]
        unique_per_city: bool,
    },

    /// Summarize the newest point of every city
    Summary,

    /// Render the latest summary to speech
    Audio {
        #[arg(long, value_enum, default_value_t = AudioFormat::Base64)]
        format: AudioFormat,
        /// Voice id or voice name
        #[arg(long)]
        voice_id: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Where to write raw MP3 bytes for `--format stream`
        #[arg(long, default_value = "summary.mp3")]
        out: PathBuf,
    },

    /// Aggregate statistics over every stored point
    Stats,

    /// Posts for one city, stored or fetched live
    Posts {
        #[arg(long)]
        city: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        live: bool,
        /// Persist live posts and their mood points
        #[arg(long)]
        save: bool,
    },

    /// Posts for one city plus a city-scoped summary
    CityPosts {
        #[arg(long)]
        city: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        live: bool,
    },

    /// Stored posts of the curated city nearest a coordinate
    #[command(allow_negative_numbers = true)]
    Near {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lng: f64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = DEFAULT_WITHIN_KM)]
        within_km: f64,
    },

    /// Store one sample mood point per curated city (dev only)
    Seed,

    /// Delete every mood point and post (dev only)
    Clear,

    /// Collect live stream posts into a JSON file
    Collect {
        #[arg(long, default_value_t = 50)]
        count: usize,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        max_wait: u64,
        #[arg(long, default_value = "streamed_posts.json")]
        out: PathBuf,
    },

    /// Backing store, scorer and post source readiness
    Health,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "earth_pulse",
            "refresh",
            "--mode",
            "city",
            "--reddit-only",
            "--limit",
            "20",
        ]);

        match cli.command {
            Command::Refresh {
                mode,
                reddit_only,
                limit,
            } => {
                assert_eq!(mode, RefreshMode::PerCity);
                assert!(reddit_only);
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let cli = Cli::parse_from(["earth_pulse", "stats"]);
        let summary = cli.settings.summary();

        assert_eq!(summary.cache_ttl, Duration::from_secs(45));
        assert_eq!(summary.style, SummaryStyle::Concise);
        assert_eq!(cli.settings.score_curve, ScoreCurve::Offset { floor: 0.3 });
        assert_eq!(
            cli.settings.reddit_stream_subreddits,
            vec!["news".to_string(), "worldnews".to_string()]
        );
        assert!(cli.settings.refresh_interval().is_none());
    }

    #[test]
    fn test_global_settings_after_subcommand() {
        let cli = Cli::parse_from([
            "earth_pulse",
            "summary",
            "--summary-style",
            "trend",
            "--neg-threshold",
            "-0.5",
            "--enable-background-refresh",
        ]);

        assert_eq!(cli.settings.summary_style, SummaryStyle::Trend);
        assert_eq!(cli.settings.neg_threshold, -0.5);
        assert_eq!(
            cli.settings.refresh_interval(),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_near_accepts_negative_coordinates() {
        let cli = Cli::parse_from([
            "earth_pulse",
            "near",
            "--lat",
            "-12.05",
            "--lng",
            "-77.04",
        ]);

        match cli.command {
            Command::Near {
                lat,
                lng,
                within_km,
                ..
            } => {
                assert_eq!((lat, lng), (-12.05, -77.04));
                assert_eq!(within_km, DEFAULT_WITHIN_KM);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_audio_format_value_enum() {
        let cli = Cli::parse_from(["earth_pulse", "audio", "--format", "url"]);
        assert!(matches!(
            cli.command,
            Command::Audio {
                format: AudioFormat::Url,
                ..
            }
        ));
    }
}
