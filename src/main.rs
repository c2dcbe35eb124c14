//! # Earth's Pulse
//!
//! A sentiment pipeline that pulls social posts from Reddit and Twitter,
//! scores their mood, anchors them to curated world cities and turns the
//! result into a natural-language (and optionally spoken) mood summary.
//!
//! ## Features
//!
//! - Batch, per-city and streaming ingestion with id deduplication
//! - Hugging Face sentiment classifier with a keyword fallback
//! - SQLite storage that degrades to a bounded in-memory store
//! - OpenRouter summaries over a model cascade, or a deterministic template
//! - ElevenLabs text-to-speech with voice-name resolution and model fallback
//!
//! ## Usage
//!
//! ```sh
//! earth_pulse refresh --mode city
//! earth_pulse summary
//! earth_pulse --enable-streams --enable-background-refresh run
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: upstream clients produce raw posts, anchored to cities
//! 2. **Scoring**: each post becomes a labelled mood point
//! 3. **Storage**: points and per-city posts go to the mood store
//! 4. **Summarizing**: the newest point per city feeds the summary generator
//!
//! Every subcommand prints the JSON result of one [`service::AppContext`]
//! operation; failures print `{error, status_code, meta}`.

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::error::Error;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cities;
mod cli;
mod error;
mod llm;
mod models;
mod outputs;
mod pipeline;
mod sentiment;
mod service;
mod sources;
mod store;
mod summary;
mod tts;
mod utils;

use cli::{Cli, Command};
use error::AppError;
use outputs::audio::{self as audio_out, AudioPayload};
use outputs::json as json_out;
use service::{AppContext, MoodsRequest};

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| AppError::Output(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("earth_pulse starting up");

    let args = Cli::parse();
    debug!(?args.command, "Parsed CLI arguments");

    let result = match AppContext::build(&args.settings).await {
        Ok(ctx) => dispatch(&ctx, &args).await,
        Err(e) => Err(e),
    };

    let elapsed = start_time.elapsed();
    match result {
        Ok(()) => {
            info!(?elapsed, "Execution complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, status = e.status_code(), "Command failed");
            print_json(&e.to_json())?;
            Err(e.into())
        }
    }
}

async fn dispatch(ctx: &AppContext, args: &Cli) -> Result<(), AppError> {
    match &args.command {
        Command::Run => run(ctx, args).await,
        Command::Refresh {
            mode,
            reddit_only,
            limit,
        } => print_json(&ctx.refresh(*mode, *reddit_only, *limit).await?),
        Command::Moods {
            limit,
            source,
            min_score,
            max_score,
            hours,
            only_city,
            unique_per_city,
        } => {
            let req = MoodsRequest {
                limit: *limit,
                source: source.clone(),
                min_score: *min_score,
                max_score: *max_score,
                hours: *hours,
                only_city: *only_city,
                unique_per_city: *unique_per_city,
            };
            print_json(&ctx.list_moods(&req).await?)
        }
        Command::Summary => print_json(&ctx.summary().await?),
        Command::Audio {
            format,
            voice_id,
            model,
            out,
        } => match ctx
            .summary_audio(*format, voice_id.as_deref(), model.as_deref())
            .await?
        {
            AudioPayload::Stream(bytes) => {
                audio_out::write_audio(&bytes, out)
                    .await
                    .map_err(|e| AppError::Output(e.to_string()))?;
                print_json(&json!({
                    "path": out.display().to_string(),
                    "mime_type": audio_out::MIME_TYPE,
                    "bytes": bytes.len(),
                }))
            }
            payload => print_json(&payload),
        },
        Command::Stats => print_json(&ctx.stats().await?),
        Command::Posts {
            city,
            limit,
            live,
            save,
        } => print_json(&ctx.posts(city, *limit, *live, *save).await?),
        Command::CityPosts { city, limit, live } => {
            print_json(&ctx.city_posts(city, *limit, *live).await?)
        }
        Command::Near {
            lat,
            lng,
            limit,
            within_km,
        } => print_json(&ctx.posts_near(*lat, *lng, *limit, *within_km).await?),
        Command::Seed => print_json(&ctx.seed().await?),
        Command::Clear => print_json(&ctx.clear().await?),
        Command::Collect {
            count,
            max_wait,
            out,
        } => {
            let posts = ctx.collect(*count, Duration::from_secs(*max_wait)).await?;
            json_out::write_posts(&posts, out)
                .await
                .map_err(|e| AppError::Output(e.to_string()))?;
            print_json(&json!({
                "path": out.display().to_string(),
                "count": posts.len(),
            }))
        }
        Command::Health => print_json(&ctx.health().await),
    }
}

/// Run the enabled background drivers until Ctrl-C.
async fn run(ctx: &AppContext, args: &Cli) -> Result<(), AppError> {
    let settings = &args.settings;
    let cancel = CancellationToken::new();
    let handles =
        ctx.start_background(settings.refresh_interval(), settings.enable_streams, &cancel);
    if handles.is_empty() {
        warn!("Nothing to run; enable background refresh or streams");
        return Ok(());
    }

    info!(tasks = handles.len(), "Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested; waiting for background tasks");
    cancel.cancel();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Background task failed");
        }
    }
    info!("All background tasks stopped");
    Ok(())
}
