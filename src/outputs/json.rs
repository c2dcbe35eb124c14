//! JSON output for collected stream posts.
//!
//! # Output Structure
//!
//! ```text
//! {
//!   "collected_at": "2025-05-06T12:00:00Z",
//!   "count": 50,
//!   "posts": [ { "id": "...", "text": "...", "source": "reddit", ... } ]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

use crate::models::RawPost;
use crate::utils::ensure_writable_parent;

#[derive(Debug, Serialize)]
struct CollectedPosts<'a> {
    collected_at: DateTime<Utc>,
    count: usize,
    posts: &'a [RawPost],
}

/// Write `posts` to `path` as pretty JSON, creating parent directories.
#[instrument(level = "info", skip_all, fields(path = %path.display(), count = posts.len()))]
pub async fn write_posts(posts: &[RawPost], path: &Path) -> Result<(), Box<dyn Error>> {
    ensure_writable_parent(path).await?;
    let json = serde_json::to_string_pretty(&CollectedPosts {
        collected_at: Utc::now(),
        count: posts.len(),
        posts,
    })?;
    fs::write(path, json).await?;
    info!("Wrote collected posts");
    Ok(())
}
