//! Output generation for collected posts and rendered audio.
//!
//! # Submodules
//!
//! - [`json`]: Writes collected stream posts to a JSON file
//! - [`audio`]: Wraps synthesized audio in the response envelope the caller asked for
//!
//! # Output Structure
//!
//! ```text
//! streamed_posts.json         # collect: {collected_at, count, posts}
//! summary.mp3                 # audio --format stream
//! ```

pub mod audio;
pub mod json;
