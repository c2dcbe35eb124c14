//! Deterministic filler posts for lenient deployments.
//!
//! Every post produced here carries `source = "synthetic"` and
//! `is_fallback = true`, so downstream consumers can always tell them apart
//! from upstream data.

use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cities::City;
use crate::models::RawPost;

pub const SAMPLE_TEXTS: &[&str] = &[
    "Feeling great about the new project! Excited to see where this goes.",
    "Stressed about the deadline tomorrow. Need to finish everything.",
    "Beautiful weather today. Perfect for a walk in the park.",
    "Anxious about the upcoming exam. Hope I studied enough.",
    "Just got promoted! This is amazing news!",
    "Traffic is terrible today. Going to be late for the meeting.",
    "Love spending time with family. These moments are precious.",
    "Worried about climate change. We need to act now.",
    "Grateful for all the support from friends and colleagues.",
    "Frustrated with the slow internet connection.",
    "Celebrating a small victory today. Every step counts!",
    "Feeling overwhelmed with all the tasks on my plate.",
    "Amazing sunset tonight. Nature never fails to amaze.",
    "Concerned about the future. Hoping for the best.",
    "Thrilled about the concert next week! Can't wait!",
];

pub const SOURCE: &str = "synthetic";

/// Process-wide sequence; keeps ids unique across cities and calls.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

fn post(i: usize) -> RawPost {
    let mut post = RawPost::new(SOURCE, SAMPLE_TEXTS[i % SAMPLE_TEXTS.len()]);
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    post.id = Some(format!("{SOURCE}-{}-{seq}", Utc::now().timestamp_millis()));
    post.timestamp = Utc::now() - Duration::minutes((i % 60) as i64);
    post.is_fallback = true;
    post
}

/// `limit` unlocated filler posts.
pub fn posts(limit: usize) -> Vec<RawPost> {
    (0..limit).map(post).collect()
}

/// `limit` filler posts placed on `city`.
pub fn posts_for_city(city: &City, limit: usize) -> Vec<RawPost> {
    (0..limit)
        .map(|i| {
            let mut p = post(i);
            p.lat = Some(city.lat);
            p.lng = Some(city.lng);
            p.city_name = Some(city.name.clone());
            p.country = city.country();
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posts_are_flagged_and_cycle_texts() {
        let generated = posts(SAMPLE_TEXTS.len() + 1);
        assert!(generated.iter().all(|p| p.is_fallback && p.source == SOURCE));
        assert_eq!(generated[0].text, generated[SAMPLE_TEXTS.len()].text);
        assert!(!generated[0].has_location());
    }

    #[test]
    fn test_posts_for_city_use_city_coordinates() {
        let city = City::new("Nairobi, Kenya", -1.2921, 36.8219);
        let generated = posts_for_city(&city, 2);
        assert_eq!(generated.len(), 2);
        for p in generated {
            assert_eq!((p.lat, p.lng), (Some(-1.2921), Some(36.8219)));
            assert_eq!(p.country.as_deref(), Some("Kenya"));
        }
    }

    #[test]
    fn test_ids_unique_across_cities_and_calls() {
        use std::collections::HashSet;

        let toronto = City::new("Toronto, Canada", 43.6532, -79.3832);
        let lima = City::new("Lima, Peru", -12.0464, -77.0428);
        let mut generated = posts_for_city(&toronto, 3);
        generated.extend(posts_for_city(&lima, 3));
        generated.extend(posts_for_city(&toronto, 3));
        generated.extend(posts(3));

        let ids: HashSet<String> = generated.iter().filter_map(|p| p.id.clone()).collect();
        assert_eq!(ids.len(), generated.len());
    }
}
