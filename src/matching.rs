//! Fuzzy equivalence scoring between track metadata from different catalogs.
//!
//! The same song rarely carries identical metadata across services ("Song
//! (Official Video)" vs "Song", "A & B" vs "A and B", durations off by a few
//! seconds), so equivalence is decided by a weighted similarity score over
//! normalized fields rather than exact key lookup.

use std::sync::OnceLock;

use regex::Regex;

use crate::catalog::Track;

/// Minimum score at which two tracks are considered the same recording.
pub const DEFAULT_MATCH_THRESHOLD: u8 = 80;

/// Tokens that carry no identity information and get dropped during
/// normalization.
const NOISE_TOKENS: &[&str] = &["official", "video", "lyrics", "lyric", "audio", "feat", "ft"];

/// Normalized comparison view of a track. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_secs: u32,
    pub release_year: String,
}

impl From<&Track> for TrackMetadata {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.artists.join(", "),
            album: track.album.clone(),
            duration_secs: track.duration_secs,
            release_year: track.release_year.clone(),
        }
    }
}

fn brackets_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").expect("valid regex"))
}

fn punctuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s-]").expect("valid regex"))
}

/// Normalize a metadata string for comparison: lowercase, `&` spelled out,
/// bracketed content and noise tokens dropped, punctuation stripped,
/// whitespace collapsed. Idempotent.
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase().replace('&', " and ");
    let without_brackets = brackets_re().replace_all(&lowered, " ");
    let without_punctuation = punctuation_re().replace_all(&without_brackets, "");
    without_punctuation
        .split_whitespace()
        .filter(|token| !NOISE_TOKENS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Levenshtein-based similarity in [0, 100]. Two empty strings are identical;
/// exactly one empty string means nothing to compare against.
pub fn field_similarity(s1: &str, s2: &str) -> u32 {
    if s1.is_empty() && s2.is_empty() {
        return 100;
    }
    if s1.is_empty() || s2.is_empty() {
        return 0;
    }
    let max_len = s1.chars().count().max(s2.chars().count());
    let distance = strsim::levenshtein(s1, s2);
    (100i64 - (distance as i64 * 100 / max_len as i64)).clamp(0, 100) as u32
}

/// Duration similarity by closeness bucket instead of linear distance: small
/// encoder drift should not count against a match, a 30% gap should sink it.
pub fn duration_similarity(d1: u32, d2: u32) -> u32 {
    if d1 == d2 {
        return 100;
    }
    let max = d1.max(d2);
    let diff = d1.abs_diff(d2);
    let closeness = 100.0 * (1.0 - diff as f64 / max as f64);
    match closeness {
        c if c >= 95.0 => 100,
        c if c >= 90.0 => 80,
        c if c >= 85.0 => 60,
        c if c >= 80.0 => 40,
        c if c >= 75.0 => 20,
        _ => 0,
    }
}

/// Weighted similarity score in [0, 100]. Deterministic, symmetric,
/// stateless.
pub fn score(a: &TrackMetadata, b: &TrackMetadata) -> u8 {
    let title = field_similarity(&normalize(&a.title), &normalize(&b.title));
    let artist = field_similarity(&normalize(&a.artist), &normalize(&b.artist));
    let album = field_similarity(&normalize(&a.album), &normalize(&b.album));
    let year = field_similarity(
        a.release_year.trim().to_lowercase().as_str(),
        b.release_year.trim().to_lowercase().as_str(),
    );
    let duration = duration_similarity(a.duration_secs, b.duration_secs);

    ((title * 35 + artist * 35 + duration * 15 + album * 10 + year * 5) / 100) as u8
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    pub min_score: u8,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher {
    pub fn new(min_score: u8) -> Self {
        Self { min_score }
    }

    pub fn score(&self, a: &TrackMetadata, b: &TrackMetadata) -> u8 {
        score(a, b)
    }

    pub fn is_match(&self, a: &TrackMetadata, b: &TrackMetadata) -> bool {
        score(a, b) >= self.min_score
    }

    /// Source tracks with no equivalent in `target` (score below threshold
    /// against every target track).
    pub fn missing_from<'a>(&self, source: &'a [Track], target: &[Track]) -> Vec<&'a Track> {
        let target_meta: Vec<TrackMetadata> = target.iter().map(TrackMetadata::from).collect();
        source
            .iter()
            .filter(|track| {
                let meta = TrackMetadata::from(*track);
                !target_meta.iter().any(|t| self.is_match(&meta, t))
            })
            .collect()
    }
}
