//! Candidate ranking against the active quality profile.
//!
//! [`score_hit`] is a pure function: the dispatcher resolves the blocklist
//! verdict first and passes it in, so scoring stays deterministic and
//! trivially testable. Higher scores are better; `None` means rejected.

use serde::{Deserialize, Serialize};

use crate::downloader::Hit;
use crate::store::Candidate;

/// Format preference weight: one preferred-format rank outweighs any
/// bitrate difference.
const FORMAT_RANK_WEIGHT: i64 = 1000;

/// Bitrate contribution is clamped to this ceiling.
const BITRATE_CLAMP: i64 = 2000;

/// The active quality profile. Exactly one is in effect at a time; it is
/// stored as JSON in the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityProfile {
    /// Formats in preference order; earlier is better.
    pub preferred_formats: Vec<String>,
    /// Minimum acceptable bitrate in kbps; 0 disables the bound.
    pub min_bitrate: i64,
    /// Maximum acceptable bitrate in kbps; 0 disables the bound.
    pub max_bitrate: i64,
    /// Minimum acceptable size in MiB; 0 disables the bound.
    pub min_size_mb: i64,
    /// Maximum acceptable size in MiB; 0 disables the bound.
    pub max_size_mb: i64,
    /// Case-insensitive substrings that disqualify a filename.
    pub exclude_keywords: Vec<String>,
    /// Whether lossy formats are acceptable at all.
    pub allow_lossy: bool,
    /// Whether lossless formats are preferred over lossy ones.
    pub prefer_lossless: bool,
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self {
            preferred_formats: vec!["flac".to_string(), "mp3".to_string()],
            min_bitrate: 0,
            max_bitrate: 0,
            min_size_mb: 0,
            max_size_mb: 0,
            exclude_keywords: Vec::new(),
            allow_lossy: true,
            prefer_lossless: true,
        }
    }
}

/// Detects the audio format from a filename extension.
///
/// Handles both Windows-style paths (slskd peers share them) and plain
/// names. Returns a lowercased extension, or None when there is none.
#[must_use]
pub fn detect_format(filename: &str) -> Option<String> {
    let basename = filename
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(filename);
    let (_, extension) = basename.rsplit_once('.')?;
    if extension.is_empty() {
        return None;
    }
    Some(extension.to_lowercase())
}

fn is_lossy(format: &str) -> bool {
    matches!(format, "mp3" | "ogg" | "aac" | "m4a" | "opus" | "wma")
}

/// Scores a search hit against the profile.
///
/// Returns `None` when the hit is rejected:
/// 1. blocklisted source,
/// 2. format outside the preferred set under a lossless-only profile, or a
///    lossy format when lossy is disallowed,
/// 3. bitrate or size outside the configured bounds,
/// 4. an excluded keyword in the filename.
///
/// Accepted hits score `-1000 * preferred_format_rank + clamp(bitrate, 0,
/// 2000)`; higher is better, so a better-ranked format always beats a
/// higher bitrate in a worse format.
#[must_use]
pub fn score_hit(hit: &Hit, profile: &QualityProfile, blocked: bool) -> Option<i64> {
    if blocked {
        return None;
    }

    let format = hit
        .format
        .clone()
        .or_else(|| detect_format(&hit.filename))
        .unwrap_or_default();

    let format_rank = profile
        .preferred_formats
        .iter()
        .position(|f| f.eq_ignore_ascii_case(&format));

    if format_rank.is_none()
        && !profile.allow_lossy
        && (profile.prefer_lossless || is_lossy(&format))
    {
        return None;
    }
    if !profile.allow_lossy && is_lossy(&format) {
        return None;
    }

    let bitrate = hit.bitrate_kbps.unwrap_or(0);
    if hit.bitrate_kbps.is_some() {
        if profile.min_bitrate > 0 && bitrate < profile.min_bitrate {
            return None;
        }
        if profile.max_bitrate > 0 && bitrate > profile.max_bitrate {
            return None;
        }
    }

    let size_mb = hit.size_bytes / (1024 * 1024);
    if profile.min_size_mb > 0 && size_mb < profile.min_size_mb {
        return None;
    }
    if profile.max_size_mb > 0 && size_mb > profile.max_size_mb {
        return None;
    }

    let lowered = hit.filename.to_lowercase();
    if profile
        .exclude_keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()))
    {
        return None;
    }

    let rank = format_rank.unwrap_or(profile.preferred_formats.len()) as i64;
    Some(-FORMAT_RANK_WEIGHT * rank + bitrate.clamp(0, BITRATE_CLAMP))
}

/// Builds the persisted candidate for an accepted hit.
#[must_use]
pub fn candidate_from_hit(hit: &Hit) -> Candidate {
    Candidate {
        peer: hit.peer.clone(),
        filename: hit.filename.clone(),
        size_bytes: hit.size_bytes,
        bitrate_kbps: hit.bitrate_kbps,
        format: hit
            .format
            .clone()
            .or_else(|| detect_format(&hit.filename))
            .unwrap_or_default(),
    }
}
