//! Pure similarity primitives. Every function here is total: malformed or
//! empty input degrades to 0.0 instead of erroring.

use std::collections::HashSet;

use crate::time_window::{total_duration, CommuteSegment};

/// Overlap between two sets of commute segments, as a fraction of the longer
/// side's total duration. Clamped to `[0, 1]`; 0 when either side is empty.
pub fn time_overlap_ratio(a: &[CommuteSegment], b: &[CommuteSegment]) -> f32 {
    let mut overlap: u32 = 0;
    for sa in a {
        for sb in b {
            let lo = sa.start.max(sb.start);
            let hi = sa.end.min(sb.end);
            if hi > lo {
                overlap += u32::from(hi - lo);
            }
        }
    }

    // The max(1) keeps the ratio defined when both sides have zero duration.
    let denominator = total_duration(a).max(total_duration(b)).max(1);
    (overlap as f32 / denominator as f32).min(1.0)
}

fn normalized_set<S: AsRef<str>>(items: &[S]) -> HashSet<String> {
    items
        .iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Case-insensitive Jaccard similarity; 0 when the union is empty.
pub fn jaccard<S: AsRef<str>>(a: &[S], b: &[S]) -> f32 {
    let a = normalized_set(a);
    let b = normalized_set(b);

    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

/// 1.0 iff both professions are non-empty and equal after trimming and
/// lower-casing. Two blank professions do not count as a match.
pub fn profession_match(a: &str, b: &str) -> f32 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if !a.is_empty() && a == b {
        1.0
    } else {
        0.0
    }
}

/// Cosine similarity over two vectors. Returns 0.0 on empty input, mismatched
/// lengths, or a zero-norm side rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
