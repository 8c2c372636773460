//! Normalized Levenshtein distance with three-sample extrapolation for
//! long strings. The exact metric isn't security-critical — it's a
//! heuristic for "enough editing happened".

/// Above this char length, exact Levenshtein is replaced with the sampled
/// approximation to keep `CheckUnlock` cheap on large documents.
const LONG_STRING_THRESHOLD: usize = 10_000;

/// Width of each of the three fixed-size samples (start/middle/end).
const SAMPLE_SIZE: usize = 1_000;

/// Normalized edit distance between `baseline` and `current`, in `[0, 1]`
/// for same-length inputs (can exceed 1 when lengths differ a lot, same as
/// raw-distance-over-max-len always can).
pub fn normalized_distance(baseline: &str, current: &str) -> f64 {
    let baseline_chars: Vec<char> = baseline.chars().collect();
    let current_chars: Vec<char> = current.chars().collect();
    let max_len = baseline_chars.len().max(current_chars.len()).max(1) as f64;

    if baseline_chars.len() > LONG_STRING_THRESHOLD || current_chars.len() > LONG_STRING_THRESHOLD {
        return sampled_distance(&baseline_chars, &current_chars) / max_len;
    }

    let raw = strsim::levenshtein(baseline, current) as f64;
    raw / max_len
}

fn sample(chars: &[char], start: usize, len: usize) -> String {
    let end = (start + len).min(chars.len());
    let start = start.min(end);
    chars[start..end].iter().collect()
}

/// Three fixed-size samples (start, middle, end), extrapolated to an
/// estimate of the full-document raw distance:
/// `avg_sample_distance × (max_len / avg_sample_len / 3) + |length_delta|`.
fn sampled_distance(baseline: &[char], current: &[char]) -> f64 {
    let max_len = baseline.len().max(current.len()) as f64;
    let length_delta = (current.len() as i64 - baseline.len() as i64).unsigned_abs() as f64;

    let baseline_mid = baseline.len().saturating_sub(SAMPLE_SIZE) / 2;
    let current_mid = current.len().saturating_sub(SAMPLE_SIZE) / 2;
    let baseline_tail = baseline.len().saturating_sub(SAMPLE_SIZE);
    let current_tail = current.len().saturating_sub(SAMPLE_SIZE);

    let pairs = [
        (sample(baseline, 0, SAMPLE_SIZE), sample(current, 0, SAMPLE_SIZE)),
        (
            sample(baseline, baseline_mid, SAMPLE_SIZE),
            sample(current, current_mid, SAMPLE_SIZE),
        ),
        (
            sample(baseline, baseline_tail, SAMPLE_SIZE),
            sample(current, current_tail, SAMPLE_SIZE),
        ),
    ];

    let mut total_distance = 0usize;
    let mut total_sample_len = 0usize;
    for (a, b) in &pairs {
        total_distance += strsim::levenshtein(a, b);
        total_sample_len += a.chars().count().max(b.chars().count());
    }

    let avg_sample_distance = total_distance as f64 / pairs.len() as f64;
    let avg_sample_len = (total_sample_len as f64 / pairs.len() as f64).max(1.0);

    avg_sample_distance * (max_len / avg_sample_len / 3.0) + length_delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(normalized_distance("sound(\"bd\")", "sound(\"bd\")"), 0.0);
    }

    #[test]
    fn completely_different_short_strings_have_distance_one() {
        let a = "aaaaaaaaaa";
        let b = "bbbbbbbbbb";
        assert_eq!(normalized_distance(a, b), 1.0);
    }

    #[test]
    fn total_replacement_meets_unlock_threshold() {
        // A 300-char paste replaced by a 30-char string is a complete
        // rewrite, normalized distance 1.0.
        let baseline = "x".repeat(300);
        let current = "y".repeat(30);
        assert!(normalized_distance(&baseline, &current) >= 0.30);
    }

    #[test]
    fn minor_edit_stays_below_unlock_threshold() {
        let baseline = "sound(\"bd sn hh*4 cp\").room(0.3).gain(0.8)";
        let current = "sound(\"bd sn hh*4 cp\").room(0.3).gain(0.9)";
        assert!(normalized_distance(baseline, current) < 0.30);
    }

    #[test]
    fn long_strings_use_sampled_approximation_and_dont_panic() {
        let baseline = "abc ".repeat(5_000);
        let mut current = baseline.clone();
        current.push_str("tail addition that changes the end of the document");
        let d = normalized_distance(&baseline, &current);
        assert!(d >= 0.0);
        assert!(d.is_finite());
    }
}
