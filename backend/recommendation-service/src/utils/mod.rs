// Utility functions for recommendation-service

use std::cmp::Ordering;

/// Normalize a score to [0, 1] range
pub fn normalize_score(score: f64, min: f64, max: f64) -> f64 {
    if max - min < f64::EPSILON {
        if max > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        ((score - min) / (max - min)).clamp(0.0, 1.0)
    }
}

/// Descending by score, ties broken by ascending id so orderings are stable
pub fn compare_scored(a: &(String, f64), b: &(String, f64)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

pub fn sort_scored(items: &mut [(String, f64)]) {
    items.sort_by(compare_scored);
}

/// Top `k` entries in `compare_scored` order
pub fn top_k(mut items: Vec<(String, f64)>, k: usize) -> Vec<(String, f64)> {
    if k == 0 {
        return Vec::new();
    }
    if items.len() > k {
        items.select_nth_unstable_by(k - 1, compare_scored);
        items.truncate(k);
    }
    sort_scored(&mut items);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_score() {
        assert!((normalize_score(5.0, 0.0, 10.0) - 0.5).abs() < 0.001);
        assert!((normalize_score(10.0, 0.0, 10.0) - 1.0).abs() < 0.001);
        assert!((normalize_score(0.0, 0.0, 10.0) - 0.0).abs() < 0.001);
        // Degenerate range: a single positive score is the best score
        assert_eq!(normalize_score(3.0, 3.0, 3.0), 1.0);
    }

    #[test]
    fn test_top_k_tie_break() {
        let items = vec![
            ("b".to_string(), 0.5),
            ("a".to_string(), 0.5),
            ("c".to_string(), 0.9),
            ("d".to_string(), 0.1),
        ];
        let top = top_k(items, 3);
        let ids: Vec<&str> = top.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
