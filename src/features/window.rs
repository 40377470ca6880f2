use serde::{Deserialize, Serialize};

use super::FeatureVector;

/// How to treat an input shorter than the window length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Produce no windows until enough vectors are available
    Strict,
    /// Produce one window right-padded with repetitions of the last vector
    Padded,
}

/// Fixed-length run of consecutive feature vectors
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub rows: Vec<FeatureVector>,
    /// Position in the source sequence of the last real (non-padding) row
    pub end: usize,
}

impl Window {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Cut `vectors` into stride-1 windows of `seq_len` in chronological order
pub fn build_windows(vectors: &[FeatureVector], seq_len: usize, policy: WindowPolicy) -> Vec<Window> {
    build_tail_windows(vectors, seq_len, policy, usize::MAX)
}

/// Like [`build_windows`], keeping only windows that end within the last `tail` vectors
pub fn build_tail_windows(
    vectors: &[FeatureVector],
    seq_len: usize,
    policy: WindowPolicy,
    tail: usize,
) -> Vec<Window> {
    let n = vectors.len();
    if seq_len < 2 || n == 0 || tail == 0 {
        return Vec::new();
    }

    if n < seq_len {
        return match policy {
            WindowPolicy::Strict => Vec::new(),
            WindowPolicy::Padded => {
                let mut rows = vectors.to_vec();
                let last = vectors[n - 1].clone();
                rows.resize(seq_len, last);
                vec![Window { rows, end: n - 1 }]
            }
        };
    }

    let count = n - seq_len + 1;
    let first = count.saturating_sub(tail);

    (first..count)
        .map(|start| Window {
            rows: vectors[start..start + seq_len].to_vec(),
            end: start + seq_len - 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vectors(n: usize) -> Vec<FeatureVector> {
        (0..n).map(|i| FeatureVector(vec![i as f64, -(i as f64)])).collect()
    }

    #[test]
    fn test_strict_window_counts() {
        for n in 0..12 {
            let windows = build_windows(&vectors(n), 5, WindowPolicy::Strict);
            assert_eq!(windows.len(), (n + 1).saturating_sub(5));
        }
    }

    #[test]
    fn test_windows_are_stride_one_and_chronological() {
        let windows = build_windows(&vectors(7), 3, WindowPolicy::Strict);

        assert_eq!(windows.len(), 5);
        for (i, window) in windows.iter().enumerate() {
            assert_eq!(window.len(), 3);
            assert_eq!(window.rows[0][0], i as f64);
            assert_eq!(window.end, i + 2);
        }
    }

    #[test]
    fn test_padded_short_input_repeats_last_row() {
        let input = vectors(3);
        let windows = build_windows(&input, 8, WindowPolicy::Padded);

        assert_eq!(windows.len(), 1);
        let window = &windows[0];
        assert_eq!(window.len(), 8);
        assert_eq!(window.end, 2);
        assert_eq!(&window.rows[..3], &input[..]);
        let repeats = window.rows.iter().skip(3).filter(|row| **row == input[2]).count();
        assert_eq!(repeats, 5);
    }

    #[test]
    fn test_padded_long_input_matches_strict() {
        let input = vectors(10);
        assert_eq!(
            build_windows(&input, 4, WindowPolicy::Padded),
            build_windows(&input, 4, WindowPolicy::Strict)
        );
    }

    #[test]
    fn test_degenerate_inputs_yield_nothing() {
        assert!(build_windows(&[], 5, WindowPolicy::Padded).is_empty());
        assert!(build_windows(&vectors(10), 1, WindowPolicy::Strict).is_empty());
        assert!(build_windows(&vectors(10), 0, WindowPolicy::Padded).is_empty());
    }

    #[test]
    fn test_tail_windows_end_at_last_positions() {
        let windows = build_tail_windows(&vectors(10), 4, WindowPolicy::Strict, 3);

        assert_eq!(windows.len(), 3);
        let ends: Vec<usize> = windows.iter().map(|w| w.end).collect();
        assert_eq!(ends, vec![7, 8, 9]);

        // Tail longer than available windows returns them all
        assert_eq!(build_tail_windows(&vectors(10), 4, WindowPolicy::Strict, 50).len(), 7);
    }
}
