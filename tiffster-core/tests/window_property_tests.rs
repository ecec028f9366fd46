//! Property-Based Tests for Window Arithmetic
//!
//! For every current page >= 1, window size >= 1 and optional total >= 1,
//! `compute_window` returns a non-empty, contiguous, ascending run of pages
//! no longer than the window size, all >= 1 and <= total when known.

use proptest::prelude::*;
use tiffster_core::compute_window;

// ============================================================================
// PROPERTY TEST STRATEGIES
// ============================================================================

fn page_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        // Near the start of the document
        1..5i64,
        // Typical documents
        1..500i64,
        // Very long documents
        1..1_000_000i64,
        // Top of the page number range
        (i64::MAX - 100)..=i64::MAX,
    ]
}

fn window_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![1..4u32, 1..64u32]
}

fn total_strategy() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![
        1 => Just(None),
        3 => (1..1_000i64).prop_map(Some),
    ]
}

proptest! {
    #[test]
    fn prop_window_is_contiguous_and_bounded(
        page in page_strategy(),
        size in window_size_strategy(),
        total in total_strategy(),
    ) {
        let window = compute_window(page, size, total);

        prop_assert!(!window.is_empty());
        prop_assert!(window.len() <= size as usize);
        prop_assert!(window.iter().all(|p| *p >= 1));
        prop_assert!(window.windows(2).all(|pair| pair[1] == pair[0] + 1));

        if let Some(total) = total {
            prop_assert!(window.iter().all(|p| *p <= total));
        }
    }

    #[test]
    fn prop_window_is_deterministic(
        page in page_strategy(),
        size in window_size_strategy(),
        total in total_strategy(),
    ) {
        prop_assert_eq!(compute_window(page, size, total), compute_window(page, size, total));
    }

    #[test]
    fn prop_window_keeps_full_length_when_pages_allow(
        page in page_strategy(),
        size in window_size_strategy(),
        total in total_strategy(),
    ) {
        let window = compute_window(page, size, total);
        let available = total.unwrap_or(i64::MAX);
        let expected = (size as i64).min(available) as usize;
        prop_assert_eq!(window.len(), expected);
    }

    #[test]
    fn prop_window_contains_current_page_when_in_range(
        page in 1..1_000i64,
        size in window_size_strategy(),
        total in total_strategy(),
    ) {
        let in_range = total.map_or(true, |t| page <= t);
        prop_assume!(in_range);
        prop_assert!(compute_window(page, size, total).contains(&page));
    }
}
