//! Window arithmetic.
//!
//! Decides which pages should be resident around the current page. The
//! window is centered when possible, shifts forward near the first page and
//! backward near the last known page, and is never longer than requested.

use crate::PageNumber;

/// Pages that should be resident, ascending.
///
/// `current_page` and `window_size` must be at least 1; anything else is a
/// caller bug rather than a runtime condition. When `total_pages` is unknown
/// no upper clamp is applied, so the window may extend past the real end.
pub fn compute_window(
    current_page: PageNumber,
    window_size: u32,
    total_pages: Option<PageNumber>,
) -> Vec<PageNumber> {
    let size = i64::from(window_size);
    let half = size / 2;

    let mut start = current_page.saturating_sub(half).max(1);
    let mut end = start.saturating_add(size - 1);
    // Pinned at the top of the page range: shift back rather than shrink.
    start = start.min(end.saturating_sub(size - 1)).max(1);

    if let Some(total) = total_pages {
        if end > total {
            end = total;
            start = end.saturating_sub(size - 1).max(1);
        }
    }

    (start..=end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_window_without_total() {
        assert_eq!(compute_window(5, 3, None), vec![4, 5, 6]);
        assert_eq!(compute_window(10, 5, None), vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_window_shifts_forward_at_start() {
        assert_eq!(compute_window(1, 3, None), vec![1, 2, 3]);
        assert_eq!(compute_window(2, 5, None), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_window_shifts_backward_at_end() {
        assert_eq!(compute_window(10, 3, Some(10)), vec![8, 9, 10]);
        assert_eq!(compute_window(9, 5, Some(10)), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_even_window_sizes() {
        assert_eq!(compute_window(2, 4, Some(5)), vec![1, 2, 3, 4]);
        assert_eq!(compute_window(5, 4, None), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_window_shrinks_only_when_document_is_short() {
        assert_eq!(compute_window(1, 5, Some(2)), vec![1, 2]);
        assert_eq!(compute_window(2, 3, Some(1)), vec![1]);
    }

    #[test]
    fn test_single_page_window() {
        assert_eq!(compute_window(7, 1, None), vec![7]);
        assert_eq!(compute_window(7, 1, Some(7)), vec![7]);
    }

    #[test]
    fn test_current_page_past_total_clamps_to_tail() {
        assert_eq!(compute_window(20, 3, Some(10)), vec![8, 9, 10]);
    }

    #[test]
    fn test_largest_page_number_does_not_overflow() {
        let max = PageNumber::MAX;
        assert_eq!(compute_window(max, 3, None), vec![max - 2, max - 1, max]);
        assert_eq!(compute_window(max, 4, None), vec![max - 3, max - 2, max - 1, max]);
        assert_eq!(compute_window(max - 1, 1, None), vec![max - 1]);
        assert_eq!(compute_window(max, 3, Some(10)), vec![8, 9, 10]);
        assert_eq!(compute_window(max, 3, Some(max)), vec![max - 2, max - 1, max]);
    }
}
