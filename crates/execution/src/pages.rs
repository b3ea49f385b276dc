//! Page count discovery for listings that never state their size.

use std::future::Future;

use harvester_core::EngineError;
use tracing::debug;

/// Initial bounds of a page count search.
///
/// `max` is only a first guess; the search grows past it while pages keep
/// having items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    /// First page, assumed to exist
    pub min: i64,
    /// Initial upper guess
    pub max: i64,
}

impl Default for PageRange {
    fn default() -> Self {
        Self { min: 1, max: 100 }
    }
}

/// Find the last page that has items, searching from [`PageRange::default`].
///
/// See [`find_page_count_in`].
pub async fn find_page_count<F, Fut>(has_items: F) -> anyhow::Result<i64>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    find_page_count_in(PageRange::default(), has_items).await
}

/// Find the last page that has items by binary search over `range`.
///
/// `has_items(page)` tells whether a page exists. Pages are assumed to exist
/// up to some count and be empty after it. When the checked page has items
/// the window is widened past `max`, so counts above the initial guess are
/// found too. Fails with [`EngineError::InvalidConfig`] when `min > max`.
pub async fn find_page_count_in<F, Fut>(range: PageRange, mut has_items: F) -> anyhow::Result<i64>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    if range.min > range.max {
        return Err(EngineError::InvalidConfig(format!(
            "min page {} cannot be bigger than max page {}",
            range.min, range.max
        ))
        .into());
    }

    debug!(min = range.min, max = range.max, "finding page count");
    let PageRange { mut min, mut max } = range;
    let mut guesses = 0u32;
    loop {
        guesses += 1;
        let current = min + (max - min) / 2;
        if has_items(current).await? {
            min = current;
            max = max.saturating_add(max - min);
        } else {
            max = current;
        }

        if max - min <= 1 {
            debug!(pages = min, guesses, "found page count");
            return Ok(min);
        }
    }
}
