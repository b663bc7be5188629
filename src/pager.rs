use serde::{Deserialize, Serialize};

/// Records shown per page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
    Previous,
}

/// Offset pagination over a filtered record set.
///
/// Always valid: `1 <= current_page <= total_pages` and `total_pages >= 1`,
/// so an empty set still has one (empty) page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageState {
    pub current_page: u64,
    pub page_size: u64,
    pub total_items: u64,
    pub total_pages: u64,
}

impl PageState {
    /// First page of an empty set.
    pub fn empty(page_size: u64) -> Self {
        Self::recompute(0, page_size, 1)
    }

    /// Clamps `requested_page` into the page range for `total_items`.
    /// Never fails; a zero page size is treated as 1.
    pub fn recompute(total_items: u64, page_size: u64, requested_page: u64) -> Self {
        let page_size = page_size.max(1);
        let total_pages = total_items.div_ceil(page_size).max(1);
        Self {
            current_page: requested_page.clamp(1, total_pages),
            page_size,
            total_items,
            total_pages,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.current_page - 1) * self.page_size
    }

    pub fn limit(&self) -> u64 {
        self.page_size
    }

    /// Moves one page in `direction`. Returns false (and leaves the state
    /// alone) at either boundary. Totals are untouched until the next
    /// `recompute`.
    pub fn advance(&mut self, direction: Direction) -> bool {
        match direction {
            Direction::Next if self.current_page < self.total_pages => {
                self.current_page += 1;
                true
            }
            Direction::Previous if self.current_page > 1 => {
                self.current_page -= 1;
                true
            }
            _ => false,
        }
    }
}
