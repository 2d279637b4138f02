//! Pagination planning for the listing endpoint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePlan {
    pub total_available: u64,
    pub effective_total: u64,
    pub page_size: u64,
    pub pages: Vec<PageRequest>,
}

impl PagePlan {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Lay out `(offset, limit)` descriptors covering `min(total_available, hard_cap)`
/// records. The final page is shortened so a cap is honored exactly.
pub fn plan_pages(total_available: u64, page_size: u64, hard_cap: Option<u64>) -> PagePlan {
    let page_size = page_size.max(1);
    let effective_total = match hard_cap {
        Some(cap) => total_available.min(cap),
        None => total_available,
    };
    let page_count = effective_total.div_ceil(page_size);

    let pages = (0..page_count)
        .map(|index| {
            let offset = index * page_size;
            PageRequest {
                offset,
                limit: page_size.min(effective_total - offset),
            }
        })
        .collect();

    PagePlan {
        total_available,
        effective_total,
        page_size,
        pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_cover_total_without_gaps() {
        let plan = plan_pages(250, 100, None);
        assert_eq!(plan.effective_total, 250);
        assert_eq!(
            plan.pages,
            vec![
                PageRequest { offset: 0, limit: 100 },
                PageRequest { offset: 100, limit: 100 },
                PageRequest { offset: 200, limit: 50 },
            ]
        );
        let covered: u64 = plan.pages.iter().map(|p| p.limit).sum();
        assert_eq!(covered, 250);
    }

    #[test]
    fn hard_cap_limits_effective_total() {
        let plan = plan_pages(10_000, 100, Some(150));
        assert_eq!(plan.effective_total, 150);
        assert_eq!(plan.pages.len(), 2);
        assert_eq!(plan.pages[1], PageRequest { offset: 100, limit: 50 });

        let loose_cap = plan_pages(80, 100, Some(500));
        assert_eq!(loose_cap.effective_total, 80);
        assert_eq!(loose_cap.pages.len(), 1);
    }

    #[test]
    fn empty_source_yields_empty_plan() {
        assert!(plan_pages(0, 100, None).is_empty());
        assert!(plan_pages(500, 100, Some(0)).is_empty());
    }

    #[test]
    fn exact_multiple_has_no_trailing_page() {
        let plan = plan_pages(300, 100, None);
        assert_eq!(plan.pages.len(), 3);
        assert!(plan.pages.iter().all(|p| p.limit == 100));
    }
}
