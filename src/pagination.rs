//! Page parameters and page results

use serde::{Deserialize, Serialize};

use crate::config::QuerySettings;

/// How paginated reads limit rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaginationStrategy {
    /// `PreFilter` whenever a collection is joined, `Direct` otherwise
    #[default]
    Auto,
    /// LIMIT/OFFSET on the full query; counts can drift when joins repeat rows
    Direct,
    /// Page over distinct identities first, then load the page's entities
    PreFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageParams {
    pub limit: u64,
    pub offset: u64,
}

impl PageParams {
    /// 1-based page of `size` items
    pub fn page(page: u64, size: u64) -> Self {
        let size = size.max(1);
        Self {
            limit: size,
            offset: page.saturating_sub(1).saturating_mul(size),
        }
    }

    pub fn limit_offset(limit: u64, offset: u64) -> Self {
        Self { limit, offset }
    }

    /// Keep the page size within `1..=max_page_size`
    pub fn clamped(self, settings: &QuerySettings) -> Self {
        Self {
            limit: self.limit.clamp(1, settings.max_page_size.max(1)),
            offset: self.offset,
        }
    }

    pub fn first(settings: &QuerySettings) -> Self {
        Self::page(1, settings.default_page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    /// 1-based page number
    pub page: u64,
    pub size: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, params: PageParams) -> Self {
        let size = params.limit.max(1);
        Self {
            items,
            total,
            page: params.offset / size + 1,
            size,
            pages: total.div_ceil(size),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
            pages: self.pages,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
            total: self.total,
            page: self.page,
            size: self.size,
            pages: self.pages,
        })
    }
}

/// Result of a listing: everything, or one page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Items(Vec<T>),
    Page(Page<T>),
}

impl<T> Listing<T> {
    pub fn items(&self) -> &[T] {
        match self {
            Listing::Items(items) => items,
            Listing::Page(page) => &page.items,
        }
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Listing::Items(items) => items,
            Listing::Page(page) => page.items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_params() {
        assert_eq!(PageParams::page(3, 20), PageParams::limit_offset(20, 40));
        assert_eq!(PageParams::page(0, 20).offset, 0);
        let settings = QuerySettings::default();
        assert_eq!(PageParams::limit_offset(1000, 0).clamped(&settings).limit, settings.max_page_size);
        assert_eq!(PageParams::limit_offset(0, 0).clamped(&settings).limit, 1);
    }

    #[test]
    fn test_page_metadata() {
        let page = Page::new(vec![1, 2], 12, PageParams::page(2, 5));
        assert_eq!(page.page, 2);
        assert_eq!(page.pages, 3);
        assert_eq!(page.map(|n| n * 10).items, vec![10, 20]);

        let empty: Page<u8> = Page::new(vec![], 0, PageParams::page(1, 5));
        assert_eq!(empty.pages, 0);
    }

    #[test]
    fn test_listing_serializes_untagged() {
        let listing = Listing::Page(Page::new(vec!["a"], 1, PageParams::page(1, 10)));
        let json = serde_json::to_value(&listing).expect("serializes");
        assert_eq!(json["total"], 1);
        assert_eq!(Listing::Items(vec![1]).into_items(), vec![1]);
    }
}
