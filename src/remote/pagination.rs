//! Restartable page sequences.
//!
//! A `Paginator` only advances its cursor after a page has been fetched
//! successfully, so a failed fetch can be retried (or resumed by a later
//! run) from the same position. Pages are never skipped.

use std::fmt;
use std::future::Future;

use super::RemoteError;

/// Position in a paged listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// First page, whatever the upstream calls it.
    Start,
    /// 1-based page number.
    Number(u32),
    /// Absolute next-page URL handed back by the upstream.
    Url(String),
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Number(n) => write!(f, "{}", n),
            Self::Url(url) => f.write_str(url),
        }
    }
}

impl PageCursor {
    /// Page number for numbered listings; `Start` is page 1.
    pub fn page_number(&self) -> u32 {
        match self {
            Self::Number(n) => *n,
            _ => 1,
        }
    }
}

/// One fetched page and the cursor of the page after it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

impl<T> Page<T> {
    /// A page of a numbered listing. An empty or short page is the last one.
    pub fn numbered(items: Vec<T>, page: u32, per_page: usize) -> Self {
        let next = if items.is_empty() || items.len() < per_page {
            None
        } else {
            Some(PageCursor::Number(page + 1))
        };
        Self { items, next }
    }

    /// A page of a numbered listing whose page size the upstream may cap
    /// below the requested size. Only an empty page ends it.
    pub fn until_empty(items: Vec<T>, page: u32) -> Self {
        let next = (!items.is_empty()).then_some(PageCursor::Number(page + 1));
        Self { items, next }
    }

    /// A page of a linked listing. A missing or blank next URL ends it.
    pub fn linked(items: Vec<T>, next_url: Option<String>) -> Self {
        let next = next_url
            .filter(|url| !url.trim().is_empty())
            .map(PageCursor::Url);
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

pub struct Paginator {
    endpoint: String,
    next: Option<PageCursor>,
    pages_fetched: u32,
}

impl Paginator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::resume_from(endpoint, PageCursor::Start)
    }

    pub fn resume_from(endpoint: impl Into<String>, cursor: PageCursor) -> Self {
        Self {
            endpoint: endpoint.into(),
            next: Some(cursor),
            pages_fetched: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cursor of the page the next call will fetch; `None` once exhausted.
    pub fn cursor(&self) -> Option<&PageCursor> {
        self.next.as_ref()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Fetch the next page with `fetch`. Returns `Ok(None)` when the listing
    /// is exhausted. Errors are tagged with the endpoint and cursor, and
    /// leave the paginator positioned on the failed page.
    pub async fn next_page<T, F, Fut>(&mut self, fetch: F) -> Result<Option<Vec<T>>, RemoteError>
    where
        F: FnOnce(PageCursor) -> Fut,
        Fut: Future<Output = Result<Page<T>, RemoteError>>,
    {
        let Some(cursor) = self.next.clone() else {
            return Ok(None);
        };

        match fetch(cursor.clone()).await {
            Ok(page) => {
                self.pages_fetched += 1;
                log::debug!(
                    "{}: page {} returned {} item(s)",
                    self.endpoint,
                    cursor,
                    page.items.len()
                );
                self.next = page.next;
                Ok(Some(page.items))
            }
            Err(err) => Err(RemoteError::Page {
                endpoint: self.endpoint.clone(),
                cursor: cursor.to_string(),
                source: Box::new(err),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn numbered_source(cursor: PageCursor) -> Result<Page<u32>, RemoteError> {
        let page = cursor.page_number();
        let items = match page {
            1 => vec![1, 2],
            2 => vec![3, 4],
            3 => vec![5],
            _ => vec![],
        };
        Ok(Page::numbered(items, page, 2))
    }

    #[tokio::test]
    async fn test_numbered_listing_stops_on_short_page() {
        let mut pages = Paginator::new("/items");
        let mut seen = Vec::new();
        while let Some(items) = pages.next_page(numbered_source).await.unwrap() {
            seen.extend(items);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(pages.pages_fetched(), 3);
        assert!(pages.cursor().is_none());
    }

    #[tokio::test]
    async fn test_failed_page_keeps_cursor() {
        let mut pages = Paginator::resume_from("/items", PageCursor::Number(2));
        let err = pages
            .next_page(|_| async {
                Err::<Page<u32>, _>(RemoteError::Throttled { attempts: 3 })
            })
            .await
            .unwrap_err();
        match err {
            RemoteError::Page { endpoint, cursor, .. } => {
                assert_eq!(endpoint, "/items");
                assert_eq!(cursor, "2");
            }
            other => panic!("expected page error, got {other:?}"),
        }
        assert_eq!(pages.cursor(), Some(&PageCursor::Number(2)));

        // Retrying from the same position picks up where it failed.
        let items = pages.next_page(numbered_source).await.unwrap().unwrap();
        assert_eq!(items, vec![3, 4]);
    }

    #[test]
    fn test_linked_page_blank_url_ends_listing() {
        let page = Page::linked(vec![1], Some("  ".to_string()));
        assert!(page.next.is_none());
        let page = Page::linked(vec![1], Some("https://x/next".to_string()));
        assert_eq!(page.next, Some(PageCursor::Url("https://x/next".to_string())));
    }

    #[test]
    fn test_empty_numbered_page_ends_listing() {
        let page: Page<u8> = Page::numbered(vec![], 1, 100);
        assert!(page.next.is_none());
    }
}
