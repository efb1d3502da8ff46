//! Paginated listings.
//!
//! A board index is cached as one listing entry holding every page, keyed with
//! [`LISTING_PAGE`], plus one entry per requested page. Page entries borrow
//! their data and JSON from the listing and only own their rendered HTML.

use std::error::Error as StdError;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use thiserror::Error;

use super::frontend::{FrontEnd, HtmlFrontEnd};
use super::keys::{Key, LISTING_PAGE};
use super::service::CacheService;

/// Items per page of a board index.
pub const DEFAULT_PER_PAGE: usize = 15;

/// Supplies the ordered items of a listing, e.g. the threads of a board.
#[async_trait]
pub trait ListingSource: Send + Sync {
    type Item: Serialize + Send + Sync + 'static;
    type Error: StdError + From<serde_json::Error> + Send + Sync + 'static;

    /// Update counter of the whole listing.
    async fn counter(&self, key: &Key) -> Result<u64, Self::Error>;

    /// Every item of the listing, in display order.
    async fn items(&self, key: &Key) -> Result<Vec<Self::Item>, Self::Error>;

    /// Renders the HTML of one page.
    fn render_page(&self, page: &Page<Self::Item>, json: &Bytes) -> Bytes;
}

/// One page of a listing with its pre-encoded JSON.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    #[serde(skip)]
    pub number: usize,
    #[serde(rename = "threads")]
    pub items: Vec<T>,
    /// Total page count of the listing.
    pub pages: usize,
    #[serde(skip)]
    json: Bytes,
}

impl<T> Page<T> {
    pub fn json(&self) -> &Bytes {
        &self.json
    }
}

/// A page borrowed from a cached listing.
#[derive(Debug)]
pub struct PageRef<T> {
    listing: Arc<Vec<Page<T>>>,
    index: usize,
}

impl<T> PageRef<T> {
    pub fn page(&self) -> &Page<T> {
        &self.listing[self.index]
    }
}

impl<T> Deref for PageRef<T> {
    type Target = Page<T>;

    fn deref(&self) -> &Page<T> {
        self.page()
    }
}

impl<T: Serialize> Serialize for PageRef<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.page().serialize(serializer)
    }
}

/// Strategy for a whole listing, split into pages of `per_page` items.
///
/// Use with keys whose page is [`LISTING_PAGE`].
pub struct Listing<S> {
    source: S,
    per_page: usize,
}

impl<S: ListingSource> Listing<S> {
    pub fn new(source: S) -> Self {
        Self::with_per_page(source, DEFAULT_PER_PAGE)
    }

    pub fn with_per_page(source: S, per_page: usize) -> Self {
        Self {
            source,
            per_page: per_page.max(1),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn paginate(&self, items: Vec<S::Item>) -> Result<Vec<Page<S::Item>>, serde_json::Error> {
        let total = items.len().div_ceil(self.per_page).max(1);
        let mut pages = Vec::with_capacity(total);
        let mut items = items.into_iter().peekable();

        // an empty listing still has one (empty) page
        loop {
            pages.push(Page {
                number: pages.len(),
                items: items.by_ref().take(self.per_page).collect(),
                pages: total,
                json: Bytes::new(),
            });
            if items.peek().is_none() {
                break;
            }
        }

        for page in &mut pages {
            page.json = Bytes::from(serde_json::to_vec(&page)?);
        }
        Ok(pages)
    }
}

#[async_trait]
impl<S: ListingSource> FrontEnd for Listing<S> {
    type Data = Vec<Page<S::Item>>;
    type Error = S::Error;

    async fn counter(&self, key: &Key) -> Result<u64, S::Error> {
        self.source.counter(key).await
    }

    async fn fresh(&self, key: &Key) -> Result<Vec<Page<S::Item>>, S::Error> {
        let items = self.source.items(key).await?;
        Ok(self.paginate(items)?)
    }

    /// Joins the already encoded pages into one JSON array.
    fn encode_json(&self, pages: &Vec<Page<S::Item>>) -> Result<Bytes, S::Error> {
        let mut buf = Vec::with_capacity(pages.iter().map(|page| page.json.len() + 1).sum::<usize>() + 1);
        buf.push(b'[');
        for (i, page) in pages.iter().enumerate() {
            if i != 0 {
                buf.push(b',');
            }
            buf.extend_from_slice(&page.json);
        }
        buf.push(b']');
        Ok(Bytes::from(buf))
    }

    fn size(&self, pages: &Vec<Page<S::Item>>, _json: &Bytes, _html: Option<&Bytes>) -> usize {
        pages.iter().map(|page| page.json.len() * 2).sum()
    }
}

/// Errors of [`ListingPage`].
#[derive(Debug, Error)]
pub enum PageError<E>
where
    E: StdError + Send + Sync + 'static,
{
    #[error("page {page} not found, listing has {pages} page(s)")]
    Overflow { page: i64, pages: usize },
    #[error(transparent)]
    Source(E),
    #[error("failed to encode page: {0}")]
    Json(#[from] serde_json::Error),
}

/// Strategy for single pages of a listing.
///
/// Counter and data come from the listing entry of the same board, fetched
/// through the cache, so a page is invalidated whenever its listing is.
pub struct ListingPage<S> {
    cache: Arc<CacheService>,
    listing: Arc<Listing<S>>,
}

impl<S: ListingSource> ListingPage<S> {
    pub fn new(cache: Arc<CacheService>, listing: Arc<Listing<S>>) -> Self {
        Self { cache, listing }
    }

    fn listing_key(key: &Key) -> Result<Key, PageError<S::Error>> {
        // a negative page would alias the listing entry itself
        if key.page < 0 {
            return Err(PageError::Overflow {
                page: key.page,
                pages: 0,
            });
        }
        Ok(key.with_page(LISTING_PAGE))
    }
}

#[async_trait]
impl<S: ListingSource> FrontEnd for ListingPage<S> {
    type Data = PageRef<S::Item>;
    type Error = PageError<S::Error>;

    async fn counter(&self, key: &Key) -> Result<u64, Self::Error> {
        let listing_key = Self::listing_key(key)?;
        let cached = self
            .cache
            .get_json_and_data(&listing_key, self.listing.as_ref())
            .await
            .map_err(PageError::Source)?;
        Ok(cached.counter)
    }

    async fn fresh(&self, key: &Key) -> Result<PageRef<S::Item>, Self::Error> {
        let listing_key = Self::listing_key(key)?;
        let cached = self
            .cache
            .get_json_and_data(&listing_key, self.listing.as_ref())
            .await
            .map_err(PageError::Source)?;

        let pages = cached.data.len();
        let index = usize::try_from(key.page)
            .ok()
            .filter(|index| *index < pages)
            .ok_or(PageError::Overflow {
                page: key.page,
                pages,
            })?;

        Ok(PageRef {
            listing: cached.data,
            index,
        })
    }

    fn encode_json(&self, data: &PageRef<S::Item>) -> Result<Bytes, Self::Error> {
        Ok(data.json.clone())
    }

    /// Only the HTML is owned by a page entry.
    fn size(&self, _data: &PageRef<S::Item>, _json: &Bytes, html: Option<&Bytes>) -> usize {
        html.map_or(0, Bytes::len)
    }
}

impl<S: ListingSource> HtmlFrontEnd for ListingPage<S> {
    fn render_html(&self, data: &PageRef<S::Item>, json: &Bytes) -> Bytes {
        self.listing.source.render_page(data.page(), json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error(transparent)]
    struct StubError(#[from] serde_json::Error);

    struct Numbers;

    #[async_trait]
    impl ListingSource for Numbers {
        type Item = u32;
        type Error = StubError;

        async fn counter(&self, _key: &Key) -> Result<u64, StubError> {
            Ok(1)
        }

        async fn items(&self, _key: &Key) -> Result<Vec<u32>, StubError> {
            Ok(Vec::new())
        }

        fn render_page(&self, page: &Page<u32>, _json: &Bytes) -> Bytes {
            Bytes::from(format!("{:?}", page.items))
        }
    }

    #[test]
    fn paginates_into_fixed_size_pages() {
        let listing = Listing::with_per_page(Numbers, 3);
        let pages = listing.paginate((1..=7).collect()).unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].items, vec![1, 2, 3]);
        assert_eq!(pages[2].items, vec![7]);
        assert!(pages.iter().all(|page| page.pages == 3));
        assert_eq!(pages[2].number, 2);
        assert_eq!(&pages[2].json()[..], br#"{"threads":[7],"pages":3}"#);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_page() {
        let listing = Listing::with_per_page(Numbers, 3);
        let pages = listing.paginate((1..=6).collect()).unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].items, vec![4, 5, 6]);
    }

    #[test]
    fn empty_listing_has_one_empty_page() {
        let listing = Listing::new(Numbers);
        let pages = listing.paginate(Vec::new()).unwrap();

        assert_eq!(pages.len(), 1);
        assert_eq!(&pages[0].json()[..], br#"{"threads":[],"pages":1}"#);
    }

    #[test]
    fn listing_json_joins_pages() {
        let listing = Listing::with_per_page(Numbers, 2);
        let pages = listing.paginate(vec![1, 2, 3]).unwrap();

        let json = listing.encode_json(&pages).unwrap();
        assert_eq!(
            &json[..],
            br#"[{"threads":[1,2],"pages":2},{"threads":[3],"pages":2}]"#
        );
        assert_eq!(
            listing.size(&pages, &json, None),
            pages.iter().map(|page| page.json().len() * 2).sum::<usize>()
        );
    }

    #[test]
    fn zero_per_page_is_clamped() {
        let listing = Listing::with_per_page(Numbers, 0);
        let pages = listing.paginate(vec![1, 2]).unwrap();
        assert_eq!(pages.len(), 2);
    }
}
