//! Board cache
//!
//! Caches the JSON, decoded data and rendered HTML of board indexes, catalogs
//! and threads under a global memory budget:
//!
//! - **Freshness**: an entry checked within the freshness window is served
//!   without asking the data source; after that its update counter is compared
//!   and the payload is refetched only when the counter moved.
//! - **Eviction**: size changes are queued to a background worker that drops
//!   least recently used entries while the budget is exceeded.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `boardcache.toml`:
//!
//! ```toml
//! [cache]
//! max_memory_bytes = 134217728
//! freshness_window_ms = 1000
//! eviction_queue_capacity = 1024
//! ```

mod config;
mod frontend;
mod keys;
mod lock;
pub mod pages;
mod registry;
mod service;
mod store;
mod worker;

pub use config::CacheConfig;
pub use frontend::{FrontEnd, HtmlFrontEnd};
pub use keys::{Key, LISTING_PAGE, board_key, thread_key};
pub use pages::{
    DEFAULT_PER_PAGE, Listing, ListingPage, ListingSource, Page, PageError, PageRef,
};
pub use service::{CacheService, CachedData, CachedHtml, CachedJson};
