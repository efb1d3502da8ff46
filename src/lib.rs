//! Memory-bounded cache for board indexes, catalogs and threads.
//!
//! See [`cache::CacheService`] for the retrieval API.

pub mod cache;
pub mod config;
pub mod infra;
