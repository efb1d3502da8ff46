//! Cache key definitions.
//!
//! Every cacheable resource (thread pages, board indexes, catalogs, single
//! board pages) is addressed by one composite `Key`. Equality is structural and
//! is the sole admission criterion for a cache hit.

use std::fmt;

/// Page number used for the key of a whole listing, as opposed to one page of it.
pub const LISTING_PAGE: i64 = -1;

/// Identifies one cacheable resource instance.
///
/// The meaning of the fields depends on the resource kind:
/// thread keys use `id` and `last_n`, board keys use `board`, `page` and
/// `last_n` (as the index-variant flag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub board: String,
    pub id: u64,
    pub last_n: u8,
    pub page: i64,
}

impl Key {
    /// Key for a thread, optionally limited to its last `last_n` posts (0 = all).
    pub fn thread(id: u64, last_n: u8) -> Self {
        Self {
            id,
            last_n,
            ..Self::default()
        }
    }

    /// Key for a board resource: a catalog, a board index or one page of it.
    ///
    /// Index variants are told apart from catalogs by `last_n == 1`.
    pub fn board(board: impl Into<String>, page: i64, index: bool) -> Self {
        Self {
            board: board.into(),
            page,
            last_n: u8::from(index),
            ..Self::default()
        }
    }

    /// Returns true for keys produced by [`Key::thread`].
    pub fn is_thread(&self) -> bool {
        self.board.is_empty()
    }

    /// Returns true for board keys built with the index flag set.
    pub fn is_index(&self) -> bool {
        !self.is_thread() && self.last_n == 1
    }

    /// Same resource, different page.
    pub fn with_page(&self, page: i64) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_thread() {
            write!(f, "thread:{}/last{}", self.id, self.last_n)
        } else {
            let kind = if self.is_index() { "index" } else { "catalog" };
            write!(f, "{kind}:/{}/p{}", self.board, self.page)
        }
    }
}

/// Encodes a key from a thread's ID and the number of trailing posts to show.
pub fn thread_key(id: u64, last_n: u8) -> Key {
    Key::thread(id, last_n)
}

/// Encodes a key for a board page resource.
pub fn board_key(board: &str, page: i64, index: bool) -> Key {
    Key::board(board, page, index)
}
