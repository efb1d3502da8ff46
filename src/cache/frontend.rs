//! Strategy traits supplying cacheable data.
//!
//! A `FrontEnd` knows how to validate and produce the data and JSON of one
//! resource kind. It owns no cache state and is shared by every entry of
//! that kind. Rendering HTML is an optional capability expressed by
//! [`HtmlFrontEnd`].

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use super::keys::Key;

/// Fetches, validates and encodes one kind of cacheable resource.
///
/// `counter` and `fresh` are mandatory. A changed counter must imply changed
/// data; the same counter must never be reported for different data while the
/// cache is alive. Errors from any method are handed back to the caller of the
/// cache unchanged and never commit anything to the cache.
#[async_trait]
pub trait FrontEnd: Send + Sync {
    /// Canonical in-memory representation of the resource.
    type Data: Serialize + Send + Sync + 'static;
    type Error: StdError + From<serde_json::Error> + Send + Sync + 'static;

    /// Retrieves the current update counter of the resource.
    async fn counter(&self, key: &Key) -> Result<u64, Self::Error>;

    /// Retrieves fresh data for the resource.
    async fn fresh(&self, key: &Key) -> Result<Self::Data, Self::Error>;

    /// Encodes data into JSON.
    fn encode_json(&self, data: &Self::Data) -> Result<Bytes, Self::Error> {
        Ok(Bytes::from(serde_json::to_vec(data)?))
    }

    /// Approximate memory held by one entry of this kind.
    ///
    /// This is an estimate from encoded lengths, not a heap measurement.
    fn size(&self, _data: &Self::Data, json: &Bytes, html: Option<&Bytes>) -> usize {
        json.len() * 2 + html.map_or(0, Bytes::len)
    }
}

/// A [`FrontEnd`] that can also render HTML for its resource.
pub trait HtmlFrontEnd: FrontEnd {
    /// Produces HTML from the data and its JSON encoding.
    fn render_html(&self, data: &Self::Data, json: &Bytes) -> Bytes;
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error("stub failure")]
    struct StubError(#[from] serde_json::Error);

    struct Plain;

    #[async_trait]
    impl FrontEnd for Plain {
        type Data = Vec<String>;
        type Error = StubError;

        async fn counter(&self, _key: &Key) -> Result<u64, StubError> {
            Ok(1)
        }

        async fn fresh(&self, _key: &Key) -> Result<Vec<String>, StubError> {
            Ok(vec!["foo".to_string()])
        }
    }

    #[test]
    fn default_encoder_writes_json() {
        let json = Plain.encode_json(&vec!["foo".to_string()]).expect("encodes");
        assert_eq!(&json[..], br#"["foo"]"#);
    }

    #[test]
    fn default_size_counts_json_twice_plus_html() {
        let data = vec![];
        let json = Bytes::from_static(b"12345");
        let html = Bytes::from_static(b"abc");

        assert_eq!(Plain.size(&data, &json, None), 10);
        assert_eq!(Plain.size(&data, &json, Some(&html)), 13);
    }
}
