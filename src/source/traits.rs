use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::EngineError;

/// An open response body: total size when the origin declared one, and the
/// payload as a chunk stream so the pipeline can report progress and honor
/// cancellation at chunk boundaries.
pub struct ImageBody {
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, EngineError>>,
}

impl ImageBody {
    /// Body made of in-memory chunks. Used by test sources.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            content_length: Some(total),
            stream: Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))),
        }
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Open a GET request for `url` with the supplied headers. Errors are
    /// already classified as transient or permanent.
    async fn fetch(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<ImageBody, EngineError>;
}
