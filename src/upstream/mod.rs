pub mod http;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::UpstreamError;
use crate::event::RawEvent;

/// Account record from the upstream user-lookup endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedUser {
    pub id: String,
    pub handle: String,
    pub name: String,
    #[serde(default)]
    pub protected: bool,
}

/// Point-in-time REST surface of the upstream microblog.
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// Resolves a handle to its account record. Handles change, ids do not,
    /// so this also serves to re-learn the current handle of a known id.
    async fn lookup_user(&self, handle: &str) -> Result<FeedUser, UpstreamError>;

    /// At most `count` events for a feed, restricted to ids strictly greater
    /// than `since_id` when given. Order is whatever the upstream returns;
    /// callers sort.
    async fn user_timeline(
        &self,
        feed_id: &str,
        since_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<RawEvent>, UpstreamError>;
}

/// Raw frames off the long-lived streaming connection, one JSON document or
/// keepalive per item.
pub type FrameStream = BoxStream<'static, Result<String, UpstreamError>>;

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Opens one streaming connection filtered to the given feed ids.
    async fn open(&self, follows: &[String]) -> Result<FrameStream, UpstreamError>;
}
