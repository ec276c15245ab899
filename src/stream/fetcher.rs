use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::UpstreamError;
use crate::event::RawEvent;
use crate::registry::FollowRegistry;
use crate::stream::router::EventRouter;
use crate::upstream::FeedApi;

/// Cap for feeds that have never delivered anything. Without it, a first
/// follow would flood its destination with the whole reachable backlog.
pub const FIRST_FOLLOW_LIMIT: usize = 3;

/// Page size for watermark-bounded history requests.
const HISTORY_PAGE: usize = 200;

/// Replays events missed while the stream was down, per followed feed,
/// through the same router path live events take.
pub struct MissedEventFetcher {
    api: Arc<dyn FeedApi>,
    registry: Arc<Mutex<FollowRegistry>>,
    router: Arc<EventRouter>,
}

impl MissedEventFetcher {
    pub fn new(
        api: Arc<dyn FeedApi>,
        registry: Arc<Mutex<FollowRegistry>>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            api,
            registry,
            router,
        }
    }

    /// One pass over every followed feed. A failure for one feed is logged
    /// and skipped; it never aborts the pass for the others.
    pub async fn replay_all(&self) {
        let feeds: Vec<String> = self.registry.lock().await.feed_ids().into_iter().collect();
        for feed_id in feeds {
            self.replay_feed(&feed_id).await;
        }
    }

    /// Replays missed events for a single feed.
    pub async fn replay_feed(&self, feed_id: &str) {
        let (handle, watermark) = {
            let registry = self.registry.lock().await;
            match registry.get(feed_id) {
                Some(feed) => (feed.handle.clone(), feed.latest_delivered_id),
                None => return,
            }
        };

        match self.fetch_missed(feed_id, watermark).await {
            Ok(events) => {
                if !events.is_empty() {
                    info!("Replaying {} missed event(s) for @{}", events.len(), handle);
                }
                for event in events {
                    self.router.handle_live(event).await;
                }
            }
            Err(UpstreamError::NotAuthorized) => {
                self.router
                    .notify_feed_destinations(
                        feed_id,
                        &format!(
                            "Could not check for missed posts from @{}. \
                             The feed is protected, consider unfollowing it.",
                            handle
                        ),
                    )
                    .await;
            }
            Err(e) => {
                warn!("Skipping missed-event fetch for @{}: {}", handle, e);
            }
        }
    }

    /// Bounded fetch of events newer than the watermark, replies filtered
    /// out, sorted ascending by id. Ascending order is what keeps the
    /// watermark moving only forward and destinations seeing chronological
    /// history.
    pub async fn fetch_missed(
        &self,
        feed_id: &str,
        watermark: u64,
    ) -> Result<Vec<RawEvent>, UpstreamError> {
        let mut events = if watermark == 0 {
            self.api
                .user_timeline(feed_id, None, FIRST_FOLLOW_LIMIT)
                .await?
        } else {
            self.api
                .user_timeline(feed_id, Some(watermark), HISTORY_PAGE)
                .await?
        };
        events.retain(|e| !e.is_reply() && e.id > watermark);
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    /// Ad-hoc fetch for a feed that is not followed anywhere: the `limit`
    /// most recent non-reply events, ascending.
    pub async fn fetch_recent(
        &self,
        feed_id: &str,
        limit: usize,
    ) -> Result<Vec<RawEvent>, UpstreamError> {
        let mut events = self.api.user_timeline(feed_id, None, limit).await?;
        events.retain(|e| !e.is_reply());
        events.sort_by_key(|e| e.id);
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::registry::Destination;
    use crate::stream::router::tests::{event_for, registry_with, RecordingSink};
    use crate::upstream::FeedUser;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeApi {
        timeline: StdMutex<Vec<RawEvent>>,
        calls: AtomicUsize,
        last_request: StdMutex<Option<(String, Option<u64>, usize)>>,
        authorized: bool,
    }

    impl FakeApi {
        fn with_timeline(events: Vec<RawEvent>) -> Self {
            Self {
                timeline: StdMutex::new(events),
                calls: AtomicUsize::new(0),
                last_request: StdMutex::new(None),
                authorized: true,
            }
        }
    }

    #[async_trait]
    impl FeedApi for FakeApi {
        async fn lookup_user(&self, handle: &str) -> Result<FeedUser, UpstreamError> {
            Ok(FeedUser {
                id: format!("id-{handle}"),
                handle: handle.to_string(),
                name: handle.to_string(),
                protected: false,
            })
        }

        async fn user_timeline(
            &self,
            feed_id: &str,
            since_id: Option<u64>,
            count: usize,
        ) -> Result<Vec<RawEvent>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() =
                Some((feed_id.to_string(), since_id, count));
            if !self.authorized {
                return Err(UpstreamError::NotAuthorized);
            }
            Ok(self.timeline.lock().unwrap().clone())
        }
    }

    fn dest(chat_id: i64) -> Destination {
        Destination {
            chat_id,
            follower: 7,
            received_count: 0,
            message: None,
        }
    }

    fn fetcher_for(
        api: Arc<FakeApi>,
        registry: Arc<tokio::sync::Mutex<crate::registry::FollowRegistry>>,
        sink: Arc<RecordingSink>,
    ) -> MissedEventFetcher {
        let router = Arc::new(EventRouter::new(registry.clone(), sink));
        MissedEventFetcher::new(api, registry, router)
    }

    #[tokio::test]
    async fn missed_events_replay_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        let api = Arc::new(FakeApi::with_timeline(vec![
            event_for("feed-f", 5, "five"),
            event_for("feed-f", 2, "two"),
            event_for("feed-f", 9, "nine"),
            event_for("feed-f", 1, "one"),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api, registry.clone(), sink.clone());

        fetcher.replay_feed("feed-f").await;

        let posts = sink.posts.lock().unwrap();
        let texts: Vec<&str> = posts.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "five", "nine"]);
        assert_eq!(registry.lock().await.get("feed-f").unwrap().latest_delivered_id, 9);
    }

    #[tokio::test]
    async fn zero_watermark_requests_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        let api = Arc::new(FakeApi::with_timeline(vec![]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api.clone(), registry, sink);

        fetcher.replay_feed("feed-f").await;

        let req = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(req, ("feed-f".to_string(), None, FIRST_FOLLOW_LIMIT));
    }

    #[tokio::test]
    async fn nonzero_watermark_bounds_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        registry.lock().await.advance_watermark("feed-f", 50);
        let api = Arc::new(FakeApi::with_timeline(vec![
            // The upstream since_id filter is not trusted blindly; stale
            // items below the watermark are dropped here too.
            event_for("feed-f", 50, "stale"),
            event_for("feed-f", 51, "new"),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api.clone(), registry, sink.clone());

        fetcher.replay_feed("feed-f").await;

        let req = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(req.1, Some(50));
        let posts = sink.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1, "new");
    }

    #[tokio::test]
    async fn replies_are_filtered_from_replay() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        let mut reply = event_for("feed-f", 3, "reply");
        reply.reply_to = Some(2);
        let api = Arc::new(FakeApi::with_timeline(vec![
            reply,
            event_for("feed-f", 4, "keeper"),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api, registry, sink.clone());

        fetcher.replay_feed("feed-f").await;

        let posts = sink.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1, "keeper");
    }

    #[tokio::test]
    async fn removed_feed_is_never_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        registry.lock().await.remove_destination("feed-f", 1).unwrap();
        let api = Arc::new(FakeApi::with_timeline(vec![event_for("feed-f", 1, "x")]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api.clone(), registry, sink);

        fetcher.replay_all().await;

        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn protected_feed_notifies_destinations_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[("feed-f", &[dest(1)])]);
        let api = Arc::new(FakeApi {
            timeline: StdMutex::new(vec![]),
            calls: AtomicUsize::new(0),
            last_request: StdMutex::new(None),
            authorized: false,
        });
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api, registry, sink.clone());

        fetcher.replay_all().await;

        let notices = sink.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, 1);
        assert!(notices[0].1.contains("protected"));
    }

    #[tokio::test]
    async fn fetch_recent_returns_latest_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(&dir, &[]);
        let api = Arc::new(FakeApi::with_timeline(vec![
            event_for("feed-x", 8, "eight"),
            event_for("feed-x", 3, "three"),
            event_for("feed-x", 6, "six"),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let fetcher = fetcher_for(api, registry, sink);

        let events = fetcher.fetch_recent("feed-x", 2).await.unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![6, 8]);
    }
}
