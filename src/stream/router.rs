use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::DeliveryError;
use crate::event::RawEvent;
use crate::platform::ChatSink;
use crate::registry::{Destination, FollowRegistry};

/// Classifies, formats and delivers inbound events.
///
/// All registry mutation driven by deliveries happens here, on the parent
/// side; the worker never touches the registry.
pub struct EventRouter {
    registry: Arc<Mutex<FollowRegistry>>,
    sink: Arc<dyn ChatSink>,
}

impl EventRouter {
    pub fn new(registry: Arc<Mutex<FollowRegistry>>, sink: Arc<dyn ChatSink>) -> Self {
        Self { registry, sink }
    }

    /// Entry point for raw frames off the worker queue.
    pub async fn handle_frame(&self, frame: &str) {
        match RawEvent::decode(frame) {
            Ok(Some(event)) => self.handle_live(event).await,
            Ok(None) => {}
            Err(e) => debug!("Ignoring undecodable frame: {}", e),
        }
    }

    /// Live-stream path: skip predicate first, then dispatch.
    pub async fn handle_live(&self, event: RawEvent) {
        if self.skip(&event, true).await {
            return;
        }
        self.dispatch(&event).await;
    }

    /// Replies are always skipped. The live stream additionally carries
    /// noise from accounts we do not follow (replies directed at followed
    /// feeds, for one), so stream traffic is also checked against the
    /// registry.
    pub async fn skip(&self, event: &RawEvent, from_stream: bool) -> bool {
        if event.is_reply() {
            return true;
        }
        if from_stream && !self.registry.lock().await.is_followed(&event.author.id) {
            return true;
        }
        false
    }

    /// Delivers one event to every destination of its feed. Failures are
    /// isolated per destination: a blocked chat never prevents delivery to
    /// the others. Counter and watermark updates happen only after a
    /// successful delivery.
    pub async fn dispatch(&self, event: &RawEvent) {
        let feed_id = event.author.id.clone();
        let destinations: Vec<Destination> = {
            let mut registry = self.registry.lock().await;
            let Some(feed) = registry.get(&feed_id) else {
                warn!("Dropping event {} for unfollowed feed {}", event.id, feed_id);
                return;
            };
            let destinations = feed.destinations.clone();
            // Handles change while ids stay stable; refresh opportunistically.
            if registry.update_handle(&feed_id, &event.author.handle) {
                if let Err(e) = registry.save() {
                    error!("Failed to save registry after handle refresh: {}", e);
                }
            }
            destinations
        };

        let payload = event.present();

        for dest in destinations {
            match self
                .sink
                .send_post(dest.chat_id, dest.message.as_deref(), &payload)
                .await
            {
                Ok(()) => {
                    let mut registry = self.registry.lock().await;
                    registry.record_delivery(&feed_id, dest.chat_id);
                    registry.advance_watermark(&feed_id, event.id);
                    if let Err(e) = registry.save() {
                        error!("Failed to save registry after delivery: {}", e);
                    }
                }
                Err(DeliveryError::Forbidden) => {
                    let note = format!(
                        "Missing permission to display {} in chat {}.",
                        payload.url, dest.chat_id
                    );
                    if let Err(e) = self.sink.notify_user(dest.follower, &note).await {
                        debug!("Fallback notification failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("Delivery of {} to chat {} failed: {}", payload.url, dest.chat_id, e);
                }
            }
        }
    }

    /// Operational notice to every destination of one feed.
    pub async fn notify_feed_destinations(&self, feed_id: &str, text: &str) {
        let chats: Vec<i64> = {
            let registry = self.registry.lock().await;
            match registry.get(feed_id) {
                Some(feed) => feed.destinations.iter().map(|d| d.chat_id).collect(),
                None => return,
            }
        };
        for chat_id in chats {
            if let Err(e) = self.sink.send_notice(chat_id, text).await {
                warn!("Notice to chat {} failed: {}", chat_id, e);
            }
        }
    }
}
