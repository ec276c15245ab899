pub mod telegram;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::event::DisplayPayload;

/// Outbound delivery surface. One implementation per chat platform; the
/// router only ever talks to this trait so delivery failures stay
/// distinguishable (permissions vs everything else) without the router
/// knowing platform error types.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Posts a formatted event to a chat, with the destination's optional
    /// prefix message.
    async fn send_post(
        &self,
        chat_id: i64,
        prefix: Option<&str>,
        payload: &DisplayPayload,
    ) -> Result<(), DeliveryError>;

    /// Plain operational notice to a chat.
    async fn send_notice(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;

    /// Direct message to a user, used as the fallback when a chat refuses
    /// deliveries.
    async fn notify_user(&self, user_id: u64, text: &str) -> Result<(), DeliveryError>;
}
