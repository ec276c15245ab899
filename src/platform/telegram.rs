use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{LinkPreviewOptions, ParseMode};
use teloxide::utils::html;
use teloxide::{ApiError, RequestError};

use crate::error::DeliveryError;
use crate::event::{DisplayPayload, SubPayload};
use crate::platform::ChatSink;

/// Telegram delivery backend over a teloxide `Bot`.
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Renders a payload as one HTML message. Telegram has no rich embeds, so
/// the link preview of the permalink stands in for the image attachment.
fn render(prefix: Option<&str>, payload: &DisplayPayload) -> String {
    let mut out = String::new();
    if let Some(prefix) = prefix {
        out.push_str(prefix);
        out.push('\n');
    }
    out.push_str(&format!(
        "<b>{}</b> — <a href=\"{}\">@{}</a>\n",
        html::escape(&payload.author_name),
        payload.url,
        html::escape(&payload.author_handle),
    ));
    out.push_str(&html::escape(&payload.text));
    match &payload.sub {
        SubPayload::Quote(nested) => {
            out.push_str(&format!(
                "\n\n↪ <a href=\"{}\">@{}</a>:\n<blockquote>{}</blockquote>",
                nested.url,
                html::escape(&nested.author_handle),
                html::escape(&nested.text),
            ));
        }
        SubPayload::Repost(nested) => {
            out.push_str(&format!(
                "\n\n🔁 <a href=\"{}\">@{}</a>:\n<blockquote>{}</blockquote>",
                nested.url,
                html::escape(&nested.author_handle),
                html::escape(&nested.text),
            ));
        }
        SubPayload::QuoteUnavailable => {
            out.push_str("\n\n<i>The quoted post is unavailable.</i>");
        }
        SubPayload::None => {}
    }
    if let Some(image) = &payload.image_url {
        out.push_str(&format!("\n<a href=\"{}\">&#8203;</a>", image));
    }
    out
}

fn map_error(err: RequestError) -> DeliveryError {
    match err {
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::NotEnoughRightsToPostMessages
            | ApiError::CantInitiateConversation,
        ) => DeliveryError::Forbidden,
        other => DeliveryError::Other(other.to_string()),
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send_post(
        &self,
        chat_id: i64,
        prefix: Option<&str>,
        payload: &DisplayPayload,
    ) -> Result<(), DeliveryError> {
        let text = render(prefix, payload);
        // Keep previews on only when there's an image to show.
        let preview = LinkPreviewOptions {
            is_disabled: payload.image_url.is_none(),
            url: payload.image_url.clone(),
            prefer_small_media: false,
            prefer_large_media: payload.image_url.is_some(),
            show_above_text: false,
        };
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .link_preview_options(preview)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn send_notice(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn notify_user(&self, user_id: u64, text: &str) -> Result<(), DeliveryError> {
        // A user's direct-message chat id equals their user id.
        self.bot
            .send_message(ChatId(user_id as i64), text)
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
