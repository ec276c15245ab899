use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ChatMemberUpdated;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{RelayError, UpstreamError};
use crate::platform::ChatSink;
use crate::registry::{Destination, FollowRegistry, RemovalOutcome};
use crate::stream::fetcher::MissedEventFetcher;
use crate::stream::supervisor::StreamSupervisor;
use crate::upstream::{FeedApi, FeedUser};

const HELP: &str = "I mirror microblog feeds into Telegram chats.\n\n\
     Commands:\n\
     /follow <handle> [message] - Mirror a feed into this chat\n\
     /unfollow <handle> - Stop mirroring a feed here\n\
     /setmessage <handle> [message] - Change the text prepended to each post\n\
     /fetch <handle> [limit] - Show the latest posts from a feed\n\
     /list - Feeds mirrored into this chat\n\
     /status - Stream status and delivery counts";

/// Shared application state
pub struct AppState {
    pub operators: Vec<u64>,
    pub registry: Arc<Mutex<FollowRegistry>>,
    pub api: Arc<dyn FeedApi>,
    pub sink: Arc<dyn ChatSink>,
    pub supervisor: Arc<StreamSupervisor>,
    pub fetcher: Arc<MissedEventFetcher>,
}

/// Start the Telegram bot
pub async fn run(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Starting Telegram bot...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_my_chat_member().endpoint(handle_my_chat_member));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("bot"))
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = match msg.text() {
        Some(t) => t.trim().to_string(),
        None => return Ok(()),
    };
    let mut parts = text.splitn(2, char::is_whitespace);
    // Commands arrive as "/cmd" or "/cmd@botname".
    let command = parts
        .next()
        .unwrap_or("")
        .split('@')
        .next()
        .unwrap_or("");
    let args = parts.next().unwrap_or("").trim();
    let chat_id = msg.chat.id.0;

    let outcome = match command {
        "/start" | "/help" => {
            bot.send_message(msg.chat.id, HELP).await?;
            return Ok(());
        }
        "/status" => Ok(status_text(&state).await),
        "/list" => Ok(list_text(&state, chat_id).await),
        "/fetch" => fetch(&state, chat_id, args).await,
        "/follow" | "/unfollow" | "/setmessage" => {
            let user_id = match msg.from.as_ref() {
                Some(user) => user.id.0,
                None => return Ok(()),
            };
            if !state.operators.contains(&user_id) {
                bot.send_message(msg.chat.id, "This command is restricted to bot operators.")
                    .await?;
                return Ok(());
            }
            match command {
                "/follow" => follow(&state, chat_id, user_id, args).await,
                "/unfollow" => unfollow(&state, chat_id, args).await,
                _ => set_message(&state, chat_id, args).await,
            }
        }
        _ => return Ok(()),
    };

    let reply = match outcome {
        Ok(reply) => reply,
        Err(e) => user_reply(&e),
    };
    if !reply.is_empty() {
        bot.send_message(msg.chat.id, reply).await?;
    }
    Ok(())
}

/// Operator input errors surface verbatim; anything unexpected from the
/// upstream gets logged and replaced with a generic one-liner.
fn user_reply(err: &RelayError) -> String {
    match err {
        RelayError::Upstream(
            UpstreamError::Http(_) | UpstreamError::Api { .. } | UpstreamError::Decode(_),
        ) => {
            error!("Upstream error: {}", err);
            "Unknown error from the upstream API, this has been logged.".to_string()
        }
        other => other.to_string(),
    }
}

fn sanitize_handle(handle: &str) -> String {
    handle.trim_start_matches('@').to_lowercase()
}

/// Resolves a handle to its account, preferring the registry over an API
/// round trip. When the API reveals a handle change for an id we already
/// follow, the stored handle is refreshed on the spot.
async fn resolve_feed(state: &AppState, sane_handle: &str) -> Result<FeedUser, RelayError> {
    if let Some(feed) = state.registry.lock().await.find_by_handle(sane_handle) {
        return Ok(FeedUser {
            id: feed.feed_id.clone(),
            handle: feed.handle.clone(),
            name: feed.handle.clone(),
            protected: false,
        });
    }

    let user = state.api.lookup_user(sane_handle).await?;
    let mut registry = state.registry.lock().await;
    if registry.is_followed(&user.id) && registry.update_handle(&user.id, &user.handle) {
        registry.save()?;
    }
    Ok(user)
}

async fn follow(
    state: &Arc<AppState>,
    chat_id: i64,
    user_id: u64,
    args: &str,
) -> Result<String, RelayError> {
    let mut parts = args.splitn(2, char::is_whitespace);
    let handle = parts.next().unwrap_or("");
    let message = parts.next().map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
    if handle.is_empty() {
        return Ok("Usage: /follow <handle> [message]".to_string());
    }

    let sane = sanitize_handle(handle);
    let user = resolve_feed(state, &sane).await?;
    // The streaming API cannot follow protected accounts.
    if user.protected {
        return Err(RelayError::ProtectedFeed(user.handle));
    }

    {
        let mut registry = state.registry.lock().await;
        registry.add_destination(
            &user.id,
            &user.handle.to_lowercase(),
            Destination {
                chat_id,
                follower: user_id,
                received_count: 0,
                message,
            },
        )?;
        registry.save()?;
    }
    state.supervisor.start().await;

    // Backfill recent history for the new destination off the hot path.
    let fetcher = state.fetcher.clone();
    let feed_id = user.id.clone();
    tokio::spawn(async move {
        fetcher.replay_feed(&feed_id).await;
    });

    Ok(format!("Now following @{} in this chat.", user.handle))
}

async fn unfollow(state: &Arc<AppState>, chat_id: i64, args: &str) -> Result<String, RelayError> {
    let handle = args.split_whitespace().next().unwrap_or("");
    if handle.is_empty() {
        return Ok("Usage: /unfollow <handle>".to_string());
    }
    let sane = sanitize_handle(handle);

    let feed_id = {
        let registry = state.registry.lock().await;
        registry.find_by_handle(&sane).map(|f| f.feed_id.clone())
    };
    let feed_id = match feed_id {
        Some(id) => id,
        None => state.api.lookup_user(&sane).await?.id,
    };

    let outcome = {
        let mut registry = state.registry.lock().await;
        let outcome = registry
            .remove_destination(&feed_id, chat_id)
            .map_err(|_| RelayError::NotFollowing(sane.clone()))?;
        registry.save()?;
        outcome
    };

    // Losing the last destination of a feed changes the stream's follow set.
    if outcome == RemovalOutcome::FeedRemoved {
        if state.registry.lock().await.is_empty() {
            state.supervisor.stop().await;
        } else {
            state.supervisor.start().await;
        }
    }

    Ok(format!("Unfollowed @{} in this chat.", sane))
}

async fn set_message(state: &Arc<AppState>, chat_id: i64, args: &str) -> Result<String, RelayError> {
    let mut parts = args.splitn(2, char::is_whitespace);
    let handle = parts.next().unwrap_or("");
    let message = parts.next().map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
    if handle.is_empty() {
        return Ok("Usage: /setmessage <handle> [message]".to_string());
    }
    let sane = sanitize_handle(handle);

    let mut registry = state.registry.lock().await;
    let feed_id = registry
        .find_by_handle(&sane)
        .map(|f| f.feed_id.clone())
        .ok_or_else(|| RelayError::NotFollowing(sane.clone()))?;
    if !registry.set_message(&feed_id, chat_id, message) {
        return Err(RelayError::NotFollowing(sane));
    }
    registry.save()?;
    Ok("Message updated.".to_string())
}

async fn fetch(state: &Arc<AppState>, chat_id: i64, args: &str) -> Result<String, RelayError> {
    let mut parts = args.split_whitespace();
    let handle = parts.next().unwrap_or("");
    if handle.is_empty() {
        return Ok("Usage: /fetch <handle> [limit]".to_string());
    }
    let limit = match parts.next() {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => return Ok("Usage: /fetch <handle> [limit]".to_string()),
        },
        None => 1,
    };
    let sane = sanitize_handle(handle);

    let followed = {
        let registry = state.registry.lock().await;
        registry.find_by_handle(&sane).map(|f| f.feed_id.clone())
    };
    if let Some(feed_id) = followed {
        // Followed somewhere: replay missed events through the normal path.
        state.fetcher.replay_feed(&feed_id).await;
        return Ok(String::new());
    }

    // Not followed: one-off display in the invoking chat only.
    let user = state.api.lookup_user(&sane).await?;
    let events = state.fetcher.fetch_recent(&user.id, limit).await?;
    if events.is_empty() {
        return Ok("Nothing to display.".to_string());
    }
    for event in events {
        if let Err(e) = state.sink.send_post(chat_id, None, &event.present()).await {
            warn!("Ad-hoc display in chat {} failed: {}", chat_id, e);
        }
    }
    Ok(String::new())
}

async fn status_text(state: &AppState) -> String {
    let online = state.supervisor.is_online().await;
    let registry = state.registry.lock().await;

    let mut out = format!("Stream: {}\n", if online { "online" } else { "offline" });
    if registry.is_empty() {
        out.push_str("No feeds followed.");
    } else {
        for feed in registry.iter() {
            let delivered: u64 = feed.destinations.iter().map(|d| d.received_count).sum();
            out.push_str(&format!(
                "@{} — {} chat(s), {} post(s) delivered\n",
                feed.handle,
                feed.destinations.len(),
                delivered
            ));
        }
    }
    out.trim_end().to_string()
}

async fn list_text(state: &AppState, chat_id: i64) -> String {
    let registry = state.registry.lock().await;
    let follows = registry.follows_in_chat(chat_id);
    if follows.is_empty() {
        return "Not following any feed in this chat.".to_string();
    }
    let handles: Vec<String> = follows.iter().map(|f| format!("@{}", f.handle)).collect();
    format!("Followed here: {}", handles.join(", "))
}

/// The bot was removed from (or shut out of) a chat: purge that chat from
/// the registry and adjust the stream, mirroring an explicit unfollow.
async fn handle_my_chat_member(
    upd: ChatMemberUpdated,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let kind = &upd.new_chat_member.kind;
    if !(kind.is_left() || kind.is_banned()) {
        return Ok(());
    }
    let chat_id = upd.chat.id.0;

    let (destinations, feeds) = {
        let mut registry = state.registry.lock().await;
        let removed = registry.remove_chat(chat_id);
        if removed.0 > 0 {
            if let Err(e) = registry.save() {
                error!("Failed to save registry after chat removal: {}", e);
            }
        }
        removed
    };
    if destinations == 0 {
        return Ok(());
    }

    info!(
        "Removal from chat {} dropped {} destination(s) and unfollowed {} feed(s)",
        chat_id, destinations, feeds
    );
    if state.registry.lock().await.is_empty() {
        state.supervisor.stop().await;
    } else {
        state.supervisor.start().await;
    }
    Ok(())
}
