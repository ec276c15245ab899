mod commands;
mod config;
mod error;
mod event;
mod platform;
mod registry;
mod stream;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::Bot;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::AppState;
use crate::config::Config;
use crate::platform::telegram::TelegramSink;
use crate::platform::ChatSink;
use crate::registry::FollowRegistry;
use crate::stream::fetcher::MissedEventFetcher;
use crate::stream::router::EventRouter;
use crate::stream::supervisor::StreamSupervisor;
use crate::upstream::http::HttpUpstream;
use crate::upstream::{FeedApi, StreamSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,feedrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // A malformed registry file is fatal here; a missing one is an empty
    // registry.
    let registry = FollowRegistry::load(&config.registry.path)
        .with_context(|| format!("Failed to load registry from {}", config.registry.path.display()))?;
    let registry = Arc::new(Mutex::new(registry));

    let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
    let api: Arc<dyn FeedApi> = upstream.clone();
    let source: Arc<dyn StreamSource> = upstream;

    let bot = Bot::new(&config.telegram.bot_token);
    let sink: Arc<dyn ChatSink> = Arc::new(TelegramSink::new(bot.clone()));

    let router = Arc::new(EventRouter::new(registry.clone(), sink.clone()));
    let supervisor = Arc::new(StreamSupervisor::new(
        source,
        registry.clone(),
        router.clone(),
    ));
    let fetcher = Arc::new(MissedEventFetcher::new(
        api.clone(),
        registry.clone(),
        router,
    ));

    // Catch up on events missed while offline, then go live.
    info!("Replaying missed events...");
    fetcher.replay_all().await;
    supervisor.start().await;

    let state = Arc::new(AppState {
        operators: config.telegram.operator_user_ids.clone(),
        registry,
        api,
        sink,
        supervisor: supervisor.clone(),
        fetcher,
    });

    info!("Bot is starting...");
    commands::run(bot, state).await?;

    supervisor.stop().await;
    Ok(())
}
