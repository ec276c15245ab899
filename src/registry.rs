use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RelayError;

/// One followed upstream feed and everywhere it gets mirrored to.
///
/// A feed with no destinations must not exist: removing the last destination
/// removes the whole entry, and the caller is told so it can stop or restart
/// the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowedFeed {
    pub feed_id: String,
    /// Last-known handle. Refreshed opportunistically; the id is what's stable.
    pub handle: String,
    /// Highest event id already delivered for this feed, the replay watermark.
    #[serde(default)]
    pub latest_delivered_id: u64,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub chat_id: i64,
    /// Operator who created this follow; fallback contact when the chat
    /// itself refuses deliveries.
    pub follower: u64,
    #[serde(default)]
    pub received_count: u64,
    /// Fixed text prepended to every delivery here.
    #[serde(default)]
    pub message: Option<String>,
}

impl FollowedFeed {
    pub fn destination(&self, chat_id: i64) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.chat_id == chat_id)
    }
}

/// What `remove_destination` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    FeedRetained,
    FeedRemoved,
}

/// In-memory follow registry, persisted as one JSON document keyed by feed
/// id. Mutations happen in memory; callers save at explicit points.
pub struct FollowRegistry {
    path: PathBuf,
    follows: BTreeMap<String, FollowedFeed>,
}

impl FollowRegistry {
    /// Loads the registry from disk. A missing file is an empty registry; a
    /// file that exists but does not parse is fatal, never silently defaulted.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let follows = match std::fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| RelayError::Configuration {
                    path: path.display().to_string(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            follows,
        })
    }

    /// Atomic save: write a sibling temp file, then rename over the original,
    /// so a crash mid-write never corrupts the live file.
    pub fn save(&self) -> Result<(), RelayError> {
        let content = serde_json::to_string_pretty(&self.follows)
            .map_err(|source| RelayError::Configuration {
                path: self.path.display().to_string(),
                source,
            })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Saved registry to {}", self.path.display());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.follows.is_empty()
    }

    pub fn get(&self, feed_id: &str) -> Option<&FollowedFeed> {
        self.follows.get(feed_id)
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<&FollowedFeed> {
        self.follows
            .values()
            .find(|f| f.handle.eq_ignore_ascii_case(handle))
    }

    pub fn is_followed(&self, feed_id: &str) -> bool {
        self.follows.contains_key(feed_id)
    }

    pub fn feed_ids(&self) -> BTreeSet<String> {
        self.follows.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FollowedFeed> {
        self.follows.values()
    }

    /// Follows listed for one chat, for status reporting.
    pub fn follows_in_chat(&self, chat_id: i64) -> Vec<&FollowedFeed> {
        self.follows
            .values()
            .filter(|f| f.destination(chat_id).is_some())
            .collect()
    }

    /// Creates the feed entry if absent and appends the destination.
    pub fn add_destination(
        &mut self,
        feed_id: &str,
        handle: &str,
        destination: Destination,
    ) -> Result<(), RelayError> {
        let feed = self
            .follows
            .entry(feed_id.to_string())
            .or_insert_with(|| FollowedFeed {
                feed_id: feed_id.to_string(),
                handle: handle.to_string(),
                latest_delivered_id: 0,
                destinations: Vec::new(),
            });
        if feed.destination(destination.chat_id).is_some() {
            return Err(RelayError::AlreadyFollowing(handle.to_string()));
        }
        feed.destinations.push(destination);
        Ok(())
    }

    /// Removes one destination; drops the feed entirely when it was the last
    /// one. The outcome tells the caller whether the stream's follow set
    /// changed shape enough to need a supervisor restart-or-stop decision.
    pub fn remove_destination(
        &mut self,
        feed_id: &str,
        chat_id: i64,
    ) -> Result<RemovalOutcome, RelayError> {
        let feed = self
            .follows
            .get_mut(feed_id)
            .ok_or_else(|| RelayError::NotFollowing(feed_id.to_string()))?;
        let before = feed.destinations.len();
        feed.destinations.retain(|d| d.chat_id != chat_id);
        if feed.destinations.len() == before {
            return Err(RelayError::NotFollowing(feed.handle.clone()));
        }
        if feed.destinations.is_empty() {
            self.follows.remove(feed_id);
            Ok(RemovalOutcome::FeedRemoved)
        } else {
            Ok(RemovalOutcome::FeedRetained)
        }
    }

    /// Monotonic watermark advance: a no-op unless `event_id` is strictly
    /// greater than the stored value. Idempotent under replay.
    pub fn advance_watermark(&mut self, feed_id: &str, event_id: u64) -> bool {
        match self.follows.get_mut(feed_id) {
            Some(feed) if event_id > feed.latest_delivered_id => {
                feed.latest_delivered_id = event_id;
                true
            }
            _ => false,
        }
    }

    /// Bumps the delivery counter for one destination.
    pub fn record_delivery(&mut self, feed_id: &str, chat_id: i64) {
        if let Some(feed) = self.follows.get_mut(feed_id) {
            if let Some(dest) = feed.destinations.iter_mut().find(|d| d.chat_id == chat_id) {
                dest.received_count += 1;
            }
        }
    }

    /// Refreshes the stored handle; returns whether it changed.
    pub fn update_handle(&mut self, feed_id: &str, handle: &str) -> bool {
        match self.follows.get_mut(feed_id) {
            Some(feed) if !feed.handle.eq_ignore_ascii_case(handle) => {
                feed.handle = handle.to_lowercase();
                true
            }
            _ => false,
        }
    }

    pub fn set_message(&mut self, feed_id: &str, chat_id: i64, message: Option<String>) -> bool {
        if let Some(feed) = self.follows.get_mut(feed_id) {
            if let Some(dest) = feed.destinations.iter_mut().find(|d| d.chat_id == chat_id) {
                dest.message = message;
                return true;
            }
        }
        false
    }

    /// Purges one chat from every feed (the bot was removed from it) and
    /// drops feeds that end up with no destinations. Returns
    /// `(destinations_removed, feeds_removed)`.
    pub fn remove_chat(&mut self, chat_id: i64) -> (usize, usize) {
        let mut removed = 0;
        for feed in self.follows.values_mut() {
            let before = feed.destinations.len();
            feed.destinations.retain(|d| d.chat_id != chat_id);
            removed += before - feed.destinations.len();
        }
        let before = self.follows.len();
        self.follows.retain(|_, f| !f.destinations.is_empty());
        (removed, before - self.follows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(chat_id: i64) -> Destination {
        Destination {
            chat_id,
            follower: 7,
            received_count: 0,
            message: None,
        }
    }

    fn registry() -> FollowRegistry {
        FollowRegistry {
            path: PathBuf::from("unused.json"),
            follows: BTreeMap::new(),
        }
    }

    #[test]
    fn watermark_is_monotonic_in_any_order() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();

        for id in [5, 2, 9, 1, 9, 3] {
            reg.advance_watermark("f1", id);
        }
        assert_eq!(reg.get("f1").unwrap().latest_delivered_id, 9);

        assert!(!reg.advance_watermark("f1", 9), "equal id must be a no-op");
        assert!(!reg.advance_watermark("f1", 4));
        assert_eq!(reg.get("f1").unwrap().latest_delivered_id, 9);
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();
        let err = reg.add_destination("f1", "alice", dest(1)).unwrap_err();
        assert!(matches!(err, RelayError::AlreadyFollowing(_)));
        assert_eq!(reg.get("f1").unwrap().destinations.len(), 1);
    }

    #[test]
    fn removing_last_destination_drops_the_feed() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();
        reg.add_destination("f1", "alice", dest(2)).unwrap();

        assert_eq!(
            reg.remove_destination("f1", 1).unwrap(),
            RemovalOutcome::FeedRetained
        );
        assert_eq!(
            reg.remove_destination("f1", 2).unwrap(),
            RemovalOutcome::FeedRemoved
        );
        assert!(reg.get("f1").is_none());
        assert!(reg.feed_ids().is_empty());
    }

    #[test]
    fn removing_unknown_destination_fails() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();
        assert!(matches!(
            reg.remove_destination("f1", 99),
            Err(RelayError::NotFollowing(_))
        ));
        assert!(matches!(
            reg.remove_destination("f2", 1),
            Err(RelayError::NotFollowing(_))
        ));
    }

    #[test]
    fn remove_chat_purges_everywhere() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();
        reg.add_destination("f1", "alice", dest(2)).unwrap();
        reg.add_destination("f2", "bob", dest(1)).unwrap();

        let (dests, feeds) = reg.remove_chat(1);
        assert_eq!((dests, feeds), (2, 1));
        assert!(reg.get("f2").is_none());
        assert_eq!(reg.get("f1").unwrap().destinations.len(), 1);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follows.json");

        let mut reg = FollowRegistry::load(&path).unwrap();
        assert!(reg.is_empty());

        reg.add_destination("f1", "alice", dest(1)).unwrap();
        reg.advance_watermark("f1", 123);
        reg.record_delivery("f1", 1);
        reg.save().unwrap();

        let reloaded = FollowRegistry::load(&path).unwrap();
        let feed = reloaded.get("f1").unwrap();
        assert_eq!(feed.latest_delivered_id, 123);
        assert_eq!(feed.destinations[0].received_count, 1);
        assert_eq!(feed.handle, "alice");
    }

    #[test]
    fn malformed_registry_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follows.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            FollowRegistry::load(&path),
            Err(RelayError::Configuration { .. })
        ));
    }

    #[test]
    fn update_handle_is_case_insensitive() {
        let mut reg = registry();
        reg.add_destination("f1", "alice", dest(1)).unwrap();
        assert!(!reg.update_handle("f1", "Alice"));
        assert!(reg.update_handle("f1", "alice_renamed"));
        assert_eq!(reg.get("f1").unwrap().handle, "alice_renamed");
        assert!(reg.find_by_handle("ALICE_RENAMED").is_some());
    }
}
