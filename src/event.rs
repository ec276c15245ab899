use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Text placeholder used when entity substitution leaves nothing behind.
/// The delivery side rejects entirely empty message bodies.
const EMPTY_BODY_PLACEHOLDER: &str = "\u{200B}";

#[derive(Debug, Clone, Deserialize)]
pub struct EventAuthor {
    /// Stable opaque id of the account. Handles can change, this cannot.
    pub id: String,
    pub handle: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UrlEntity {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub expanded_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaEntity {
    pub url: String,
    pub media_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub urls: Vec<UrlEntity>,
    #[serde(default)]
    pub media: Vec<MediaEntity>,
}

/// One decoded stream frame. Ephemeral, never persisted; `id` is strictly
/// increasing per feed over time and doubles as the replay watermark key.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub id: u64,
    pub text: String,
    pub author: EventAuthor,
    #[serde(default)]
    pub reply_to: Option<u64>,
    #[serde(default)]
    pub entities: Entities,
    /// Id of a quoted event, present even when the quoted event itself is
    /// unavailable (deleted or protected).
    #[serde(default)]
    pub quoted_id: Option<u64>,
    #[serde(default)]
    pub quoted: Option<Box<RawEvent>>,
    #[serde(default)]
    pub repost_of: Option<Box<RawEvent>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn permalink(&self) -> String {
        format!(
            "https://microblog.example/{}/status/{}",
            self.author.handle, self.id
        )
    }

    /// Decodes one stream frame. Keepalives and control frames (deletions,
    /// limit notices) carry no status payload and decode to `None`.
    pub fn decode(frame: &str) -> Result<Option<RawEvent>, serde_json::Error> {
        let frame = frame.trim();
        if frame.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(frame)?;
        if value.get("id").is_none() || value.get("text").is_none() {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    /// Builds the display payload: cleans the body text, resolves the nested
    /// quoted/reposted sub-event (one level deep, never further) and picks an
    /// attached image.
    pub fn present(&self) -> DisplayPayload {
        let sub = if let Some(repost) = &self.repost_of {
            SubPayload::Repost(present_nested(repost))
        } else if self.quoted_id.is_some() {
            match &self.quoted {
                Some(quoted) => SubPayload::Quote(present_nested(quoted)),
                None => SubPayload::QuoteUnavailable,
            }
        } else {
            SubPayload::None
        };

        let mut matches = vec![self.permalink()];
        match &sub {
            SubPayload::Quote(s) | SubPayload::Repost(s) => matches.push(s.url.clone()),
            _ => {}
        }
        let text = clean_text(self, &matches);

        // The image comes from the sub-event when there is one, matching how
        // the upstream UI renders quotes and reposts.
        let image_source = match (&self.repost_of, &self.quoted) {
            (Some(repost), _) => repost.as_ref(),
            (None, Some(quoted)) => quoted.as_ref(),
            (None, None) => self,
        };
        let image_url = image_source
            .entities
            .media
            .first()
            .map(|m| m.media_url.clone());

        DisplayPayload {
            author_name: self.author.name.clone(),
            author_handle: self.author.handle.clone(),
            avatar_url: self.author.avatar_url.clone(),
            url: self.permalink(),
            text,
            image_url,
            sub,
            timestamp: self.created_at,
        }
    }
}

/// What the delivery side actually posts. Structured so sinks can render it
/// however their platform formats rich messages.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPayload {
    pub author_name: String,
    pub author_handle: String,
    pub avatar_url: Option<String>,
    pub url: String,
    pub text: String,
    pub image_url: Option<String>,
    pub sub: SubPayload,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubPayload {
    None,
    Quote(NestedPayload),
    Repost(NestedPayload),
    /// The event quotes another that has since become unavailable.
    QuoteUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedPayload {
    pub author_handle: String,
    pub url: String,
    pub text: String,
}

fn present_nested(event: &RawEvent) -> NestedPayload {
    let url = event.permalink();
    NestedPayload {
        author_handle: event.author.handle.clone(),
        text: clean_text(event, &[url.clone()]),
        url,
    }
}

/// Strips media markers, expands url entities (dropping self-referential
/// links), decodes HTML entities and guarantees a non-empty result.
fn clean_text(event: &RawEvent, extra_matches: &[String]) -> String {
    let mut text = event.text.clone();

    for medium in &event.entities.media {
        text = text.replace(&medium.url, "");
    }

    for url in &event.entities.urls {
        let (short, expanded) = match (&url.url, &url.expanded_url) {
            (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => (s, e),
            // The upstream occasionally emits entities with empty or null
            // urls; nothing to substitute for those.
            _ => continue,
        };
        if extra_matches.iter().any(|m| m == expanded) {
            text = text.replace(short, "");
        } else {
            text = text.replace(short, expanded);
        }
    }

    let text = decode_html_entities(text.trim());
    let text = text.trim();
    if text.is_empty() {
        EMPTY_BODY_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    }
}

// The upstream HTML-escapes status text; only the named entities below occur.
fn decode_html_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
