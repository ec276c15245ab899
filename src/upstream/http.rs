use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::event::RawEvent;
use crate::upstream::{FeedApi, FeedUser, FrameStream, StreamSource};

/// reqwest-backed client for both the REST and the streaming endpoints.
pub struct HttpUpstream {
    client: reqwest::Client,
    api_base: String,
    stream_base: String,
    bearer_token: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            stream_base: config.stream_base.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
        })
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(UpstreamError::NotAuthorized),
            code => Err(UpstreamError::Api { status: code, message }),
        }
    }
}

#[async_trait]
impl FeedApi for HttpUpstream {
    async fn lookup_user(&self, handle: &str) -> Result<FeedUser, UpstreamError> {
        let resp = self
            .client
            .get(format!("{}/users/show", self.api_base))
            .bearer_auth(&self.bearer_token)
            .query(&[("handle", handle)])
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(UpstreamError::UserNotFound(handle.to_string()));
        }
        let resp = self.check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn user_timeline(
        &self,
        feed_id: &str,
        since_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<RawEvent>, UpstreamError> {
        let mut query = vec![
            ("feed_id".to_string(), feed_id.to_string()),
            ("count".to_string(), count.to_string()),
        ];
        if let Some(since_id) = since_id {
            query.push(("since_id".to_string(), since_id.to_string()));
        }
        let resp = self
            .client
            .get(format!("{}/statuses/user_timeline", self.api_base))
            .bearer_auth(&self.bearer_token)
            .query(&query)
            .send()
            .await?;
        let resp = self.check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl StreamSource for HttpUpstream {
    async fn open(&self, follows: &[String]) -> Result<FrameStream, UpstreamError> {
        let resp = self
            .client
            .get(format!("{}/statuses/filter", self.stream_base))
            .bearer_auth(&self.bearer_token)
            .query(&[("follow", follows.join(","))])
            .send()
            .await?;
        let resp = self.check(resp).await?;
        debug!("Streaming connection established for {} feed(s)", follows.len());

        Ok(frame_lines(resp.bytes_stream()))
    }
}

/// Line-frames a chunked byte stream. Chunk boundaries fall anywhere,
/// including inside a multibyte character, so bytes are buffered raw and
/// only complete lines are decoded.
fn frame_lines<S, B, E>(chunks: S) -> FrameStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Into<UpstreamError>,
{
    futures::stream::unfold(
        (Box::pin(chunks), Vec::<u8>::new(), VecDeque::<String>::new()),
        |(mut chunks, mut buf, mut pending)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Some((Ok(line), (chunks, buf, pending)));
                }
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(chunk.as_ref());
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let mut line: Vec<u8> = buf.drain(..=pos).collect();
                            line.pop();
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            pending.push_back(String::from_utf8_lossy(&line).into_owned());
                        }
                    }
                    Some(Err(e)) => return Some((Err(e.into()), (chunks, buf, pending))),
                    None => return None,
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&[u8]]) -> impl futures::Stream<Item = Result<Vec<u8>, UpstreamError>> {
        let parts: Vec<Result<Vec<u8>, UpstreamError>> =
            parts.iter().map(|p| Ok(p.to_vec())).collect();
        futures::stream::iter(parts)
    }

    #[tokio::test]
    async fn multibyte_chars_survive_chunk_boundaries() {
        // "é" is 0xC3 0xA9; the network is free to split it across chunks.
        let mut frames = frame_lines(chunked(&[
            b"{\"id\":1,\"text\":\"caf\xC3",
            b"\xA9\"}\n",
        ]));
        let line = frames.next().await.unwrap().unwrap();
        assert_eq!(line, "{\"id\":1,\"text\":\"café\"}");
    }

    #[tokio::test]
    async fn lines_split_on_newlines_across_chunks() {
        let mut frames = frame_lines(chunked(&[b"one\ntw", b"o\r\nthree\n\n"]));
        assert_eq!(frames.next().await.unwrap().unwrap(), "one");
        assert_eq!(frames.next().await.unwrap().unwrap(), "two");
        assert_eq!(frames.next().await.unwrap().unwrap(), "three");
        assert_eq!(frames.next().await.unwrap().unwrap(), "");
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn trailing_partial_line_is_dropped_at_stream_end() {
        let mut frames = frame_lines(chunked(&[b"complete\nincomplete"]));
        assert_eq!(frames.next().await.unwrap().unwrap(), "complete");
        assert!(frames.next().await.is_none());
    }
}
