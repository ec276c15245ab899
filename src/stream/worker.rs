use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::upstream::StreamSource;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(320);

/// Entry point of the worker task.
///
/// Owns the long-lived streaming connection for its whole life and forwards
/// every raw frame into the unbounded queue. Connection errors re-enter the
/// connect loop with escalating delay; the task only ends when the
/// supervisor aborts it or the queue's receiving side is gone.
pub async fn run(source: Arc<dyn StreamSource>, follows: Vec<String>, tx: UnboundedSender<String>) {
    if follows.is_empty() {
        return;
    }

    let mut delay = RECONNECT_DELAY;
    loop {
        match source.open(&follows).await {
            Ok(mut frames) => {
                info!("Stream connected, following {} feed(s)", follows.len());
                delay = RECONNECT_DELAY;
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(frame) => {
                            if tx.send(frame).is_err() {
                                // Supervisor released the queue.
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Stream read error: {}", e);
                            break;
                        }
                    }
                }
                warn!("Stream connection closed, reconnecting");
            }
            Err(e) => {
                warn!("Stream connect failed: {}", e);
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}
