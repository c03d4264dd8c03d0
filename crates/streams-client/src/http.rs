//! SSE implementation of the stream transport
//!
//! The remote service exposes each log as an SSE endpoint. A subscription is
//! `GET {url}?offset={offset}`; every `message` event carries one JSON batch
//! (`{"items": [...], "offset": "..."}`) and sets the SSE event id to the
//! batch offset, so the client's automatic reconnection resumes from the
//! last delivered batch via `Last-Event-ID`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{retry, Event, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use streams_config::RetrySettings;
use streams_core::{Result, StreamsError};

use crate::{CancelFlag, RawBatch, StreamRequest, StreamTransport, Subscription};

/// SSE transport over the remote stream service
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    retry: RetrySettings,
}

impl HttpStreamTransport {
    pub fn new(client: reqwest::Client, retry: RetrySettings) -> Self {
        Self { client, retry }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: StreamRequest) -> Result<Subscription> {
        if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
            return Err(StreamsError::ConnectError(format!(
                "Stream URL must start with http:// or https://: {}",
                request.url
            )));
        }

        let request_builder = self
            .client
            .get(&request.url)
            .query(&[("offset", request.offset.as_wire())]);

        let mut event_source = EventSource::new(request_builder)
            .map_err(|e| StreamsError::ConnectError(format!("Failed to open event source: {e}")))?;

        // Transport errors never tear down the subscription; the retry
        // policy reconnects with exponential backoff until cancelled.
        event_source.set_retry_policy(Box::new(retry::ExponentialBackoff::new(
            Duration::from_millis(self.retry.initial_ms),
            2.0,
            Some(Duration::from_millis(self.retry.max_ms)),
            None,
        )));

        let (tx, rx) = mpsc::channel::<RawBatch>(64);
        let flag = Arc::new(CancelFlag::default());
        let reader_flag = flag.clone();
        let url = request.url.clone();

        tokio::spawn(async move {
            info!("Stream subscription opened: {}", url);

            loop {
                let event = tokio::select! {
                    event = event_source.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = reader_flag.cancelled() => break,
                };

                match event {
                    Ok(Event::Open) => {
                        debug!("Stream connected: {}", url);
                    }
                    Ok(Event::Message(msg)) => {
                        match serde_json::from_str::<RawBatch>(&msg.data) {
                            Ok(batch) => {
                                debug!(
                                    "Batch received from {}: {} items at offset {}",
                                    url,
                                    batch.items.len(),
                                    batch.offset
                                );
                                if tx.send(batch).await.is_err() {
                                    // Receiver dropped; nothing left to feed.
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("Skipping non-batch event from {}: {}", url, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Stream transport error on {} (will retry): {}", url, e);
                    }
                }
            }

            event_source.close();
            info!("Stream subscription closed: {}", url);
        });

        Ok(Subscription::with_cancel_flag(rx, flag))
    }
}
