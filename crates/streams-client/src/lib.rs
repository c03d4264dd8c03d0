//! Stream subscription layer for the viewer core
//!
//! Provides the transport abstraction over the remote stream service:
//! - resumable, offset-addressed subscriptions delivering ordered JSON batches
//! - cooperative cancellation via a shared flag
//! - automatic reconnection with backoff on transport errors

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use streams_core::Result;

pub mod http;

pub use http::HttpStreamTransport;

/// Position to start reading a stream from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOffset {
    /// Replay the log from the beginning (wire sentinel `-1`).
    Start,
    /// Resume after a previously delivered batch offset.
    Position(String),
}

impl StreamOffset {
    pub fn as_wire(&self) -> &str {
        match self {
            StreamOffset::Start => "-1",
            StreamOffset::Position(token) => token,
        }
    }
}

/// A request to open one subscription.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub offset: StreamOffset,
}

impl StreamRequest {
    pub fn from_start(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            offset: StreamOffset::Start,
        }
    }
}

/// One delivered batch: ordered records plus the offset token to resume
/// after them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawBatch {
    pub items: Vec<serde_json::Value>,
    pub offset: String,
}

impl RawBatch {
    /// Decode the batch items into a typed vector. Undecodable items are
    /// skipped, preserving the order of the rest.
    pub fn decode<T: DeserializeOwned>(&self) -> Vec<T> {
        self.items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("Skipping undecodable stream item: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// Shared cancellation state: a flag the delivery path checks before
/// yielding, plus a notifier so the transport's reader wakes up and releases
/// its connection immediately instead of at the next event.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised. Used in `select!` by reader tasks.
    pub async fn cancelled(&self) {
        loop {
            // Register for the wakeup before checking the flag, so a cancel
            // landing in between is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancels a subscription from outside the task that consumes it.
///
/// Cancellation is one-way: the transport's reader stops forwarding and
/// releases its connection, and `next_batch` yields nothing further.
/// Batches applied before cancellation are never rolled back.
#[derive(Debug, Clone)]
pub struct SubscriptionCanceller {
    flag: Arc<CancelFlag>,
}

impl SubscriptionCanceller {
    pub fn cancel(&self) {
        self.flag.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

/// An open subscription handle. Batches arrive strictly in transport order;
/// after cancellation `next_batch` returns `None` without draining whatever
/// the transport had still buffered.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<RawBatch>,
    flag: Arc<CancelFlag>,
}

impl Subscription {
    /// Wrap a batch channel. Transports feed the sender from their reader
    /// task; tests feed it by hand.
    pub fn from_channel(rx: mpsc::Receiver<RawBatch>) -> Self {
        Self::with_cancel_flag(rx, Arc::new(CancelFlag::default()))
    }

    /// Wrap a batch channel sharing the transport's cancellation flag, so
    /// cancelling the handle also stops the transport's reader.
    pub fn with_cancel_flag(rx: mpsc::Receiver<RawBatch>, flag: Arc<CancelFlag>) -> Self {
        Self { rx, flag }
    }

    pub fn canceller(&self) -> SubscriptionCanceller {
        SubscriptionCanceller {
            flag: self.flag.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }

    /// Receive the next batch, or `None` once the subscription is cancelled
    /// or the transport has gone away for good.
    pub async fn next_batch(&mut self) -> Option<RawBatch> {
        if self.is_cancelled() {
            return None;
        }
        let batch = tokio::select! {
            batch = self.rx.recv() => batch?,
            _ = self.flag.cancelled() => return None,
        };
        if self.is_cancelled() {
            return None;
        }
        Some(batch)
    }

    pub fn cancel(&mut self) {
        self.flag.cancel();
        self.rx.close();
    }
}

/// Transport trait for opening stream subscriptions
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a subscription at the requested offset. Construction failures
    /// surface here; once open, transport errors are retried internally and
    /// never tear down the returned handle.
    async fn open(&self, request: StreamRequest) -> Result<Subscription>;
}
