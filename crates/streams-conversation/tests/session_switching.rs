use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use streams_client::{RawBatch, StreamRequest, StreamTransport, Subscription, SubscriptionCanceller};
use streams_config::ServerSettings;
use streams_conversation::{ConversationSync, SyncState};
use streams_core::{Result, StreamsError};

/// One opened stream as seen by the fake transport: the sender feeding the
/// subscription and a canceller to observe/drive its lifecycle.
struct OpenedStream {
    url: String,
    tx: mpsc::Sender<RawBatch>,
    canceller: SubscriptionCanceller,
}

#[derive(Default)]
struct FakeTransport {
    opened: Mutex<Vec<OpenedStream>>,
    fail_opens: bool,
}

impl FakeTransport {
    fn failing() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            fail_opens: true,
        }
    }

    fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn sender(&self, index: usize) -> mpsc::Sender<RawBatch> {
        self.opened.lock().unwrap()[index].tx.clone()
    }

    fn canceller(&self, index: usize) -> SubscriptionCanceller {
        self.opened.lock().unwrap()[index].canceller.clone()
    }

    fn url(&self, index: usize) -> String {
        self.opened.lock().unwrap()[index].url.clone()
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn open(&self, request: StreamRequest) -> Result<Subscription> {
        if self.fail_opens {
            return Err(StreamsError::ConnectError("refused".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let subscription = Subscription::from_channel(rx);
        self.opened.lock().unwrap().push(OpenedStream {
            url: request.url,
            tx,
            canceller: subscription.canceller(),
        });
        Ok(subscription)
    }
}

fn server() -> ServerSettings {
    ServerSettings {
        base_url: "http://localhost:4100".to_string(),
        history_path: "_history".to_string(),
    }
}

fn batch(offset: &str, texts: &[&str]) -> RawBatch {
    let items = texts
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "user",
                "message": { "role": "user", "content": t }
            })
        })
        .collect();
    RawBatch {
        items,
        offset: offset.to_string(),
    }
}

/// Await until the sync has applied `count` messages, bounded by a timeout.
async fn wait_for_messages(sync: &ConversationSync, count: usize) {
    let mut revision = sync.revision();
    for _ in 0..100 {
        if sync.messages().len() >= count {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_millis(50), revision.changed()).await;
    }
    panic!(
        "log never reached {} messages (got {})",
        count,
        sync.messages().len()
    );
}

#[tokio::test]
async fn batches_append_in_order_with_synthesized_ids() {
    let transport = Arc::new(FakeTransport::default());
    let mut sync = ConversationSync::new(transport.clone(), server());

    sync.select_session("session-a").await;
    assert_eq!(sync.state(), SyncState::Streaming);
    assert_eq!(sync.active_session().as_deref(), Some("session-a"));
    assert_eq!(transport.url(0), "http://localhost:4100/session-a");

    transport.sender(0).send(batch("0", &["one", "two"])).await.unwrap();
    transport.sender(0).send(batch("2", &["three"])).await.unwrap();
    wait_for_messages(&sync, 3).await;

    let messages = sync.messages();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["0-0", "0-1", "2-0"]);
}

#[tokio::test]
async fn reselecting_a_session_resets_instead_of_resuming() {
    let transport = Arc::new(FakeTransport::default());
    let mut sync = ConversationSync::new(transport.clone(), server());

    sync.select_session("session-a").await;
    transport.sender(0).send(batch("0", &["before switch"])).await.unwrap();
    wait_for_messages(&sync, 1).await;

    sync.select_session("session-b").await;
    assert_eq!(sync.active_session().as_deref(), Some("session-b"));
    assert!(sync.messages().is_empty());

    // Back to A: the log must be empty immediately after reselection, even
    // though A's prior subscription had delivered data.
    sync.select_session("session-a").await;
    assert!(sync.messages().is_empty());
    assert_eq!(transport.opened_count(), 3);

    transport.sender(2).send(batch("0", &["fresh replay"])).await.unwrap();
    wait_for_messages(&sync, 1).await;
    assert_eq!(sync.messages()[0].id, "0-0");
}

#[tokio::test]
async fn same_session_reselect_restarts_the_stream() {
    let transport = Arc::new(FakeTransport::default());
    let mut sync = ConversationSync::new(transport.clone(), server());

    sync.select_session("session-a").await;
    transport.sender(0).send(batch("0", &["old"])).await.unwrap();
    wait_for_messages(&sync, 1).await;

    sync.select_session("session-a").await;
    assert!(sync.messages().is_empty());
    assert_eq!(transport.opened_count(), 2);
    assert!(transport.canceller(0).is_cancelled());
    assert!(!transport.canceller(1).is_cancelled());
}

#[tokio::test]
async fn stale_delivery_after_switch_is_discarded() {
    let transport = Arc::new(FakeTransport::default());
    let mut sync = ConversationSync::new(transport.clone(), server());

    sync.select_session("session-a").await;
    let stale_tx = transport.sender(0);

    sync.select_session("session-b").await;
    assert!(transport.canceller(0).is_cancelled());

    // A delayed delivery from A's cancelled subscription must never reach
    // B's log.
    let _ = stale_tx.send(batch("9", &["stale"])).await;
    transport.sender(1).send(batch("0", &["b message"])).await.unwrap();
    wait_for_messages(&sync, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let messages = sync.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "0-0");
    assert_eq!(sync.active_session().as_deref(), Some("session-b"));
}

#[tokio::test]
async fn open_failure_leaves_log_empty_and_does_not_escalate() {
    let transport = Arc::new(FakeTransport::failing());
    let mut sync = ConversationSync::new(transport.clone(), server());

    sync.select_session("session-a").await;
    assert_eq!(sync.state(), SyncState::Connecting);
    assert_eq!(sync.active_session().as_deref(), Some("session-a"));
    assert!(sync.messages().is_empty());
}

#[tokio::test]
async fn deselect_returns_to_idle() {
    let transport = Arc::new(FakeTransport::default());
    let mut sync = ConversationSync::new(transport.clone(), server());
    assert_eq!(sync.state(), SyncState::Idle);

    sync.select_session("session-a").await;
    sync.deselect();
    assert_eq!(sync.state(), SyncState::Idle);
    assert!(sync.active_session().is_none());
    assert!(transport.canceller(0).is_cancelled());
}
