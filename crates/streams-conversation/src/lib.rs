//! Conversation sync for the active session
//!
//! One [`ConversationSync`] owns the message log of whichever session is
//! currently selected. Selecting a session always restarts its stream from
//! the beginning and clears prior content, even when the id matches the
//! previous selection. At most one subscription is live at a time; a
//! generation counter captured at subscription-open time is re-checked under
//! the log lock before every append, so a slow, superseded subscription can
//! never corrupt the log of a session selected after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use streams_client::{StreamRequest, StreamTransport, Subscription, SubscriptionCanceller};
use streams_config::ServerSettings;
use streams_core::{ConversationMessage, ConversationRecord};

pub mod stats;

pub use stats::{short_model, usage_totals_by_model, SessionStats};

/// Lifecycle of the active-session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No session selected.
    Idle,
    /// A session is selected and its subscription is being established.
    Connecting,
    /// The subscription is live and batches are being appended.
    Streaming,
    /// A prior subscription is being cancelled and released.
    Cancelling,
}

/// The ordered message log of the active session. Replaced wholesale on
/// session switch, never merged.
#[derive(Debug, Default)]
pub struct MessageLog {
    session_id: Option<String>,
    messages: Vec<ConversationMessage>,
}

impl MessageLog {
    fn reset(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
        self.messages.clear();
    }
}

struct ActiveSubscription {
    session_id: String,
    canceller: SubscriptionCanceller,
    applier: JoinHandle<()>,
}

pub struct ConversationSync {
    transport: Arc<dyn StreamTransport>,
    server: ServerSettings,
    /// Bumped on every selection; appends from older generations are stale.
    generation: Arc<AtomicU64>,
    log: Arc<RwLock<MessageLog>>,
    state: SyncState,
    active: Option<ActiveSubscription>,
    revision_tx: watch::Sender<u64>,
}

impl ConversationSync {
    pub fn new(transport: Arc<dyn StreamTransport>, server: ServerSettings) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            transport,
            server,
            generation: Arc::new(AtomicU64::new(0)),
            log: Arc::new(RwLock::new(MessageLog::default())),
            state: SyncState::Idle,
            active: None,
            revision_tx,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// The session the slot is currently bound to, if any.
    pub fn active_session(&self) -> Option<String> {
        self.log.read().unwrap().session_id.clone()
    }

    /// Snapshot of the current log, in append order.
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.log.read().unwrap().messages.clone()
    }

    /// Watch that ticks on every log change, so consumers can await updates
    /// instead of polling.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Select a session and restart its stream from the beginning.
    ///
    /// Any prior subscription is cancelled first (including one still
    /// connecting), the log is cleared for the new id, and a fresh
    /// subscription is opened with a full replay. Selecting the already
    /// active id is a deliberate reset, not a resume.
    ///
    /// An open failure is logged and leaves the log empty; it does not
    /// escalate. The next selection simply tries again.
    pub async fn select_session(&mut self, session_id: &str) {
        self.cancel_active();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.log
            .write()
            .unwrap()
            .reset(Some(session_id.to_string()));
        self.revision_tx.send_modify(|r| *r += 1);

        self.state = SyncState::Connecting;
        info!("Connecting conversation stream for session {}", session_id);

        let request = StreamRequest::from_start(self.server.conversation_url(session_id));
        match self.transport.open(request).await {
            Ok(subscription) => {
                let canceller = subscription.canceller();
                let applier = tokio::spawn(apply_batches(
                    subscription,
                    generation,
                    self.generation.clone(),
                    self.log.clone(),
                    self.revision_tx.clone(),
                ));
                self.active = Some(ActiveSubscription {
                    session_id: session_id.to_string(),
                    canceller,
                    applier,
                });
                self.state = SyncState::Streaming;
            }
            Err(e) => {
                error!(
                    "Failed to open conversation stream for {}: {}",
                    session_id, e
                );
            }
        }
    }

    /// Drop the active session: cancel its subscription and clear the log.
    pub fn deselect(&mut self) {
        self.cancel_active();
        self.log.write().unwrap().reset(None);
        self.revision_tx.send_modify(|r| *r += 1);
        self.state = SyncState::Idle;
    }

    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            self.state = SyncState::Cancelling;
            debug!(
                "Cancelling conversation stream for session {}",
                active.session_id
            );
            active.canceller.cancel();
            // The applier exits on its own once next_batch yields None; it
            // holds no resources beyond the cancelled subscription.
            drop(active.applier);
        }
    }
}

impl Drop for ConversationSync {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

/// Append delivered batches to the log until the subscription ends.
///
/// The generation check and the append happen under one write lock, so a
/// concurrent re-selection either bumps the generation before the check
/// (batch discarded) or resets the log after the append (appended messages
/// discarded wholesale). Either way the new session's log stays clean.
async fn apply_batches(
    mut subscription: Subscription,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    log: Arc<RwLock<MessageLog>>,
    revision_tx: watch::Sender<u64>,
) {
    while let Some(batch) = subscription.next_batch().await {
        let records: Vec<ConversationRecord> = batch.decode();
        {
            let mut log = log.write().unwrap();
            if current_generation.load(Ordering::SeqCst) != generation {
                debug!(
                    "Discarding stale batch at offset {} (superseded subscription)",
                    batch.offset
                );
                return;
            }
            for (index, record) in records.into_iter().enumerate() {
                log.messages
                    .push(ConversationMessage::from_record(record, &batch.offset, index));
            }
        }
        revision_tx.send_modify(|r| *r += 1);
    }
    debug!("Conversation applier finished (generation {})", generation);
}
