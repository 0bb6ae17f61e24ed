//! Transfer events
//!
//! Typed publish/subscribe for download progress. Subscribers that fall
//! behind lose the oldest events rather than blocking transfers.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub dataset_id: String,
    pub network_id: String,
    pub have_chunks: u64,
    pub total_chunks: u64,
    pub bytes_fetched: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEvent {
    pub dataset_id: String,
    pub network_id: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub dataset_id: String,
    pub network_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TransferEvent {
    Progress(ProgressEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

impl TransferEvent {
    /// Label used on the control surface
    pub fn name(&self) -> &'static str {
        match self {
            TransferEvent::Progress(_) => "download:progress",
            TransferEvent::Complete(_) => "download:complete",
            TransferEvent::Error(_) => "download:error",
        }
    }

    pub fn dataset_id(&self) -> &str {
        match self {
            TransferEvent::Progress(e) => &e.dataset_id,
            TransferEvent::Complete(e) => &e.dataset_id,
            TransferEvent::Error(e) => &e.dataset_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of subscribers that received the event
    pub fn publish(&self, event: TransferEvent) -> usize {
        trace!("{} for {}", event.name(), event.dataset_id());
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
