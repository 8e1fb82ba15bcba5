use tokio::sync::mpsc;

use crate::constants::SSE_DONE_MARKER;
use crate::types::MessageSnapshot;

/// One outward event. Snapshots are delivered in emission order; `Done` is
/// the end-of-transmission marker and always the last event of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Snapshot(MessageSnapshot),
    Done,
}

impl DeliveryEvent {
    /// Wire form: `data: {content, reasoning, citations, finished}` blocks,
    /// then `data: [DONE]`.
    pub fn into_sse(
        self,
    ) -> std::result::Result<axum::response::sse::Event, serde_json::Error> {
        match self {
            DeliveryEvent::Snapshot(snapshot) => Ok(axum::response::sse::Event::default()
                .data(serde_json::to_string(&snapshot)?)),
            DeliveryEvent::Done => {
                Ok(axum::response::sse::Event::default().data(SSE_DONE_MARKER))
            }
        }
    }
}

/// Single-producer handle onto the outward channel for one request. Send
/// failures mean the consumer went away; callers treat that as a cancel
/// signal and release the upstream connection.
#[derive(Clone)]
pub struct Delivery {
    tx: mpsc::Sender<DeliveryEvent>,
}

impl Delivery {
    pub fn new(tx: mpsc::Sender<DeliveryEvent>) -> Self {
        Self { tx }
    }

    pub async fn send_snapshot(&self, snapshot: MessageSnapshot) -> bool {
        self.tx.send(DeliveryEvent::Snapshot(snapshot)).await.is_ok()
    }

    pub async fn finish(&self) -> bool {
        self.tx.send(DeliveryEvent::Done).await.is_ok()
    }
}
