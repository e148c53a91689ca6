use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// Change notification emitted after every store mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    Added {
        id: u64,
        /// Id of the record evicted to make room, if any
        evicted: Option<u64>,
        resident: usize,
    },
    Cleared,
}

/// Live feed of store changes for dashboards.
///
/// Notifications a slow subscriber misses are skipped, not replayed;
/// consumers re-query the store to catch up.
pub struct ChangeStream {
    event_stream: Pin<Box<dyn Stream<Item = StoreEvent> + Send + 'static>>,
}

impl ChangeStream {
    pub fn new(receiver: broadcast::Receiver<StoreEvent>) -> Self {
        let event_stream = BroadcastStream::new(receiver).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    warn!(lagged = count, "Change subscriber lagged, notifications dropped");
                    None
                }
            }
        });

        Self {
            event_stream: Box::pin(event_stream),
        }
    }
}

impl Stream for ChangeStream {
    type Item = StoreEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.event_stream.as_mut().poll_next(cx)
    }
}
