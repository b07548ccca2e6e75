//! Watch stream handed out by [`KvStore::watch`](crate::KvStore::watch)

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::model::WatchResponse;

/// Ordered stream of watch responses.
///
/// Dropping the stream or calling [`WatchStream::cancel`] ends the watch on
/// the store side.
pub struct WatchStream {
    watch_id: i64,
    inner: UnboundedReceiverStream<WatchResponse>,
}

impl WatchStream {
    pub fn new(watch_id: i64, rx: mpsc::UnboundedReceiver<WatchResponse>) -> Self {
        Self {
            watch_id,
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    pub fn watch_id(&self) -> i64 {
        self.watch_id
    }

    /// Next batch of events, `None` once the watch has ended
    pub async fn message(&mut self) -> Option<WatchResponse> {
        self.inner.next().await
    }

    /// Stop receiving new events. Responses already queued are still yielded.
    pub fn cancel(&mut self) {
        self.inner.close();
    }
}

impl Stream for WatchStream {
    type Item = WatchResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("watch_id", &self.watch_id)
            .finish()
    }
}
