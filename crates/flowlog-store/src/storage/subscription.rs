//! Subscription - the cancelable live stream port
//!
//! Every backend delivers live events through the same [`EventSubscription`]
//! handle; only the delivery mechanism differs. The in-memory backend feeds
//! the channel synchronously during `append`, while the SQL backends run the
//! shared poll loop in [`spawn_poll_loop`] on a background task.

use crate::error::Result;
use crate::event::EventRecord;
use crate::storage::EventLogStorage;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A cancelable, ordered stream of events for one run.
///
/// Yields every event with `sequence_id` past the subscription cursor, in
/// order, with no gaps and no duplicates, until canceled or dropped. A
/// `StorageUnavailable` item is terminal: the worker has stopped and the
/// caller should resubscribe if it wants to continue.
pub struct EventSubscription {
    receiver: mpsc::UnboundedReceiver<Result<EventRecord>>,
    cancel: CancellationToken,
}

impl EventSubscription {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<Result<EventRecord>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { receiver, cancel }
    }

    /// Receive the next event, or `None` once the stream has ended.
    ///
    /// After [`cancel`](Self::cancel) this returns `None` even if events were
    /// queued before cancellation.
    pub async fn next(&mut self) -> Option<Result<EventRecord>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            () = self.cancel.cancelled() => None,
            item = self.receiver.recv() => item,
        }
    }

    /// Stop the subscription.
    ///
    /// The delivery worker stops at its next iteration; no further events are
    /// yielded after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the subscription has been canceled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for EventSubscription {
    type Item = Result<EventRecord>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

/// Shared poll-loop worker backing `subscribe` for the SQL backends.
///
/// Repeatedly issues `events_after` with the last-delivered cursor, delivers
/// any new rows in order, then sleeps for `interval`. The cursor advances
/// only past rows already handed to the channel, so a row is never skipped
/// and never re-delivered. A storage error is forwarded as the terminal item.
pub(crate) fn spawn_poll_loop<S>(
    storage: S,
    run_id: String,
    from_cursor: i64,
    interval: Duration,
) -> EventSubscription
where
    S: EventLogStorage + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let worker = cancel.clone();

    tokio::spawn(async move {
        let mut cursor = from_cursor;
        loop {
            if worker.is_cancelled() || tx.is_closed() {
                break;
            }
            match storage.events_after(&run_id, cursor).await {
                Ok(events) => {
                    for event in events {
                        cursor = event.sequence_id;
                        if tx.send(Ok(event)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "event poll failed, ending subscription");
                    let _ = tx.send(Err(err));
                    return;
                }
            }
            tokio::select! {
                () = worker.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        debug!(run_id = %run_id, cursor, "subscription poll loop stopped");
    });

    EventSubscription::new(rx, cancel)
}
