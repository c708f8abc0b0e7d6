//! Websocket client for the row-change feed. One connection is shared by
//! every subscription; frames are JSON-encoded `FeedFrame`s.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    error::{ApiError, ApiException},
    protocol::{ChangeEvent, ChangeFilter, FeedFrame, SubscriptionId},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{ChangeFeed, FeedSubscription};

const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RealtimeFeed {
    url: Url,
    next_subscription_id: AtomicU64,
    shared: Arc<Mutex<FeedState>>,
    connect_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct FeedState {
    /// Bumped on every new websocket; tasks of older connections compare
    /// against it before touching shared state.
    connection: u64,
    outbound: Option<mpsc::UnboundedSender<FeedFrame>>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<ChangeEvent>>,
    pending_acks: HashMap<SubscriptionId, oneshot::Sender<Result<(), ApiError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FeedState {
    fn disconnect(&mut self) {
        self.outbound = None;
        // Dropping the senders ends every subscriber's event stream.
        self.subscribers.clear();
        self.pending_acks.clear();
    }

    fn disconnect_if_current(&mut self, connection: u64) {
        if self.connection == connection {
            self.disconnect();
        } else {
            debug!(connection, current = self.connection, "realtime: stale connection closed");
        }
    }

    fn shutdown(&mut self) {
        self.disconnect();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Tears down whatever is left of the previous connection and returns
    /// the number of the next one.
    fn begin_connection(&mut self) -> u64 {
        self.shutdown();
        self.connection += 1;
        self.connection
    }
}

fn lock(state: &Mutex<FeedState>) -> std::sync::MutexGuard<'_, FeedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RealtimeFeed {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            next_subscription_id: AtomicU64::new(1),
            shared: Arc::new(Mutex::new(FeedState::default())),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared)
            .outbound
            .as_ref()
            .is_some_and(|outbound| !outbound.is_closed())
    }

    async fn ensure_connected(
        &self,
    ) -> Result<(u64, mpsc::UnboundedSender<FeedFrame>), ApiException> {
        let _connecting = self.connect_lock.lock().await;
        {
            let state = lock(&self.shared);
            if let Some(outbound) = state.outbound.as_ref().filter(|tx| !tx.is_closed()) {
                return Ok((state.connection, outbound.clone()));
            }
        }

        let (stream, _) = connect_async(self.url.as_str()).await.map_err(|err| {
            ApiException::unavailable(format!("failed to connect change feed {}: {err}", self.url))
        })?;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<FeedFrame>();
        let connection = {
            let mut state = lock(&self.shared);
            let connection = state.begin_connection();
            state.outbound = Some(outbound_tx.clone());
            connection
        };
        info!(url = %self.url, connection, "realtime: connected to change feed");
        let (mut writer, mut reader) = stream.split();

        let shared = Arc::clone(&self.shared);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("realtime: failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!("realtime: websocket send failed: {err}");
                    lock(&shared).disconnect_if_current(connection);
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let shared = Arc::clone(&self.shared);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<FeedFrame>(&text) {
                        Ok(frame) => route_frame(&shared, connection, frame),
                        Err(err) => warn!("realtime: invalid feed frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            warn!(connection, "realtime: change feed disconnected");
            lock(&shared).disconnect_if_current(connection);
        });

        lock(&self.shared)
            .tasks
            .extend([writer_task, reader_task]);
        Ok((connection, outbound_tx))
    }

    fn forget(&self, subscription_id: SubscriptionId) {
        let mut state = lock(&self.shared);
        state.subscribers.remove(&subscription_id);
        state.pending_acks.remove(&subscription_id);
    }
}

fn route_frame(shared: &Mutex<FeedState>, connection: u64, frame: FeedFrame) {
    let mut state = lock(shared);
    if state.connection != connection {
        return;
    }
    match frame {
        FeedFrame::Subscribed { subscription_id } => {
            if let Some(ack) = state.pending_acks.remove(&subscription_id) {
                let _ = ack.send(Ok(()));
            }
        }
        FeedFrame::Change {
            subscription_id,
            event,
        } => {
            let delivered = state
                .subscribers
                .get(&subscription_id)
                .is_some_and(|tx| tx.send(event).is_ok());
            if !delivered {
                state.subscribers.remove(&subscription_id);
                debug!(subscription_id = subscription_id.0, "realtime: dropped change for closed subscription");
            }
        }
        FeedFrame::Error {
            subscription_id: Some(subscription_id),
            error,
        } => {
            warn!(subscription_id = subscription_id.0, "realtime: subscription error: {}", error.message);
            if let Some(ack) = state.pending_acks.remove(&subscription_id) {
                let _ = ack.send(Err(error));
            } else {
                state.subscribers.remove(&subscription_id);
            }
        }
        FeedFrame::Error {
            subscription_id: None,
            error,
        } => warn!("realtime: feed error: {}", error.message),
        FeedFrame::Subscribe { .. } | FeedFrame::Unsubscribe { .. } => {
            debug!("realtime: ignoring client-bound frame from server");
        }
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        lock(&self.shared).shutdown();
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription, ApiException> {
        let (connection, outbound) = self.ensure_connected().await?;
        let subscription_id =
            SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut state = lock(&self.shared);
            if state.connection != connection || state.outbound.is_none() {
                return Err(ApiException::unavailable("change feed reconnected during subscribe"));
            }
            state.subscribers.insert(subscription_id, events_tx);
            state.pending_acks.insert(subscription_id, ack_tx);
        }
        if outbound
            .send(FeedFrame::Subscribe {
                subscription_id,
                filter,
            })
            .is_err()
        {
            self.forget(subscription_id);
            return Err(ApiException::unavailable("change feed connection closed"));
        }

        match timeout(SUBSCRIBE_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(subscription_id = subscription_id.0, "realtime: subscription acknowledged");
                Ok(FeedSubscription {
                    id: subscription_id,
                    events: events_rx,
                })
            }
            Ok(Ok(Err(error))) => {
                self.forget(subscription_id);
                Err(error.into())
            }
            Ok(Err(_)) => {
                self.forget(subscription_id);
                Err(ApiException::unavailable(
                    "change feed closed before the subscription was acknowledged",
                ))
            }
            Err(_) => {
                self.unsubscribe(subscription_id);
                Err(ApiException::unavailable(
                    "timed out waiting for subscription acknowledgement",
                ))
            }
        }
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) {
        let mut state = lock(&self.shared);
        let known = state.subscribers.remove(&subscription_id).is_some()
            | state.pending_acks.remove(&subscription_id).is_some();
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(FeedFrame::Unsubscribe { subscription_id });
        }
        if known {
            debug!(subscription_id = subscription_id.0, "realtime: unsubscribed");
        }
    }
}

#[cfg(test)]
#[path = "../tests/realtime_tests.rs"]
mod tests;
