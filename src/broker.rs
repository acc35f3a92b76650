use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

use crate::error::LinkError;
use crate::retry::{exponential_delay, jitter_delay};
use crate::types::{Delivery, DeliveryId, Headers, MessageProperties, Subscription};

/// Deliveries for one subscription. Infinite while the link is open; it
/// suspends across reconnects and ends only when the link is closed.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// The three broker-visible ways to end a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalAction {
    Ack,
    Requeue,
    Reject,
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalAction::Ack => "ack",
            TerminalAction::Requeue => "requeue",
            TerminalAction::Reject => "reject",
        })
    }
}

/// Connection to the message broker.
///
/// Settling calls are idempotent-safe: settling an identity a second time,
/// or one received on a channel that has since been replaced, is a no-op.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn subscribe(&self, subscription: &Subscription) -> Result<DeliveryStream, LinkError>;

    async fn ack(&self, id: DeliveryId) -> Result<(), LinkError>;

    async fn requeue(&self, id: DeliveryId) -> Result<(), LinkError>;

    async fn reject(&self, id: DeliveryId) -> Result<(), LinkError>;

    /// Republish a delivery's body, headers and properties to `queue`.
    async fn publish(&self, queue: &str, delivery: &Delivery) -> Result<(), LinkError>;

    fn is_healthy(&self) -> bool;

    /// Close channels and connection. Open delivery streams end.
    async fn close(&self) -> Result<(), LinkError>;
}

/// Issue `action` for `id` on `link`.
pub async fn settle(link: &dyn BrokerLink, id: DeliveryId, action: TerminalAction) -> Result<(), LinkError> {
    match action {
        TerminalAction::Ack => link.ack(id).await,
        TerminalAction::Requeue => link.requeue(id).await,
        TerminalAction::Reject => link.reject(id).await,
    }
}

/// Backoff between reconnect attempts after a connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), with up to one
    /// `base` of jitter, never above `cap`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = exponential_delay(attempt, self.base, self.cap);
        exp.saturating_add(jitter_delay(Duration::ZERO, self.base))
            .min(self.cap)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Settlement {
    First,
    Repeated,
    Stale,
}

/// Delivery tags handed out on the current channel epoch and not yet
/// settled. Bounded by the prefetch of the channel's consumers.
#[derive(Debug, Default)]
pub(crate) struct OutstandingTags {
    epoch: u64,
    tags: HashSet<u64>,
}

impl OutstandingTags {
    /// Start a new epoch; tags from the previous one are forgotten.
    pub(crate) fn reset(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.tags.clear();
    }

    pub(crate) fn track(&mut self, id: DeliveryId) {
        if id.epoch == self.epoch {
            self.tags.insert(id.tag);
        }
    }

    pub(crate) fn settle(&mut self, id: DeliveryId) -> Settlement {
        if id.epoch != self.epoch {
            Settlement::Stale
        } else if self.tags.remove(&id.tag) {
            Settlement::First
        } else {
            Settlement::Repeated
        }
    }
}

/// Message held by [`InMemoryBroker`].
#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    headers: Headers,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    epoch: u64,
    next_tag: u64,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<DeliveryId, (String, StoredMessage)>,
    outstanding: OutstandingTags,
    actions: Vec<(DeliveryId, TerminalAction)>,
    published: Vec<(String, Delivery)>,
    publish_failures: u32,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        self.queues.entry(queue.to_string()).or_default().ready.push_back(message);
        self.pump(queue);
    }

    fn pump(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else { return };
        let Some(consumer) = state.consumer.clone() else { return };

        while let Some(message) = state.ready.pop_front() {
            self.next_tag += 1;
            let id = DeliveryId::new(self.epoch, self.next_tag);
            let delivery = Delivery {
                id,
                queue: queue.to_string(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                headers: message.headers.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };
            if consumer.send(delivery).is_err() {
                state.consumer = None;
                state.ready.push_front(message);
                return;
            }
            self.outstanding.track(id);
            self.unacked.insert(id, (queue.to_string(), message));
        }
    }
}

/// In-process broker with AMQP-like settlement semantics.
///
/// Used as a test double and for embedding the bridge without a real broker.
/// Every terminal action is recorded and can be inspected with
/// [`InMemoryBroker::actions`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    settled_notify: Notify,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to `queue`, as an upstream publisher would.
    pub async fn publish_message(&self, queue: &str, routing_key: &str, body: impl Into<Vec<u8>>) {
        self.publish_with(queue, routing_key, body, Headers::new(), MessageProperties::default())
            .await;
    }

    pub async fn publish_with(
        &self,
        queue: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        headers: Headers,
        properties: MessageProperties,
    ) {
        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            body: body.into(),
            headers,
            properties,
            redelivered: false,
        };
        self.state.lock().await.enqueue(queue, message);
    }

    /// Terminal actions in the order they were received, first settlement per
    /// identity only.
    pub async fn actions(&self) -> Vec<(DeliveryId, TerminalAction)> {
        self.state.lock().await.actions.clone()
    }

    /// Messages published through [`BrokerLink::publish`].
    pub async fn published(&self) -> Vec<(String, Delivery)> {
        self.state.lock().await.published.clone()
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Make the next `count` calls to [`BrokerLink::publish`] fail.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.state.lock().await.publish_failures = count;
    }

    /// Simulate a connection break: the channel epoch advances and every
    /// unsettled delivery is redelivered with the redelivered flag set.
    pub async fn reconnect(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        let epoch = state.epoch;
        state.outstanding.reset(epoch);

        let mut unacked: Vec<_> = state.unacked.drain().collect();
        unacked.sort_by_key(|(id, _)| *id);
        for (_, (queue, mut message)) in unacked {
            message.redelivered = true;
            state
                .queues
                .entry(queue)
                .or_default()
                .ready
                .push_back(message);
        }
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for queue in queues {
            state.pump(&queue);
        }
    }

    /// Wait until at least `count` terminal actions have been recorded.
    pub async fn wait_for_actions(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<(DeliveryId, TerminalAction)> {
        let wait = async {
            loop {
                let notified = self.settled_notify.notified();
                {
                    let state = self.state.lock().await;
                    if state.actions.len() >= count {
                        return state.actions.clone();
                    }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(actions) => actions,
            Err(_) => self.actions().await,
        }
    }

    async fn settle_in_memory(&self, id: DeliveryId, action: TerminalAction) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let mut state = self.state.lock().await;
        match state.outstanding.settle(id) {
            Settlement::First => {}
            Settlement::Repeated | Settlement::Stale => {
                debug!(delivery = %id, %action, "ignoring settlement of settled or stale delivery");
                return Ok(());
            }
        }

        state.actions.push((id, action));
        if let Some((queue, mut message)) = state.unacked.remove(&id) {
            if action == TerminalAction::Requeue {
                message.redelivered = true;
                state.enqueue(&queue, message);
            }
        }
        drop(state);
        self.settled_notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BrokerLink for InMemoryBroker {
    async fn subscribe(&self, subscription: &Subscription) -> Result<DeliveryStream, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().await;
            state
                .queues
                .entry(subscription.queue.clone())
                .or_default()
                .consumer = Some(tx);
            state.pump(&subscription.queue);
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle_in_memory(id, TerminalAction::Ack).await
    }

    async fn requeue(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle_in_memory(id, TerminalAction::Requeue).await
    }

    async fn reject(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle_in_memory(id, TerminalAction::Reject).await
    }

    async fn publish(&self, queue: &str, delivery: &Delivery) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(LinkError::Publish {
                queue: queue.to_string(),
                reason: "publish refused".to_string(),
            });
        }
        state.published.push((queue.to_string(), delivery.clone()));
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_stays_under_cap() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(2),
            max_attempts: Some(3),
        };
        assert!(policy.delay(1) >= Duration::from_millis(500));
        for attempt in 1..10 {
            assert!(policy.delay(attempt) <= Duration::from_secs(2));
        }
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(ReconnectPolicy::default().allows(u32::MAX));
    }

    #[tokio::test]
    async fn deliveries_flow_to_subscriber() {
        let broker = InMemoryBroker::new();
        broker.publish_message("orders", "orders.created", "a").await;
        let mut stream = broker.subscribe(&Subscription::new("orders", 4)).await.unwrap();
        broker.publish_message("orders", "orders.created", "b").await;

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.body, b"a".to_vec());
        assert_eq!(second.body, b"b".to_vec());
        assert_ne!(first.id, second.id);
        assert!(!first.redelivered);
    }

    #[tokio::test]
    async fn repeated_settlement_is_a_noop() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        broker.publish_message("q", "k", "x").await;
        let delivery = stream.next().await.unwrap();

        broker.ack(delivery.id).await.unwrap();
        broker.ack(delivery.id).await.unwrap();
        broker.reject(delivery.id).await.unwrap();

        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Ack)]);
    }

    #[tokio::test]
    async fn requeue_redelivers_with_flag() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        broker.publish_message("q", "k", "x").await;
        let delivery = stream.next().await.unwrap();

        broker.requeue(delivery.id).await.unwrap();
        let again = stream.next().await.unwrap();
        assert!(again.redelivered);
        assert_ne!(again.id, delivery.id);
        assert_eq!(again.body, delivery.body);
    }

    #[tokio::test]
    async fn reconnect_makes_old_identities_stale() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        broker.publish_message("q", "k", "x").await;
        let delivery = stream.next().await.unwrap();

        broker.reconnect().await;
        let again = stream.next().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.id.epoch, delivery.id.epoch + 1);

        broker.ack(delivery.id).await.unwrap();
        assert!(broker.actions().await.is_empty());
        broker.ack(again.id).await.unwrap();
        assert_eq!(broker.actions().await, vec![(again.id, TerminalAction::Ack)]);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        broker.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!broker.is_healthy());
        assert_eq!(broker.ack(DeliveryId::new(0, 1)).await, Err(LinkError::Closed));
    }
}
