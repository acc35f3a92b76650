use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::{settle, BrokerLink, TerminalAction};
use crate::error::{AckError, Outcome};
use crate::observability::metric_inc;
use crate::retry::exponential_delay;
use crate::types::{DeadLetterTarget, Delivery, DeliveryId};

/// How a delivery's lifecycle in the bridge ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    DeadLettered {
        outcome: Outcome,
        target: DeadLetterTarget,
    },
    /// Shutdown interrupted a backoff wait; hand the message back to the
    /// broker.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// Publish attempts against an alternate dead-letter queue before the
    /// message is dropped.
    pub dead_letter_publish_attempts: u32,
    pub dead_letter_retry_base: Duration,
    pub dead_letter_retry_cap: Duration,
    /// Most recent resolutions remembered for double-resolution checks.
    /// [`Bridge::start`](crate::Bridge::start) widens it to cover the
    /// subscriptions' combined prefetch.
    pub resolved_window: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            dead_letter_publish_attempts: 3,
            dead_letter_retry_base: Duration::from_millis(100),
            dead_letter_retry_cap: Duration::from_secs(2),
            resolved_window: 1024,
        }
    }
}

/// Turns resolutions into broker terminal actions, at most one per delivery
/// identity.
pub struct AckCoordinator {
    link: Arc<dyn BrokerLink>,
    config: AckConfig,
    resolved: Mutex<ResolvedSet>,
}

/// Recently resolved identities, oldest first. Only deliveries that can
/// still be in flight need remembering, so the window is bounded.
#[derive(Debug)]
struct ResolvedSet {
    capacity: usize,
    latest_epoch: u64,
    ids: HashSet<DeliveryId>,
    order: VecDeque<DeliveryId>,
}

impl ResolvedSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            latest_epoch: 0,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn widen(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity);
    }

    fn claim(&mut self, id: DeliveryId) -> bool {
        if id.epoch > self.latest_epoch {
            self.latest_epoch = id.epoch;
            // Deliveries from two reconnects ago can no longer be in flight.
            let keep_from = id.epoch.saturating_sub(1);
            self.ids.retain(|known| known.epoch >= keep_from);
            self.order.retain(|known| known.epoch >= keep_from);
        }
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

impl AckCoordinator {
    pub fn new(link: Arc<dyn BrokerLink>, config: AckConfig) -> Self {
        let resolved = Mutex::new(ResolvedSet::with_capacity(config.resolved_window));
        Self {
            link,
            config,
            resolved,
        }
    }

    /// Remember at least `capacity` resolutions. Never shrinks the window.
    pub async fn widen_resolved_window(&self, capacity: usize) {
        self.resolved.lock().await.widen(capacity);
    }

    /// Issue the terminal action for `delivery`.
    ///
    /// Returns the action taken. Resolving an identity twice is a defect: it
    /// is logged at error level and rejected without touching the broker.
    pub async fn resolve(
        &self,
        delivery: &Delivery,
        resolution: Resolution,
    ) -> Result<TerminalAction, AckError> {
        if !self.resolved.lock().await.claim(delivery.id) {
            error!(
                delivery = %delivery.id,
                queue = %delivery.queue,
                ?resolution,
                "delivery resolved twice"
            );
            metric_inc("amqp2http.ack.double_resolution");
            return Err(AckError::AlreadyResolved { id: delivery.id });
        }

        let action = match &resolution {
            Resolution::Succeeded => TerminalAction::Ack,
            Resolution::Interrupted => TerminalAction::Requeue,
            Resolution::DeadLettered { outcome, target } => {
                info!(
                    delivery = %delivery.id,
                    queue = %delivery.queue,
                    routing_key = %delivery.routing_key,
                    %outcome,
                    ?target,
                    "dead-lettering delivery"
                );
                match target {
                    DeadLetterTarget::Broker => TerminalAction::Reject,
                    DeadLetterTarget::Requeue => TerminalAction::Requeue,
                    DeadLetterTarget::Queue(queue) => {
                        self.publish_dead_letter(queue, delivery).await;
                        TerminalAction::Reject
                    }
                }
            }
        };

        if let Err(err) = settle(self.link.as_ref(), delivery.id, action).await {
            // The identity stays resolved: once the connection is gone the
            // broker redelivers on its own.
            warn!(delivery = %delivery.id, %action, error = %err, "failed to settle delivery");
            metric_inc("amqp2http.ack.settle_failed");
        }

        metric_inc(match action {
            TerminalAction::Ack => "amqp2http.delivery.acked",
            TerminalAction::Requeue => "amqp2http.delivery.requeued",
            TerminalAction::Reject => "amqp2http.delivery.rejected",
        });
        Ok(action)
    }

    async fn publish_dead_letter(&self, queue: &str, delivery: &Delivery) {
        let attempts = self.config.dead_letter_publish_attempts.max(1);
        for attempt in 1..=attempts {
            match self.link.publish(queue, delivery).await {
                Ok(()) => {
                    metric_inc("amqp2http.dead_letter.published");
                    return;
                }
                Err(err) => {
                    warn!(
                        delivery = %delivery.id,
                        dead_letter_queue = %queue,
                        attempt,
                        error = %err,
                        "dead-letter publish failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(exponential_delay(
                            attempt,
                            self.config.dead_letter_retry_base,
                            self.config.dead_letter_retry_cap,
                        ))
                        .await;
                    }
                }
            }
        }

        error!(
            delivery = %delivery.id,
            dead_letter_queue = %queue,
            attempts,
            "dead-letter target unreachable, dropping message"
        );
        metric_inc("amqp2http.dead_letter.dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::types::Subscription;
    use futures::StreamExt;

    async fn setup() -> (Arc<InMemoryBroker>, AckCoordinator, Delivery) {
        let broker = Arc::new(InMemoryBroker::new());
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        broker.publish_message("q", "k", "body").await;
        let delivery = stream.next().await.unwrap();
        let coordinator = AckCoordinator::new(broker.clone(), AckConfig::default());
        (broker, coordinator, delivery)
    }

    #[tokio::test]
    async fn success_acks() {
        let (broker, coordinator, delivery) = setup().await;
        let action = coordinator.resolve(&delivery, Resolution::Succeeded).await.unwrap();
        assert_eq!(action, TerminalAction::Ack);
        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Ack)]);
    }

    #[tokio::test]
    async fn dead_letter_defaults_to_reject() {
        let (broker, coordinator, delivery) = setup().await;
        let resolution = Resolution::DeadLettered {
            outcome: Outcome::ClientRejected,
            target: DeadLetterTarget::default(),
        };
        assert_eq!(coordinator.resolve(&delivery, resolution).await.unwrap(), TerminalAction::Reject);
        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Reject)]);
    }

    #[tokio::test]
    async fn requeue_target_requeues() {
        let (_broker, coordinator, delivery) = setup().await;
        let resolution = Resolution::DeadLettered {
            outcome: Outcome::ServerTransient,
            target: DeadLetterTarget::Requeue,
        };
        assert_eq!(coordinator.resolve(&delivery, resolution).await.unwrap(), TerminalAction::Requeue);
    }

    #[tokio::test]
    async fn queue_target_publishes_then_rejects() {
        let (broker, coordinator, delivery) = setup().await;
        let resolution = Resolution::DeadLettered {
            outcome: Outcome::ClientRejected,
            target: DeadLetterTarget::Queue("parking".to_string()),
        };
        coordinator.resolve(&delivery, resolution).await.unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "parking");
        assert_eq!(published[0].1.body, b"body".to_vec());
        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Reject)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_dead_letter_queue_is_bounded() {
        let (broker, coordinator, delivery) = setup().await;
        broker.fail_next_publishes(10).await;
        let resolution = Resolution::DeadLettered {
            outcome: Outcome::ClientRejected,
            target: DeadLetterTarget::Queue("parking".to_string()),
        };
        let action = coordinator.resolve(&delivery, resolution).await.unwrap();

        assert_eq!(action, TerminalAction::Reject);
        assert!(broker.published().await.is_empty());
        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Reject)]);
    }

    #[tokio::test]
    async fn second_resolution_is_refused() {
        let (broker, coordinator, delivery) = setup().await;
        coordinator.resolve(&delivery, Resolution::Succeeded).await.unwrap();
        let err = coordinator
            .resolve(&delivery, Resolution::Interrupted)
            .await
            .unwrap_err();
        assert_eq!(err, AckError::AlreadyResolved { id: delivery.id });
        assert_eq!(broker.actions().await, vec![(delivery.id, TerminalAction::Ack)]);
    }

    #[test]
    fn resolved_set_forgets_old_epochs() {
        let mut set = ResolvedSet::with_capacity(16);
        assert!(set.claim(DeliveryId::new(0, 1)));
        assert!(!set.claim(DeliveryId::new(0, 1)));
        assert!(set.claim(DeliveryId::new(1, 1)));
        assert!(!set.claim(DeliveryId::new(0, 1)));
        assert!(set.claim(DeliveryId::new(2, 1)));
        assert_eq!(set.ids.len(), 2);
        assert_eq!(set.order.len(), 2);
    }

    #[test]
    fn resolved_set_is_bounded_within_an_epoch() {
        let mut set = ResolvedSet::with_capacity(64);
        for tag in 1..=5_000 {
            assert!(set.claim(DeliveryId::new(1, tag)));
        }
        assert_eq!(set.ids.len(), 64);
        assert_eq!(set.order.len(), 64);
        assert!(!set.claim(DeliveryId::new(1, 5_000)));
        assert!(!set.claim(DeliveryId::new(1, 4_937)));

        set.widen(128);
        set.widen(32);
        assert_eq!(set.capacity, 128);
    }

    #[tokio::test]
    async fn long_running_coordinator_keeps_a_bounded_window() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut stream = broker.subscribe(&Subscription::new("q", 1)).await.unwrap();
        let config = AckConfig {
            resolved_window: 32,
            ..AckConfig::default()
        };
        let coordinator = AckCoordinator::new(broker.clone(), config);

        for _ in 0..2_000 {
            broker.publish_message("q", "k", "body").await;
            let delivery = stream.next().await.unwrap();
            coordinator.resolve(&delivery, Resolution::Succeeded).await.unwrap();
        }

        let resolved = coordinator.resolved.lock().await;
        assert_eq!(resolved.ids.len(), 32);
        assert_eq!(resolved.order.len(), 32);
        assert_eq!(broker.actions().await.len(), 2_000);
    }
}
