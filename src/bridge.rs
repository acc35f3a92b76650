use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ack::{AckConfig, AckCoordinator};
use crate::broker::{BrokerLink, DeliveryStream};
use crate::controller::{shutdown_channel, ConcurrencyController, Shutdown, ShutdownTrigger};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, ConfigError};
use crate::http::HttpTransport;
use crate::routes::RouteTable;
use crate::types::{DeadLetterTarget, Subscription};
use crate::worker::{process_delivery, DeliveryStats, DeliveryStatsSnapshot, WorkerContext};

const RESOLVED_WINDOW_FACTOR: usize = 4;

/// Bridge runtime settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_grace: Duration,
    /// Target for deliveries no route resolves.
    pub unrouted_dead_letter: DeadLetterTarget,
    pub ack: AckConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            unrouted_dead_letter: DeadLetterTarget::Broker,
            ack: AckConfig::default(),
        }
    }
}

/// In-flight count for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionLoad {
    pub queue: String,
    pub in_flight: usize,
    pub prefetch: u32,
}

/// What shutdown left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Deliveries still unsettled when the grace period ran out. The broker
    /// redelivers them once the connection closes.
    pub unresolved: usize,
}

struct SubscriptionHandle {
    queue: String,
    controller: Arc<ConcurrencyController>,
    intake: JoinHandle<()>,
}

/// Consumes deliveries from a broker link and forwards them over HTTP.
///
/// One intake task per subscription admits deliveries under that
/// subscription's prefetch bound and spawns a worker per delivery. Workers
/// settle through a shared [`AckCoordinator`], so every delivery gets exactly
/// one terminal action.
pub struct Bridge {
    link: Arc<dyn BrokerLink>,
    routes: Arc<RouteTable>,
    config: BridgeConfig,
    ctx: Arc<WorkerContext>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    subscriptions: Vec<SubscriptionHandle>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

/// Cloneable view of a bridge's health that outlives a borrow of the bridge.
#[derive(Clone)]
pub struct BridgeHealth {
    link: Arc<dyn BrokerLink>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl BridgeHealth {
    pub fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }

    pub fn health(&self) -> BridgeHealth {
        BridgeHealth {
            link: self.link.clone(),
            started: self.started.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl Bridge {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        routes: Arc<RouteTable>,
        transport: Arc<dyn HttpTransport>,
        config: BridgeConfig,
    ) -> Self {
        let (trigger, shutdown) = shutdown_channel();
        let ctx = Arc::new(WorkerContext {
            routes: routes.clone(),
            dispatcher: Dispatcher::new(transport),
            coordinator: Arc::new(AckCoordinator::new(link.clone(), config.ack.clone())),
            unrouted_dead_letter: config.unrouted_dead_letter.clone(),
            shutdown: shutdown.clone(),
            stats: Arc::new(DeliveryStats::default()),
        });

        Self {
            link,
            routes,
            config,
            ctx,
            trigger,
            shutdown,
            subscriptions: Vec::new(),
            started: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to every queue and start consuming.
    ///
    /// Fails without consuming anything if a subscribed queue has no route
    /// that could resolve it.
    pub async fn start(&mut self, subscriptions: &[Subscription]) -> Result<(), BridgeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BridgeError::Shutdown);
        }
        if self.started.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }
        if subscriptions.is_empty() {
            return Err(ConfigError::NoSubscriptions.into());
        }
        for subscription in subscriptions {
            if !self.routes.covers_queue(&subscription.queue) {
                return Err(ConfigError::UnroutableQueue(subscription.queue.clone()).into());
            }
        }

        // Double resolution can only involve deliveries still in flight.
        let in_flight_bound: usize = subscriptions
            .iter()
            .map(|subscription| usize::from(subscription.prefetch))
            .sum();
        self.ctx
            .coordinator
            .widen_resolved_window(in_flight_bound.saturating_mul(RESOLVED_WINDOW_FACTOR))
            .await;

        self.started.store(true, Ordering::SeqCst);
        for subscription in subscriptions {
            let stream = self.link.subscribe(subscription).await?;
            let controller = Arc::new(ConcurrencyController::new(
                subscription.prefetch,
                self.shutdown.clone(),
            ));
            let intake = tokio::spawn(intake_loop(
                subscription.queue.clone(),
                stream,
                controller.clone(),
                self.ctx.clone(),
            ));
            info!(
                queue = %subscription.queue,
                prefetch = subscription.prefetch,
                "subscription started"
            );
            self.subscriptions.push(SubscriptionHandle {
                queue: subscription.queue.clone(),
                controller,
                intake,
            });
        }
        Ok(())
    }

    /// Stop admitting, wait for in-flight deliveries up to the grace period,
    /// then close the link.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, BridgeError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Shutdown);
        }
        info!(grace_ms = self.config.shutdown_grace.as_millis() as u64, "bridge shutting down");
        self.trigger.trigger();

        for handle in &mut self.subscriptions {
            if let Err(err) = (&mut handle.intake).await {
                warn!(queue = %handle.queue, error = %err, "intake task failed");
            }
        }

        let grace = self.config.shutdown_grace;
        let drains = self.subscriptions.iter().map(|handle| {
            let controller = handle.controller.clone();
            let queue = handle.queue.clone();
            async move {
                let left = controller.drain(grace).await;
                if left > 0 {
                    warn!(%queue, unresolved = left, "grace period elapsed with deliveries in flight");
                }
                left
            }
        });
        let unresolved: usize = futures::future::join_all(drains).await.into_iter().sum();

        if let Err(err) = self.link.close().await {
            warn!(error = %err, "closing broker link failed");
        }
        info!(unresolved, "bridge stopped");
        Ok(ShutdownReport { unresolved })
    }

    /// Healthy while running with a healthy broker link.
    pub fn is_healthy(&self) -> bool {
        self.started.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && self.link.is_healthy()
    }

    pub fn health(&self) -> BridgeHealth {
        BridgeHealth {
            link: self.link.clone(),
            started: self.started.clone(),
            stopped: self.stopped.clone(),
        }
    }

    pub fn load(&self) -> Vec<SubscriptionLoad> {
        self.subscriptions
            .iter()
            .map(|handle| SubscriptionLoad {
                queue: handle.queue.clone(),
                in_flight: handle.controller.in_flight(),
                prefetch: handle.controller.limit(),
            })
            .collect()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.ctx.stats.snapshot()
    }
}

async fn intake_loop(
    queue: String,
    mut stream: DeliveryStream,
    controller: Arc<ConcurrencyController>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = ctx.shutdown.triggered() => break,
            next = stream.next() => match next {
                Some(delivery) => delivery,
                None => {
                    debug!(%queue, "delivery stream ended");
                    break;
                }
            },
        };

        // A delivery received but never admitted stays unsettled and returns
        // to the queue when the channel closes.
        let Some(permit) = controller.admit().await else {
            debug!(%queue, delivery = %delivery.id, "shutdown before admission");
            break;
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            process_delivery(delivery, &ctx).await;
        });
    }
}
