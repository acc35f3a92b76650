use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::ack::{AckCoordinator, Resolution};
use crate::broker::TerminalAction;
use crate::controller::Shutdown;
use crate::dispatcher::Dispatcher;
use crate::error::Outcome;
use crate::observability::{metric_inc, metric_inc_route};
use crate::retry::{AttemptRecord, Decision};
use crate::routes::RouteTable;
use crate::types::{DeadLetterTarget, Delivery, RetryPolicy};

/// Shared, read-only context for all delivery workers.
pub(crate) struct WorkerContext {
    pub routes: Arc<RouteTable>,
    pub dispatcher: Dispatcher,
    pub coordinator: Arc<AckCoordinator>,
    /// Where deliveries with no matching route go.
    pub unrouted_dead_letter: DeadLetterTarget,
    pub shutdown: Shutdown,
    pub stats: Arc<DeliveryStats>,
}

/// Result of driving one delivery to its end.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub attempts: u32,
    pub resolution: Resolution,
    /// `None` when the coordinator refused the resolution.
    pub action: Option<TerminalAction>,
}

/// Counters across all subscriptions of a bridge.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    admitted: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    dead_lettered: AtomicU64,
    unrouted: AtomicU64,
    interrupted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStatsSnapshot {
    pub admitted: u64,
    pub attempts: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub unrouted: u64,
    pub interrupted: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drive one admitted delivery through attempts, backoff and its terminal
/// action.
///
/// The attempt record lives on this task's stack, so a redelivery always
/// starts over at attempt one.
pub(crate) async fn process_delivery(delivery: Delivery, ctx: &WorkerContext) -> DeliveryReport {
    DeliveryStats::bump(&ctx.stats.admitted);
    metric_inc("amqp2http.delivery.admitted");
    if delivery.redelivered {
        debug!(
            delivery = %delivery.id,
            queue = %delivery.queue,
            "redelivered message, starting a fresh attempt record"
        );
    }

    let mut record = AttemptRecord::new();

    let route = match ctx.routes.resolve(&delivery.queue, &delivery.routing_key) {
        Ok(route) => route,
        Err(err) => {
            warn!(delivery = %delivery.id, error = %err, "dead-lettering unroutable delivery");
            DeliveryStats::bump(&ctx.stats.unrouted);
            metric_inc("amqp2http.delivery.unrouted");
            // Unroutable deliveries still pass through the state machine so the
            // record ends in a terminal phase like any other.
            let outcome = match record
                .begin_attempt()
                .and_then(|_| record.record(Outcome::MalformedRoute, &RetryPolicy::default()))
            {
                Ok(Decision::DeadLetter(outcome)) => outcome,
                _ => Outcome::MalformedRoute,
            };
            let resolution = Resolution::DeadLettered {
                outcome,
                target: ctx.unrouted_dead_letter.clone(),
            };
            return finish(&delivery, &record, resolution, ctx).await;
        }
    };

    loop {
        let attempt = match record.begin_attempt() {
            Ok(attempt) => attempt,
            Err(err) => {
                error!(delivery = %delivery.id, route = %route.id, error = %err, "retry state machine violated");
                return finish(&delivery, &record, Resolution::Interrupted, ctx).await;
            }
        };
        DeliveryStats::bump(&ctx.stats.attempts);
        metric_inc_route("amqp2http.dispatch.attempt", &route.id);

        let outcome = ctx.dispatcher.dispatch(&delivery, &route).await;
        let decision = match record.record(outcome, &route.retry) {
            Ok(decision) => decision,
            Err(err) => {
                error!(delivery = %delivery.id, route = %route.id, error = %err, "retry state machine violated");
                return finish(&delivery, &record, Resolution::Interrupted, ctx).await;
            }
        };

        match decision {
            Decision::Succeed => {
                DeliveryStats::bump(&ctx.stats.succeeded);
                metric_inc_route("amqp2http.dispatch.success", &route.id);
                return finish(&delivery, &record, Resolution::Succeeded, ctx).await;
            }
            Decision::DeadLetter(outcome) => {
                DeliveryStats::bump(&ctx.stats.dead_lettered);
                metric_inc_route("amqp2http.dispatch.dead_lettered", &route.id);
                let resolution = Resolution::DeadLettered {
                    outcome,
                    target: route.dead_letter.clone(),
                };
                return finish(&delivery, &record, resolution, ctx).await;
            }
            Decision::Retry(delay) => {
                DeliveryStats::bump(&ctx.stats.retries);
                metric_inc_route("amqp2http.dispatch.retry", &route.id);
                info!(
                    delivery = %delivery.id,
                    route = %route.id,
                    attempt,
                    %outcome,
                    delay_ms = delay.as_millis() as u64,
                    "retrying delivery after backoff"
                );
                tokio::select! {
                    biased;
                    _ = ctx.shutdown.triggered() => {
                        info!(delivery = %delivery.id, attempt, "shutdown during backoff, returning message to broker");
                        DeliveryStats::bump(&ctx.stats.interrupted);
                        return finish(&delivery, &record, Resolution::Interrupted, ctx).await;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn finish(
    delivery: &Delivery,
    record: &AttemptRecord,
    resolution: Resolution,
    ctx: &WorkerContext,
) -> DeliveryReport {
    let action = match ctx.coordinator.resolve(delivery, resolution.clone()).await {
        Ok(action) => {
            debug!(
                delivery = %delivery.id,
                attempts = record.attempts(),
                elapsed_ms = record.elapsed().as_millis() as u64,
                %action,
                "delivery settled"
            );
            Some(action)
        }
        Err(err) => {
            error!(delivery = %delivery.id, error = %err, "delivery could not be settled");
            None
        }
    };

    DeliveryReport {
        attempts: record.attempts(),
        resolution,
        action,
    }
}
