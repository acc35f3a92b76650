//! An AMQP to HTTP bridge.
//!
//! Messages consumed from broker queues are delivered as HTTP requests to
//! configured endpoints, and the HTTP outcome is turned back into a broker
//! acknowledgment decision. Publishers never know the bridge exists.
//!
//! ## Guarantees
//! - Exactly one terminal action (ack, requeue or reject) per delivery
//! - Bounded in-flight deliveries per subscription (prefetch)
//! - Bounded retries with capped exponential backoff
//! - At-least-once delivery to endpoints
//!
//! ## Non-Guarantees
//! - Ordering across deliveries
//! - Exactly-once delivery
//! - Payload transformation or validation
//!
//! The broker is the only durable store. A delivery in flight when the
//! process dies is redelivered by the broker and starts over with a fresh
//! attempt count.

mod ack;
mod bridge;
mod broker;
#[cfg(feature = "amqp")]
mod broker_amqp;
mod config;
mod controller;
mod dispatcher;
mod error;
mod health;
mod http;
mod observability;
mod retry;
mod routes;
mod types;
mod worker;

pub use ack::{AckConfig, AckCoordinator, Resolution};
pub use bridge::{Bridge, BridgeConfig, BridgeHealth, ShutdownReport, SubscriptionLoad};
pub use broker::{settle, BrokerLink, DeliveryStream, InMemoryBroker, ReconnectPolicy, TerminalAction};
pub use config::{
    exchange_name, queue_name, DeliverySpec, EndpointSpec, EventMapping, ExchangeMapping,
    IntegrationMapping, RetrySpec, RouteDefaults, RouteSpec, Settings, SubscriptionSpec,
    DEFAULT_AMQP_URL, DEFAULT_HTTP_LISTEN, SLOW_DOWN_STATUSES,
};
pub use controller::{shutdown_channel, ConcurrencyController, Shutdown, ShutdownTrigger};
pub use dispatcher::{
    build_request, classify_status, classify_transport_error, forwarded_headers, Dispatcher,
    AMQP_HEADER_PREFIX,
};
pub use error::{
    AckError, BridgeError, ConfigError, LinkError, Outcome, RetryError, RouteError, TransportError,
};
pub use health::{health_router, serve_health, SERVICE_NAME};
pub use http::{HttpClientConfig, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use observability::{init_tracing, LogFormat};
pub use retry::{backoff_delay, decide, exponential_delay, AttemptRecord, Decision, DeliveryPhase};
pub use routes::{topic_matches, RouteTable};
pub use types::{
    Binding, DeadLetterTarget, Delivery, DeliveryId, Headers, MessageProperties, RetryPolicy, Route,
    RouteId, Subscription,
};
pub use worker::{DeliveryReport, DeliveryStats, DeliveryStatsSnapshot};

#[cfg(feature = "amqp")]
pub use broker_amqp::{AmqpLink, AmqpLinkConfig};
