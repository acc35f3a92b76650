use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

/// String-keyed message headers, as seen by the bridge.
///
/// AMQP header values are stringified on receipt; ordering is stable so that
/// forwarded HTTP headers come out in a deterministic order.
pub type Headers = BTreeMap<String, String>;

/// Identity of one broker delivery.
///
/// Delivery tags are only unique per channel, and channels are replaced on
/// reconnect, so the identity pairs the tag with the channel epoch it was
/// received on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId {
    pub epoch: u64,
    pub tag: u64,
}

impl DeliveryId {
    pub fn new(epoch: u64, tag: u64) -> Self {
        Self { epoch, tag }
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.tag)
    }
}

/// Standard AMQP message properties forwarded as HTTP headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

/// One broker message instance handed to the bridge.
///
/// The body is treated as opaque bytes. A `Delivery` is never mutated; it is
/// owned by the broker link until a terminal action is issued for its `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

impl Delivery {
    /// Create a delivery with empty headers and properties.
    pub fn new(
        id: DeliveryId,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: Headers::new(),
            properties: MessageProperties::default(),
            redelivered: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }
}

/// Unique identifier for a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub String);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retry policy for a route.
///
/// `max_attempts` counts every HTTP attempt including the first one, so a
/// value of 1 disables retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            jitter_min: Duration::ZERO,
            jitter_max: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            backoff_cap,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter_min = min;
        self.jitter_max = max;
        self
    }

    /// Check the policy for values the retry engine cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_base > self.backoff_cap {
            return Err(format!(
                "backoff base {:?} exceeds backoff cap {:?}",
                self.backoff_base, self.backoff_cap
            ));
        }
        if self.jitter_min > self.jitter_max {
            return Err(format!(
                "jitter min {:?} exceeds jitter max {:?}",
                self.jitter_min, self.jitter_max
            ));
        }
        Ok(())
    }
}

/// Where a permanently failed delivery goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "queue")]
pub enum DeadLetterTarget {
    /// Reject without requeue; the broker's dead-letter exchange applies if
    /// the queue has one.
    #[default]
    Broker,
    /// Requeue on the broker. Only used when explicitly configured.
    Requeue,
    /// Republish to an alternate queue, then reject the original.
    Queue(String),
}

/// Destination binding for deliveries.
///
/// A `Route` describes *where* and *how* a delivery is forwarded. It is a pure
/// configuration object, immutable once the route table is loaded.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: RouteId,

    /// Exact source queue, matched before any pattern.
    pub queue: Option<String>,

    /// AMQP topic pattern matched against the routing key.
    pub routing_key: Option<String>,

    pub method: Method,

    /// Target URL, may contain `{placeholder}` segments.
    pub url: String,

    /// Static header templates, applied after the forwarded headers.
    pub headers: Vec<(String, String)>,

    /// Maximum time allowed for a single attempt.
    pub timeout: Duration,

    pub retry: RetryPolicy,
    pub dead_letter: DeadLetterTarget,

    /// Statuses treated as transient regardless of their class.
    pub transient_statuses: Vec<u16>,
}

impl Route {
    /// Create a route with default delivery settings.
    ///
    /// Defaults:
    /// - method: POST
    /// - timeout: 10 seconds
    /// - retry: [`RetryPolicy::default`]
    /// - dead letter: [`DeadLetterTarget::Broker`]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RouteId(id.into()),
            queue: None,
            routing_key: None,
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            dead_letter: DeadLetterTarget::Broker,
            transient_statuses: Vec::new(),
        }
    }

    /// Match deliveries consumed from this queue.
    pub fn for_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Match deliveries whose routing key fits this topic pattern.
    pub fn for_routing_key(mut self, pattern: impl Into<String>) -> Self {
        self.routing_key = Some(pattern.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letter(mut self, target: DeadLetterTarget) -> Self {
        self.dead_letter = target;
        self
    }

    pub fn with_transient_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.transient_statuses = statuses.into();
        self
    }
}

/// Exchange binding declared for a subscription's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Topic exchange the queue is bound to.
    pub exchange: String,
    /// Upstream exchange the topic exchange is itself bound to, if any.
    pub upstream_exchange: Option<String>,
    pub routing_key: String,
}

/// One consumer on one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub queue: String,
    pub prefetch: u16,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, prefetch: u16) -> Self {
        Self {
            queue: queue.into(),
            prefetch: prefetch.max(1),
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }
}
