use std::fmt;

use crate::retry::DeliveryPhase;
use crate::types::DeliveryId;

/// Classified result of a single HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// 4xx, terminal 3xx, or any other non-retryable status.
    ClientRejected,
    /// 5xx, or a status the route lists as transient.
    ServerTransient,
    Timeout,
    ConnectionFailure,
    /// No route, or the route's templates could not be resolved for this
    /// delivery.
    MalformedRoute,
}

impl Outcome {
    /// Whether the outcome may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Outcome::ServerTransient | Outcome::Timeout | Outcome::ConnectionFailure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ClientRejected => "client_rejected",
            Outcome::ServerTransient => "server_transient",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionFailure => "connection_failure",
            Outcome::MalformedRoute => "malformed_route",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid configuration. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("invalid route {route}: {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("duplicate route id {0}")]
    DuplicateRoute(String),

    #[error("queue {0} is subscribed but no route can resolve it")]
    UnroutableQueue(String),

    #[error("no subscriptions configured")]
    NoSubscriptions,

    #[error("parse event mapping: {0}")]
    Mapping(#[from] serde_json::Error),

    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Route table lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no route for queue {queue} with routing key {routing_key}")]
    NotFound { queue: String, routing_key: String },
}

/// Errors from the broker link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Initial connection failed. Fatal at startup.
    #[error("connect to broker: {0}")]
    Connect(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    /// The link has been closed; no further operations are possible.
    #[error("broker link closed")]
    Closed,
}

/// Errors from the HTTP transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// Connection, DNS or TLS failure.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Redirects were not resolved to a final response.
    #[error("redirect not followed: {0}")]
    Redirect(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Invalid retry state machine transition. Indicates a defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("cannot {event} while {from:?}")]
    InvalidTransition {
        from: DeliveryPhase,
        event: &'static str,
    },
}

/// A delivery identity was resolved twice. Indicates a defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("delivery {id} already resolved")]
    AlreadyResolved { id: DeliveryId },
}

/// Errors returned by the bridge itself.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is shut down")]
    Shutdown,

    #[error("bridge already started")]
    AlreadyStarted,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
