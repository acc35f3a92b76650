use std::collections::HashSet;
use std::sync::Arc;

use reqwest::Url;

use crate::dispatcher::template_placeholders;
use crate::error::{ConfigError, RouteError};
use crate::types::Route;

/// Immutable mapping from broker sources to HTTP routes.
///
/// Lookup order is fixed: an exact queue match wins, otherwise the first
/// routing-key pattern that matches, in declaration order. An entry with both
/// a queue and a pattern only matches deliveries on that queue whose routing
/// key fits the pattern.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Validate and freeze a set of routes.
    pub fn new(routes: Vec<Route>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for route in &routes {
            if !seen.insert(route.id.0.clone()) {
                return Err(ConfigError::DuplicateRoute(route.id.0.clone()));
            }
            validate_route(route)?;
        }

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn resolve(&self, queue: &str, routing_key: &str) -> Result<Arc<Route>, RouteError> {
        let exact = self.routes.iter().find(|route| {
            route.queue.as_deref() == Some(queue)
                && route
                    .routing_key
                    .as_deref()
                    .map_or(true, |pattern| topic_matches(pattern, routing_key))
        });
        if let Some(route) = exact {
            return Ok(route.clone());
        }

        self.routes
            .iter()
            .filter(|route| route.queue.is_none())
            .find(|route| {
                route
                    .routing_key
                    .as_deref()
                    .is_some_and(|pattern| topic_matches(pattern, routing_key))
            })
            .cloned()
            .ok_or_else(|| RouteError::NotFound {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            })
    }

    /// Whether a delivery on `queue` can be resolved by any route.
    ///
    /// True if an exact entry exists or any pattern entry is declared; the
    /// pattern itself can only be checked per delivery.
    pub fn covers_queue(&self, queue: &str) -> bool {
        self.routes.iter().any(|route| {
            route.queue.as_deref() == Some(queue)
                || (route.queue.is_none() && route.routing_key.is_some())
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|route| route.as_ref())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn validate_route(route: &Route) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRoute {
        route: route.id.0.clone(),
        reason,
    };

    if route.queue.is_none() && route.routing_key.is_none() {
        return Err(invalid("route needs a queue or a routing key pattern".to_string()));
    }
    if let Some(pattern) = &route.routing_key {
        if pattern.is_empty() {
            return Err(invalid("routing key pattern is empty".to_string()));
        }
    }
    if route.timeout.is_zero() {
        return Err(invalid("timeout must be greater than zero".to_string()));
    }
    route.retry.validate().map_err(invalid)?;

    for status in &route.transient_statuses {
        if !(100..=599).contains(status) {
            return Err(invalid(format!("transient status {status} is not an HTTP status")));
        }
    }

    let placeholders = template_placeholders(&route.url).map_err(invalid)?;
    for (_, value) in &route.headers {
        template_placeholders(value).map_err(invalid)?;
    }

    // Placeholders may sit in the host, so only fully static URLs can be
    // parsed up front.
    if placeholders.is_empty() {
        let url = Url::parse(&route.url).map_err(|e| invalid(format!("url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported url scheme {}", url.scheme())));
        }
    } else if !(route.url.starts_with("http://") || route.url.starts_with("https://")) {
        return Err(invalid("url must start with http:// or https://".to_string()));
    }

    Ok(())
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) => {
                (word == "*" || word == first) && match_words(rest, key_rest)
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetryPolicy;
    use std::time::Duration;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            Route::new("orders", "https://svc/orders").for_queue("orders"),
            Route::new("created", "https://svc/created").for_routing_key("*.created"),
            Route::new("all-orders", "https://svc/all").for_routing_key("orders.#"),
            Route::new("fallback", "https://svc/fallback").for_routing_key("#"),
        ])
        .unwrap()
    }

    #[test]
    fn exact_queue_beats_pattern() {
        let route = table().resolve("orders", "orders.created").unwrap();
        assert_eq!(route.id.0, "orders");
    }

    #[test]
    fn queue_entry_with_pattern_needs_both() {
        let table = RouteTable::new(vec![
            Route::new("created", "https://svc/created")
                .for_queue("orders")
                .for_routing_key("orders.created"),
            Route::new("orders", "https://svc/orders").for_queue("orders"),
            Route::new("deleted", "https://svc/deleted").for_routing_key("*.deleted"),
        ])
        .unwrap();
        assert_eq!(table.resolve("orders", "orders.created").unwrap().id.0, "created");
        assert_eq!(table.resolve("orders", "orders.deleted").unwrap().id.0, "orders");
        assert_eq!(table.resolve("audit", "orders.deleted").unwrap().id.0, "deleted");

        let narrow = RouteTable::new(vec![Route::new("created", "https://svc/created")
            .for_queue("orders")
            .for_routing_key("orders.created")])
        .unwrap();
        assert!(narrow.covers_queue("orders"));
        assert!(matches!(
            narrow.resolve("orders", "orders.deleted"),
            Err(RouteError::NotFound { .. })
        ));
    }

    #[test]
    fn first_matching_pattern_wins() {
        let table = table();
        assert_eq!(table.resolve("q", "orders.created").unwrap().id.0, "created");
        assert_eq!(table.resolve("q", "orders.deleted").unwrap().id.0, "all-orders");
        assert_eq!(table.resolve("q", "users.deleted").unwrap().id.0, "fallback");
    }

    #[test]
    fn resolution_is_deterministic() {
        let table = table();
        let first = table.resolve("q", "orders.created").unwrap();
        for _ in 0..10 {
            assert!(Arc::ptr_eq(&first, &table.resolve("q", "orders.created").unwrap()));
        }
    }

    #[test]
    fn unknown_queue_is_not_found() {
        let table = RouteTable::new(vec![
            Route::new("orders", "https://svc/orders").for_queue("orders"),
        ])
        .unwrap();
        assert_eq!(
            table.resolve("unknown", "x").unwrap_err(),
            RouteError::NotFound {
                queue: "unknown".to_string(),
                routing_key: "x".to_string(),
            }
        );
        assert!(!table.covers_queue("unknown"));
        assert!(table.covers_queue("orders"));
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("a.b", "a.b"));
        assert!(!topic_matches("a.b", "a.c"));
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.c", "a.b.c"));
        assert!(topic_matches("*.b.#", "a.b"));
        assert!(!topic_matches("*", ""));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = RouteTable::new(vec![
            Route::new("a", "https://svc/1").for_queue("q1"),
            Route::new("a", "https://svc/2").for_queue("q2"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRoute(id) if id == "a"));
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let route = Route::new("a", "https://svc")
            .for_queue("q")
            .with_retry_policy(RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(2)));
        assert!(RouteTable::new(vec![route]).is_err());

        let route = Route::new("b", "https://svc")
            .for_queue("q")
            .with_retry_policy(RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(2)));
        assert!(RouteTable::new(vec![route]).is_err());

        let route = Route::new("c", "https://svc").for_queue("q").with_timeout(Duration::ZERO);
        assert!(RouteTable::new(vec![route]).is_err());
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(RouteTable::new(vec![Route::new("a", "not a url").for_queue("q")]).is_err());
        assert!(RouteTable::new(vec![Route::new("a", "ftp://svc/x").for_queue("q")]).is_err());
        assert!(RouteTable::new(vec![Route::new("a", "https://svc/{nope}").for_queue("q")]).is_err());
        assert!(RouteTable::new(vec![Route::new("a", "https://svc/{routing_key").for_queue("q")]).is_err());
        assert!(RouteTable::new(vec![
            Route::new("a", "https://svc/{header.tenant}/x").for_queue("q")
        ])
        .is_ok());
    }

    #[test]
    fn route_without_source_is_rejected() {
        assert!(RouteTable::new(vec![Route::new("a", "https://svc")]).is_err());
    }
}
