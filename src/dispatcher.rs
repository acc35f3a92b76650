use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tracing::{debug, info, warn};

use crate::error::{Outcome, TransportError};
use crate::http::{HttpRequest, HttpTransport};
use crate::types::{Delivery, Route};

/// Prefix for AMQP headers forwarded as HTTP headers.
pub const AMQP_HEADER_PREFIX: &str = "X-AMQP-HEADER-";

/// Unreserved characters (RFC 3986) stay as-is in substituted URL values.
const URL_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Performs one HTTP attempt per call and classifies the result.
///
/// The dispatcher never retries and never touches broker state; both belong
/// to the caller.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    pub async fn dispatch(&self, delivery: &Delivery, route: &Route) -> Outcome {
        let request = match build_request(delivery, route) {
            Ok(request) => request,
            Err(reason) => {
                warn!(
                    route = %route.id,
                    delivery = %delivery.id,
                    %reason,
                    "route could not be resolved for delivery"
                );
                return Outcome::MalformedRoute;
            }
        };

        debug!(
            route = %route.id,
            delivery = %delivery.id,
            method = %request.method,
            url = %request.url,
            headers = ?request.headers,
            body_len = request.body.len(),
            "amqp-to-http request"
        );

        match self.transport.send(request).await {
            Ok(response) => {
                debug!(
                    route = %route.id,
                    delivery = %delivery.id,
                    status = response.status.as_u16(),
                    body_len = response.body.len(),
                    "amqp-to-http response"
                );
                let outcome = classify_status(response.status, &route.transient_statuses);
                if outcome != Outcome::Success {
                    info!(
                        route = %route.id,
                        delivery = %delivery.id,
                        status = response.status.as_u16(),
                        %outcome,
                        "endpoint did not accept delivery"
                    );
                }
                outcome
            }
            Err(err) => {
                let outcome = classify_transport_error(&err);
                info!(
                    route = %route.id,
                    delivery = %delivery.id,
                    error = %err,
                    %outcome,
                    "amqp-to-http request failed"
                );
                outcome
            }
        }
    }
}

/// Map a final HTTP status to an outcome.
pub fn classify_status(status: StatusCode, transient_statuses: &[u16]) -> Outcome {
    if transient_statuses.contains(&status.as_u16()) {
        return Outcome::ServerTransient;
    }
    if status.is_success() {
        Outcome::Success
    } else if status.is_server_error() {
        Outcome::ServerTransient
    } else {
        // 4xx, a redirect the transport did not follow, or an informational
        // status surfacing as final: none of these improve by retrying.
        Outcome::ClientRejected
    }
}

pub fn classify_transport_error(err: &TransportError) -> Outcome {
    match err {
        TransportError::Timeout => Outcome::Timeout,
        TransportError::Connect(_) | TransportError::Request(_) => Outcome::ConnectionFailure,
        TransportError::Redirect(_) => Outcome::ClientRejected,
    }
}

/// Build the outbound request for a delivery.
///
/// Forwarded headers come first, then the route's static headers, which win
/// on conflict.
pub fn build_request(delivery: &Delivery, route: &Route) -> Result<HttpRequest, String> {
    let url = render(&route.url, delivery, true)?;
    let url = Url::parse(&url).map_err(|e| format!("url {url}: {e}"))?;

    let mut headers = forwarded_headers(delivery);
    for (name, template) in &route.headers {
        let value = render(template, delivery, false)?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("header name {name}: {e}"))?;
        let value =
            HeaderValue::from_str(&value).map_err(|e| format!("header {name} value: {e}"))?;
        headers.insert(name, value);
    }

    Ok(HttpRequest {
        method: route.method.clone(),
        url,
        headers,
        body: delivery.body.clone(),
        timeout: route.timeout,
    })
}

/// Headers derived from the delivery's properties and AMQP headers.
///
/// Absent properties are omitted; AMQP headers whose name or value cannot be
/// expressed as an HTTP header are skipped.
pub fn forwarded_headers(delivery: &Delivery) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let properties = &delivery.properties;

    let standard = [
        (CONTENT_TYPE, properties.content_type.as_deref()),
        (CONTENT_ENCODING, properties.content_encoding.as_deref()),
        (HeaderName::from_static("x-correlation-id"), properties.correlation_id.as_deref()),
        (HeaderName::from_static("x-message-id"), properties.message_id.as_deref()),
        (HeaderName::from_static("x-routing-key"), Some(delivery.routing_key.as_str())),
    ];
    for (name, value) in standard {
        let Some(value) = value else { continue };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => debug!(header = %name, delivery = %delivery.id, "skipping unrepresentable property"),
        }
    }

    for (key, value) in &delivery.headers {
        let name = format!("{AMQP_HEADER_PREFIX}{key}");
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %key, delivery = %delivery.id, "skipping unrepresentable amqp header"),
        }
    }

    headers
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Placeholder {
    RoutingKey,
    Queue,
    MessageId,
    CorrelationId,
    Header(String),
}

#[derive(Debug)]
enum Segment<'a> {
    Literal(&'a str),
    Value(Placeholder),
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(['{', '}']) {
        if rest.as_bytes()[start] == b'}' {
            return Err(format!("unmatched '}}' in template {template}"));
        }
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unclosed placeholder in template {template}"))?;
        segments.push(Segment::Value(parse_placeholder(&after[..end])?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }

    Ok(segments)
}

fn parse_placeholder(name: &str) -> Result<Placeholder, String> {
    match name {
        "routing_key" => Ok(Placeholder::RoutingKey),
        "queue" => Ok(Placeholder::Queue),
        "message_id" => Ok(Placeholder::MessageId),
        "correlation_id" => Ok(Placeholder::CorrelationId),
        _ => match name.strip_prefix("header.") {
            Some(header) if !header.is_empty() => Ok(Placeholder::Header(header.to_string())),
            _ => Err(format!("unknown placeholder {{{name}}}")),
        },
    }
}

/// Placeholders used by a template; fails on malformed templates.
pub(crate) fn template_placeholders(template: &str) -> Result<Vec<Placeholder>, String> {
    Ok(parse_template(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Value(placeholder) => Some(placeholder),
            Segment::Literal(_) => None,
        })
        .collect())
}

fn render(template: &str, delivery: &Delivery, encode: bool) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Value(placeholder) => {
                let value = placeholder_value(&placeholder, delivery)?;
                if encode {
                    out.extend(utf8_percent_encode(value, URL_VALUE));
                } else {
                    out.push_str(value);
                }
            }
        }
    }
    Ok(out)
}

fn placeholder_value<'a>(placeholder: &Placeholder, delivery: &'a Delivery) -> Result<&'a str, String> {
    let value = match placeholder {
        Placeholder::RoutingKey => Some(delivery.routing_key.as_str()),
        Placeholder::Queue => Some(delivery.queue.as_str()),
        Placeholder::MessageId => delivery.properties.message_id.as_deref(),
        Placeholder::CorrelationId => delivery.properties.correlation_id.as_deref(),
        Placeholder::Header(name) => delivery.headers.get(name).map(String::as_str),
    };
    value.ok_or_else(|| format!("delivery has no value for {placeholder:?}"))
}
