use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amqp2http::{
    Delivery, DeliveryId, Dispatcher, HttpClientConfig, HttpTransport, MessageProperties, Outcome,
    ReqwestTransport, Route,
};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::routing::{any, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
}

async fn record(State(seen): State<Seen>, headers: HeaderMap, body: axum::body::Bytes) -> StatusCode {
    seen.requests.lock().unwrap().push((headers, body.to_vec()));
    StatusCode::OK
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK
}

struct TestServer {
    addr: SocketAddr,
    seen: Seen,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn serve() -> TestServer {
    let seen = Seen::default();
    let app = Router::new()
        .route("/record", post(record))
        .route("/status/:code", any(status))
        .route("/slow", any(slow))
        .route("/moved", any(|| async { Redirect::temporary("/record") }))
        .route("/loop", any(|| async { Redirect::temporary("/loop") }))
        .with_state(seen.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        seen,
        _shutdown: tx,
    }
}

fn dispatcher() -> Dispatcher {
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(&HttpClientConfig::default()).unwrap());
    Dispatcher::new(transport)
}

fn delivery() -> Delivery {
    Delivery::new(DeliveryId::new(1, 1), "orders", "orders.created", r#"{"id":7}"#)
}

#[tokio::test]
async fn success_and_forwarded_headers() {
    let server = serve().await;
    let route = Route::new("record", server.url("/record")).for_queue("orders");
    let delivery = delivery()
        .with_header("tenant", "acme")
        .with_properties(MessageProperties {
            content_type: Some("application/json".to_string()),
            message_id: Some("m-7".to_string()),
            ..MessageProperties::default()
        });

    assert_eq!(dispatcher().dispatch(&delivery, &route).await, Outcome::Success);

    let requests = server.seen.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    assert_eq!(body, br#"{"id":7}"#);
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers["x-message-id"], "m-7");
    assert_eq!(headers["x-routing-key"], "orders.created");
    assert_eq!(headers["x-amqp-header-tenant"], "acme");
    assert!(headers.get("x-correlation-id").is_none());
}

#[tokio::test]
async fn statuses_are_classified() {
    let server = serve().await;
    let dispatcher = dispatcher();
    let cases = [
        (204, Outcome::Success),
        (400, Outcome::ClientRejected),
        (404, Outcome::ClientRejected),
        (500, Outcome::ServerTransient),
        (503, Outcome::ServerTransient),
    ];
    for (code, expected) in cases {
        let route = Route::new("status", server.url(&format!("/status/{code}"))).for_queue("orders");
        assert_eq!(dispatcher.dispatch(&delivery(), &route).await, expected, "status {code}");
    }
}

#[tokio::test]
async fn listed_statuses_are_transient() {
    let server = serve().await;
    let route = Route::new("status", server.url("/status/429"))
        .for_queue("orders")
        .with_transient_statuses(vec![429]);
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::ServerTransient);
}

#[tokio::test]
async fn route_timeout_is_enforced() {
    let server = serve().await;
    let route = Route::new("slow", server.url("/slow"))
        .for_queue("orders")
        .with_timeout(Duration::from_millis(200));
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::Timeout);
}

#[tokio::test]
async fn refused_connection_is_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let route = Route::new("gone", format!("http://{addr}/hook")).for_queue("orders");
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::ConnectionFailure);
}

#[tokio::test]
async fn redirects_are_followed() {
    let server = serve().await;
    let route = Route::new("moved", server.url("/moved")).for_queue("orders");
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::Success);
    assert_eq!(server.seen.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn redirect_loop_is_rejected() {
    let server = serve().await;
    let route = Route::new("loop", server.url("/loop")).for_queue("orders");
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::ClientRejected);
}

#[tokio::test]
async fn missing_placeholder_is_malformed_route() {
    let server = serve().await;
    let route = Route::new("templated", server.url("/record?id={message_id}")).for_queue("orders");
    assert_eq!(dispatcher().dispatch(&delivery(), &route).await, Outcome::MalformedRoute);
    assert!(server.seen.requests.lock().unwrap().is_empty());
}
