// amqp2http entry point.
use std::future::Future;
use std::sync::Arc;

use amqp2http::{
    init_tracing, serve_health, shutdown_channel, AmqpLink, AmqpLinkConfig, Bridge, BrokerLink,
    HttpTransport, LogFormat, ReqwestTransport, Settings,
};
use anyhow::{Context, Result};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env());
    run_with_shutdown(wait_for_signal()).await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = &'static str> + Send + 'static,
{
    let settings = Settings::from_env().context("load configuration")?;
    tracing::info!(
        amqp_url = %settings.redacted_amqp_url(),
        routes = settings.routes.len(),
        subscriptions = settings.subscriptions.len(),
        "configuration loaded"
    );

    let link = AmqpLink::connect(
        AmqpLinkConfig::new(settings.amqp_url.clone()).with_reconnect(settings.reconnect.clone()),
    )
    .await
    .context("connect to broker")?;
    let link: Arc<dyn BrokerLink> = Arc::new(link);

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(&settings.http).context("build http client")?);

    let mut bridge = Bridge::new(
        link,
        Arc::new(settings.routes.clone()),
        transport,
        settings.bridge.clone(),
    );

    let listener = TcpListener::bind(settings.http_listen)
        .await
        .with_context(|| format!("bind health endpoints on {}", settings.http_listen))?;
    let (stop_health, health_stopped) = shutdown_channel();
    let health_server = tokio::spawn(serve_health(listener, bridge.health(), async move {
        health_stopped.triggered().await;
    }));

    bridge
        .start(&settings.subscriptions)
        .await
        .context("start subscriptions")?;
    tracing::info!("amqp2http started");

    let signal = shutdown.await;
    tracing::info!(%signal, "shutdown requested");
    let report = bridge.shutdown().await.context("shut down bridge")?;
    if report.unresolved > 0 {
        tracing::warn!(unresolved = report.unresolved, "deliveries left for broker redelivery");
    }

    stop_health.trigger();
    match health_server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "health endpoints failed"),
        Err(err) => tracing::warn!(error = %err, "health endpoint task failed"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
