use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerLink, DeliveryStream, OutstandingTags, ReconnectPolicy, Settlement, TerminalAction};
use crate::error::LinkError;
use crate::types::{Delivery, DeliveryId, Headers, MessageProperties, Subscription};

/// Settings for [`AmqpLink`].
#[derive(Debug, Clone)]
pub struct AmqpLinkConfig {
    pub url: String,
    pub connection_name: String,
    pub reconnect: ReconnectPolicy,
}

impl AmqpLinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: "amqp2http".to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// [`BrokerLink`] over an AMQP 0-9-1 connection.
///
/// One connection carries one channel with publisher confirms enabled. A
/// supervisor task reconnects after connection loss and re-establishes every
/// subscription with its prefetch and bindings; delivery streams suspend in
/// the meantime instead of ending.
pub struct AmqpLink {
    inner: Arc<Inner>,
}

struct Inner {
    config: AmqpLinkConfig,
    session: RwLock<Option<Session>>,
    subscriptions: Mutex<Vec<Registered>>,
    outstanding: Arc<Mutex<OutstandingTags>>,
    epoch: AtomicU64,
    healthy: AtomicBool,
    closed: AtomicBool,
    closing: Notify,
    failures: mpsc::UnboundedSender<u64>,
}

struct Session {
    epoch: u64,
    connection: Connection,
    channel: Channel,
}

struct Registered {
    subscription: Subscription,
    tx: mpsc::Sender<Delivery>,
}

impl AmqpLink {
    /// Connect to the broker. Failure here is fatal to the caller; only
    /// failures after this returns are retried.
    pub async fn connect(config: AmqpLinkConfig) -> Result<Self, LinkError> {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            session: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            outstanding: Arc::new(Mutex::new(OutstandingTags::default())),
            epoch: AtomicU64::new(1),
            healthy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            failures,
        });

        let session = inner
            .open_session(1)
            .await
            .map_err(|err| LinkError::Connect(err.to_string()))?;
        inner.outstanding.lock().await.reset(1);
        *inner.session.write().await = Some(session);
        inner.healthy.store(true, Ordering::SeqCst);
        info!(name = %inner.config.connection_name, "connected to broker");

        tokio::spawn(supervise(Arc::downgrade(&inner), failures_rx));
        Ok(Self { inner })
    }

    async fn settle(&self, id: DeliveryId, action: TerminalAction) -> Result<(), LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let guard = self.inner.session.read().await;
        let Some(session) = guard.as_ref() else {
            debug!(delivery = %id, %action, "not connected, broker will redeliver");
            return Ok(());
        };

        match self.inner.outstanding.lock().await.settle(id) {
            Settlement::First => {}
            Settlement::Repeated | Settlement::Stale => {
                debug!(delivery = %id, %action, "ignoring settlement of settled or stale delivery");
                return Ok(());
            }
        }

        let result = match action {
            TerminalAction::Ack => session.channel.basic_ack(id.tag, BasicAckOptions::default()).await,
            TerminalAction::Requeue => {
                session
                    .channel
                    .basic_nack(
                        id.tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        },
                    )
                    .await
            }
            TerminalAction::Reject => {
                session
                    .channel
                    .basic_reject(id.tag, BasicRejectOptions { requeue: false })
                    .await
            }
        };
        result.map_err(channel_error)
    }
}

impl Inner {
    async fn open_session(&self, epoch: u64) -> lapin::Result<Session> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.config.connection_name.clone().into());
        let connection = Connection::connect(&self.config.url, properties).await?;

        let failures = self.failures.clone();
        connection.on_error(move |err| {
            warn!(epoch, error = %err, "broker connection lost");
            let _ = failures.send(epoch);
        });

        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(Session {
            epoch,
            connection,
            channel,
        })
    }

    async fn start_consumer(&self, session: &Session, registered: &Registered) -> lapin::Result<()> {
        let subscription = &registered.subscription;
        declare_topology(&session.channel, subscription).await?;
        session
            .channel
            .basic_qos(subscription.prefetch, BasicQosOptions::default())
            .await?;
        let consumer = session
            .channel
            .basic_consume(
                &subscription.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tokio::spawn(forward(
            consumer,
            session.epoch,
            subscription.queue.clone(),
            registered.tx.clone(),
            self.outstanding.clone(),
            self.failures.clone(),
        ));
        Ok(())
    }

    /// Replace a lost session. Returns false when giving up or closing.
    async fn reconnect(&self) -> bool {
        let subscriptions = self.subscriptions.lock().await;
        if let Some(old) = self.session.write().await.take() {
            let _ = old.connection.close(320, "reconnecting").await;
        }

        let policy = &self.config.reconnect;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                error!(attempts = attempt - 1, "giving up reconnecting to broker");
                return false;
            }
            let delay = policy.delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to broker");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closing.notified() => return false,
            }
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }

            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let session = match self.open_session(epoch).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(attempt, error = %err, "broker reconnect failed");
                    continue;
                }
            };

            // Tags must be tracked from the first redelivery on.
            self.outstanding.lock().await.reset(epoch);
            let mut resumed = true;
            for registered in subscriptions.iter() {
                if let Err(err) = self.start_consumer(&session, registered).await {
                    warn!(queue = %registered.subscription.queue, error = %err, "resubscribe failed");
                    resumed = false;
                    break;
                }
            }
            if !resumed {
                let _ = session.connection.close(320, "resubscribe failed").await;
                continue;
            }

            if self.closed.load(Ordering::SeqCst) {
                let _ = session.connection.close(200, "shutdown").await;
                return false;
            }
            *self.session.write().await = Some(session);
            self.healthy.store(true, Ordering::SeqCst);
            info!(epoch, subscriptions = subscriptions.len(), "reconnected to broker");
            return true;
        }
    }
}

async fn supervise(inner: Weak<Inner>, mut failures: mpsc::UnboundedReceiver<u64>) {
    while let Some(failed_epoch) = failures.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        if failed_epoch != inner.epoch.load(Ordering::SeqCst) {
            continue;
        }
        inner.healthy.store(false, Ordering::SeqCst);
        if !inner.reconnect().await {
            break;
        }
    }
}

async fn forward(
    mut consumer: Consumer,
    epoch: u64,
    queue: String,
    tx: mpsc::Sender<Delivery>,
    outstanding: Arc<Mutex<OutstandingTags>>,
    failures: mpsc::UnboundedSender<u64>,
) {
    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => {
                let delivery = convert_delivery(epoch, &queue, delivery);
                outstanding.lock().await.track(delivery.id);
                if tx.send(delivery).await.is_err() {
                    debug!(%queue, "delivery stream dropped, stopping consumer");
                    return;
                }
            }
            Err(err) => {
                warn!(%queue, epoch, error = %err, "consumer failed");
                break;
            }
        }
    }
    let _ = failures.send(epoch);
}

async fn declare_topology(channel: &Channel, subscription: &Subscription) -> lapin::Result<()> {
    let durable = || ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    for binding in &subscription.bindings {
        channel
            .exchange_declare(&binding.exchange, ExchangeKind::Topic, durable(), FieldTable::default())
            .await?;
        if let Some(upstream) = &binding.upstream_exchange {
            channel
                .exchange_declare(upstream, ExchangeKind::Topic, durable(), FieldTable::default())
                .await?;
            channel
                .exchange_bind(
                    &binding.exchange,
                    upstream,
                    &binding.routing_key,
                    ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
    }

    // Queues without bindings are expected to exist already.
    let options = if subscription.bindings.is_empty() {
        QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        }
    } else {
        QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        }
    };
    channel
        .queue_declare(&subscription.queue, options, FieldTable::default())
        .await?;

    for binding in &subscription.bindings {
        channel
            .queue_bind(
                &subscription.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn subscribe(&self, subscription: &Subscription) -> Result<DeliveryStream, LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let (tx, rx) = mpsc::channel(usize::from(subscription.prefetch.max(1)));
        let registered = Registered {
            subscription: subscription.clone(),
            tx,
        };

        let mut subscriptions = self.inner.subscriptions.lock().await;
        {
            let guard = self.inner.session.read().await;
            let session = guard
                .as_ref()
                .ok_or_else(|| LinkError::Channel("not connected".to_string()))?;
            self.inner
                .start_consumer(session, &registered)
                .await
                .map_err(channel_error)?;
        }
        subscriptions.push(registered);
        info!(queue = %subscription.queue, prefetch = subscription.prefetch, "consuming");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle(id, TerminalAction::Ack).await
    }

    async fn requeue(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle(id, TerminalAction::Requeue).await
    }

    async fn reject(&self, id: DeliveryId) -> Result<(), LinkError> {
        self.settle(id, TerminalAction::Reject).await
    }

    async fn publish(&self, queue: &str, delivery: &Delivery) -> Result<(), LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let publish_error = |reason: String| LinkError::Publish {
            queue: queue.to_string(),
            reason,
        };

        let guard = self.inner.session.read().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| publish_error("not connected".to_string()))?;
        let confirm = session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &delivery.body,
                outbound_properties(delivery),
            )
            .await
            .map_err(|err| publish_error(err.to_string()))?;

        match confirm.await.map_err(|err| publish_error(err.to_string()))? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(publish_error("queue does not exist".to_string())),
            Confirmation::Nack(_) => Err(publish_error("broker refused message".to_string())),
        }
    }

    fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.healthy.store(false, Ordering::SeqCst);
        self.inner.closing.notify_one();

        let session = self.inner.session.write().await.take();
        // Dropping the senders ends every delivery stream.
        self.inner.subscriptions.lock().await.clear();
        if let Some(session) = session {
            session
                .connection
                .close(200, "shutdown")
                .await
                .map_err(channel_error)?;
        }
        info!("broker link closed");
        Ok(())
    }
}

fn channel_error(err: lapin::Error) -> LinkError {
    LinkError::Channel(err.to_string())
}

fn convert_delivery(epoch: u64, queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let short = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    let headers: Headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), header_value(value)))
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        id: DeliveryId::new(epoch, delivery.delivery_tag),
        queue: queue.to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        headers,
        properties: MessageProperties {
            content_type: short(properties.content_type()),
            content_encoding: short(properties.content_encoding()),
            correlation_id: short(properties.correlation_id()),
            message_id: short(properties.message_id()),
        },
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(v) => v.to_string(),
        AMQPValue::ShortShortInt(v) => v.to_string(),
        AMQPValue::ShortShortUInt(v) => v.to_string(),
        AMQPValue::ShortInt(v) => v.to_string(),
        AMQPValue::ShortUInt(v) => v.to_string(),
        AMQPValue::LongInt(v) => v.to_string(),
        AMQPValue::LongUInt(v) => v.to_string(),
        AMQPValue::LongLongInt(v) => v.to_string(),
        AMQPValue::Float(v) => v.to_string(),
        AMQPValue::Double(v) => v.to_string(),
        AMQPValue::Timestamp(v) => v.to_string(),
        AMQPValue::Void => String::new(),
        other => format!("{other:?}"),
    }
}

fn outbound_properties(delivery: &Delivery) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(2);
    let props = &delivery.properties;
    if let Some(value) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(value.clone()));
    }
    if let Some(value) = &props.content_encoding {
        properties = properties.with_content_encoding(ShortString::from(value.clone()));
    }
    if let Some(value) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &props.message_id {
        properties = properties.with_message_id(ShortString::from(value.clone()));
    }

    let mut headers = FieldTable::default();
    for (name, value) in &delivery.headers {
        headers.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    headers.insert(
        ShortString::from("x-amqp2http-source-queue"),
        AMQPValue::LongString(LongString::from(delivery.queue.clone())),
    );
    properties.with_headers(headers)
}
