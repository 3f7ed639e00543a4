//! AMQP transport: queue topology, the consume loop and reply publishing.

use aether_core::{CommandKind, DeliveryClass};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

use crate::error::BrokerError;
use crate::router::{CommandHandler, Delivery, ReplySink, Router};

/// Direct exchange every command is published to, keyed by command name.
pub const EXCHANGE: &str = "computing";

/// Shared queue for commands any single instance may take.
pub const COMPETING_QUEUE: &str = "computing-competing";

const CONTENT_TYPE: &str = "application/json";

/// Deliveries the broker pushes to a consumer ahead of their ack.
pub const PREFETCH_COUNT: u16 = 1;

/// Routing keys bound to the queue of `class`.
#[must_use]
pub fn routing_keys(class: DeliveryClass) -> Vec<&'static str> {
    CommandKind::ALL
        .into_iter()
        .filter(|kind| kind.delivery() == class)
        .map(CommandKind::name)
        .collect()
}

struct AmqpDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn reply_to(&self) -> Option<&str> {
        self.0.properties.reply_to().as_ref().map(lapin::types::ShortString::as_str)
    }

    fn correlation_id(&self) -> Option<&str> {
        self.0
            .properties
            .correlation_id()
            .as_ref()
            .map(lapin::types::ShortString::as_str)
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

/// Publishes replies on the default exchange.
pub struct ChannelSink {
    channel: Channel,
}

#[async_trait]
impl ReplySink for ChannelSink {
    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if let Some(id) = correlation_id {
            properties = properties.with_correlation_id(id.into());
        }
        self.channel
            .basic_publish("", reply_to, BasicPublishOptions::default(), &body, properties)
            .await?
            .await?;
        Ok(())
    }
}

/// A connected instance with both queues declared and consumed.
pub struct AmqpServer {
    // Kept so the connection outlives the consumers.
    _connection: Connection,
    sink: ChannelSink,
    broadcast: Consumer,
    competing: Consumer,
}

impl AmqpServer {
    /// Connect and declare the exchange, this instance's exclusive queue and
    /// the shared competing queue.
    ///
    /// # Errors
    /// Returns [`BrokerError::Bus`] if the broker is unreachable or rejects
    /// a declaration.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;
        tracing::info!("connected to message bus");

        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let exclusive = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let exclusive_name = exclusive.name().as_str().to_owned();
        bind(&channel, &exclusive_name, DeliveryClass::Broadcast).await?;

        channel
            .queue_declare(
                COMPETING_QUEUE,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        bind(&channel, COMPETING_QUEUE, DeliveryClass::Competing).await?;

        let broadcast = channel
            .basic_consume(
                &exclusive_name,
                "aether-broadcast",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let competing = channel
            .basic_consume(
                COMPETING_QUEUE,
                "aether-competing",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(queue = %exclusive_name, "consuming broadcast commands");

        Ok(Self {
            _connection: connection,
            sink: ChannelSink { channel },
            broadcast,
            competing,
        })
    }

    /// Handle deliveries one at a time until a shutdown signal arrives or
    /// a consumer ends.
    ///
    /// # Errors
    /// Returns [`BrokerError::Bus`] if a consumer fails.
    pub async fn run<H: CommandHandler>(mut self, router: &Router<H>) -> Result<(), BrokerError> {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return Ok(());
                }
                d = self.broadcast.next() => d,
                d = self.competing.next() => d,
            };
            let Some(delivery) = next else {
                tracing::warn!("consumer cancelled by the broker");
                return Ok(());
            };
            let delivery = AmqpDelivery(delivery?);
            if let Err(e) = router.dispatch(&delivery, &self.sink).await {
                tracing::error!(error = %e, "could not complete delivery");
            }
        }
    }
}

async fn bind(channel: &Channel, queue: &str, class: DeliveryClass) -> Result<(), BrokerError> {
    for key in routing_keys(class) {
        channel
            .queue_bind(
                queue,
                EXCHANGE,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
