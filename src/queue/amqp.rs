use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;

use super::{Acknowledge, Delivery, DurableQueue, QueueError, QueueName};

pub(super) const TOPIC_EXCHANGE: &str = "message_exchange";
const DEAD_LETTER_EXCHANGE: &str = "message_queue.dlx";
const DEAD_LETTER_QUEUE: &str = "message_queue.dead";

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// Declares every exchange, queue and binding the service uses. Safe to
/// repeat on a fresh channel.
async fn declare_topology(channel: &Channel) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Fanout,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(DEAD_LETTER_QUEUE, durable_queue(), FieldTable::default())
        .await?;
    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            DEAD_LETTER_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut dead_lettered = FieldTable::default();
    dead_lettered.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    channel
        .queue_declare(QueueName::Messages.as_str(), durable_queue(), dead_lettered)
        .await?;
    channel
        .queue_declare(
            QueueName::Notifications.as_str(),
            durable_queue(),
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            TOPIC_EXCHANGE,
            ExchangeKind::Topic,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;
    for queue in [QueueName::FileUploads, QueueName::MessageUpdates] {
        let (exchange, routing_key) = queue.route();
        channel
            .queue_declare(queue.as_str(), durable_queue(), FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue.as_str(),
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(())
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ-backed queue. Publishes are persistent and wait for the
/// broker's confirm; each consumer gets its own channel with a prefetch
/// window.
pub struct AmqpQueue {
    url: String,
    link: RwLock<Link>,
    prefetch: u16,
}

impl AmqpQueue {
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = Self::publisher_channel(&connection).await?;

        tracing::info!(prefetch, "amqp topology declared");
        Ok(Self {
            url: url.to_owned(),
            link: RwLock::new(Link { connection, channel }),
            prefetch,
        })
    }

    async fn publisher_channel(connection: &Connection) -> Result<Channel, lapin::Error> {
        let channel = connection.create_channel().await?;
        declare_topology(&channel).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(channel)
    }

    /// The shared publishing channel. A dropped connection is dialled again
    /// and a closed channel reopened before it is handed out.
    async fn get_channel(&self) -> Result<Channel, QueueError> {
        {
            let link = self.link.read().await;
            if link.connection.status().connected() && link.channel.status().connected() {
                return Ok(link.channel.clone());
            }
        }

        let mut link = self.link.write().await;
        if !link.connection.status().connected() {
            tracing::warn!("amqp connection lost, reconnecting");
            link.connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        }
        if !link.channel.status().connected() {
            tracing::warn!("amqp channel closed, reopening");
            link.channel = Self::publisher_channel(&link.connection).await?;
        }
        Ok(link.channel.clone())
    }
}

#[async_trait]
impl DurableQueue for AmqpQueue {
    async fn enqueue(&self, queue: QueueName, payload: &[u8]) -> Result<(), QueueError> {
        let (exchange, routing_key) = queue.route();
        let channel = self.get_channel().await?;

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::Refused(queue.as_str()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: QueueName,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError> {
        self.get_channel().await?;
        let channel = self.link.read().await.connection.create_channel().await?;
        declare_topology(&channel).await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue.as_str(),
                &format!("chatgate-{}", uuid::Uuid::now_v7()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = queue.as_str(), "amqp consumer started");
        let deliveries = consumer.map(move |delivery| {
            // The consumer's channel lives as long as its stream.
            let _ = &channel;
            let delivery = delivery?;
            Ok(Delivery::new(
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker(delivery.acker)),
            ))
        });

        Ok(deliveries.boxed())
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
