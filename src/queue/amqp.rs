use futures_util::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::{Broker, Consumer, Delivery, Disposition, QueueError, QueueType};

/// Header quorum queues use to count earlier delivery attempts
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";
const PERSISTENT: u8 = 2;

/// RabbitMQ-backed broker
///
/// Owns a single connection; each consumer gets a dedicated channel on it.
pub struct AmqpBroker {
    connection: Connection,
    queue_name: String,
    queue_type: QueueType,
    dead_letter_queue: Option<String>,
}

impl AmqpBroker {
    pub async fn connect(
        url: &str,
        queue_name: impl Into<String>,
        queue_type: QueueType,
        dead_letter_queue: Option<String>,
    ) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        log::info!("Connected to broker");

        Ok(Self {
            connection,
            queue_name: queue_name.into(),
            queue_type,
            dead_letter_queue,
        })
    }

    /// Durable, shared and persistent, so every loop and replica converges on it
    async fn declare(&self, channel: &Channel, name: &str) -> Result<(), QueueError> {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            ..Default::default()
        };
        channel
            .queue_declare(name, options, queue_arguments(self.queue_type))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn open_consumer(&self, worker_id: usize) -> Result<Box<dyn Consumer>, QueueError> {
        let channel = self.connection.create_channel().await?;

        self.declare(&channel, &self.queue_name).await?;
        if let Some(dead_letter_queue) = &self.dead_letter_queue {
            self.declare(&channel, dead_letter_queue).await?;
            // Dead-lettered originals are acked only once the copy is confirmed
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &format!("evaluator-worker-{worker_id}"),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(AmqpConsumer {
            channel,
            consumer,
            dead_letter_queue: self.dead_letter_queue.clone(),
        }))
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    dead_letter_queue: Option<String>,
}

impl AmqpConsumer {
    async fn publish_dead_letter(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..Default::default()
        };
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                options,
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;

        confirmed(queue, confirmation)
    }
}

#[async_trait::async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|d| {
                    let attempt = attempt_from(&d.properties, d.redelivered);
                    Delivery::new(d.delivery_tag, d.data, attempt)
                })
                .map_err(QueueError::from),
        )
    }

    async fn settle(&mut self, delivery: Delivery, disposition: Disposition) -> Result<(), QueueError> {
        let tag = delivery.tag();

        match action_for(disposition, self.dead_letter_queue.as_deref())? {
            Action::Ack => {
                self.channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await?
            }
            Action::Nack { requeue } => {
                let options = BasicNackOptions {
                    multiple: false,
                    requeue,
                };
                self.channel.basic_nack(tag, options).await?
            }
            Action::Reject { requeue } => {
                let options = BasicRejectOptions { requeue };
                self.channel.basic_reject(tag, options).await?
            }
            Action::Republish { queue } => {
                self.publish_dead_letter(queue, delivery.body()).await?;
                self.channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await?
            }
        }

        Ok(())
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.channel.close(200, "consumer stopped").await {
            log::debug!("Closing channel failed: {e}");
        }
    }
}

/// Protocol call that carries out a disposition
#[derive(Debug, PartialEq, Eq)]
enum Action<'a> {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
    /// Publish a copy to `queue`, then ack the original
    Republish { queue: &'a str },
}

fn action_for(
    disposition: Disposition,
    dead_letter_queue: Option<&str>,
) -> Result<Action<'_>, QueueError> {
    match disposition {
        Disposition::Ack => Ok(Action::Ack),
        Disposition::Requeue => Ok(Action::Nack { requeue: true }),
        Disposition::Reject => Ok(Action::Reject { requeue: false }),
        Disposition::DeadLetter => dead_letter_queue
            .map(|queue| Action::Republish { queue })
            .ok_or(QueueError::NoDeadLetterQueue),
    }
}

fn queue_arguments(queue_type: QueueType) -> FieldTable {
    let mut arguments = FieldTable::default();
    if queue_type == QueueType::Quorum {
        arguments.insert(
            QUEUE_TYPE_ARGUMENT.into(),
            AMQPValue::LongString("quorum".into()),
        );
    }
    arguments
}

/// Earlier delivery attempts of a message
///
/// Exact when the broker sets `x-delivery-count`; otherwise all that is known
/// is whether the message was delivered before.
fn attempt_from(properties: &BasicProperties, redelivered: bool) -> u32 {
    let counted = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| match value {
                AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
                AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
                AMQPValue::LongUInt(n) => Some(*n),
                _ => None,
            })
    });

    counted.unwrap_or(u32::from(redelivered))
}

fn confirmed(queue: &str, confirmation: Confirmation) -> Result<(), QueueError> {
    let reason = match confirmation {
        Confirmation::Ack(None) => return Ok(()),
        Confirmation::Ack(Some(_)) => "message was returned as unroutable",
        Confirmation::Nack(_) => "broker nacked the message",
        Confirmation::NotRequested => "channel is not in confirm mode",
    };
    Err(QueueError::Unconfirmed {
        queue: queue.to_string(),
        reason,
    })
}
