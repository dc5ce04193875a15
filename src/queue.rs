mod amqp;

pub use amqp::AmqpBroker;

use serde::Deserialize;
use thiserror::Error;

/// RabbitMQ queue flavour used for the work and dead-letter queues
///
/// Only quorum queues count redeliveries (`x-delivery-count`); a classic
/// queue merely flags a message as redelivered.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Classic,
    #[default]
    Quorum,
}

/// One message handed to a consumer, waiting for a [`Disposition`]
///
/// A delivery is consumed by [`Consumer::settle`], so it can be acknowledged
/// or rejected once and only once.
#[derive(Debug)]
pub struct Delivery {
    tag: u64,
    body: Vec<u8>,
    attempt: u32,
}

impl Delivery {
    pub fn new(tag: u64, body: Vec<u8>, attempt: u32) -> Self {
        Self { tag, body, attempt }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// How many times this message was delivered before, as far as the broker knows
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What to tell the broker about a delivery once processing is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove it from the queue
    Ack,
    /// Failed for a reason that may go away; hand it to any consumer again
    Requeue,
    /// Can never succeed; drop it
    Reject,
    /// Can never succeed; park it on the dead-letter queue
    DeadLetter,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("delivery stream closed by broker")]
    Closed,
    #[error("delivery {0} is not outstanding on this consumer")]
    UnknownDelivery(u64),
    #[error("no dead-letter queue is configured")]
    NoDeadLetterQueue,
    #[error("dead-letter queue {queue} did not confirm the message: {reason}")]
    Unconfirmed { queue: String, reason: &'static str },
}

/// Source of consumers bound to the work queue
///
/// Every call opens an independent channel, so one broken consumer never
/// affects its siblings.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Opens a consumer that holds at most one unsettled delivery at a time
    async fn open_consumer(&self, worker_id: usize) -> Result<Box<dyn Consumer>, QueueError>;
}

#[async_trait::async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery; `None` once the broker has closed the stream
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>>;

    async fn settle(&mut self, delivery: Delivery, disposition: Disposition) -> Result<(), QueueError>;

    /// Releases the channel; unsettled deliveries go back to the queue
    async fn close(self: Box<Self>);
}
