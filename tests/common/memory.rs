use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use evaluator::queue::{Broker, Consumer, Delivery, Disposition, QueueError};

/// Record of one delivery being settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub tag: u64,
    pub worker_id: usize,
    pub body: Vec<u8>,
    pub disposition: Disposition,
}

/// In-process broker with the delivery semantics of a prefetch-1 AMQP queue
///
/// Messages are handed out one per consumer at a time, requeued messages go
/// back to the head of the queue, and anything a consumer still holds when it
/// goes away is redelivered. Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, InFlight>,
    next_tag: u64,
    next_consumer: u64,
    opened: usize,
    failing_opens: u32,
    overlapping_requests: usize,
    settlements: Vec<Settlement>,
    dead_letters: Vec<Vec<u8>>,
    closed: bool,
}

struct Message {
    body: Vec<u8>,
    deliveries: u32,
}

struct InFlight {
    consumer: u64,
    message: Message,
}

impl State {
    fn held_by(&self, consumer: u64) -> usize {
        self.in_flight
            .values()
            .filter(|f| f.consumer == consumer)
            .count()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.shared.state.lock().ready.push_back(Message {
            body: body.into(),
            deliveries: 0,
        });
        self.shared.notify.notify_waiters();
    }

    /// Makes the next `count` calls to `open_consumer` fail
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.state.lock().failing_opens = count;
    }

    /// Ends every delivery stream and refuses new consumers
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting to be delivered
    pub fn ready(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    /// Messages delivered but not yet settled
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    pub fn opened(&self) -> usize {
        self.shared.state.lock().opened
    }

    /// Times a consumer asked for more work while still holding a delivery
    pub fn overlapping_requests(&self) -> usize {
        self.shared.state.lock().overlapping_requests
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.state.lock().settlements.clone()
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().dead_letters.clone()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn open_consumer(&self, worker_id: usize) -> Result<Box<dyn Consumer>, QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Unavailable("broker is closed".to_string()));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(QueueError::Unavailable("channel refused".to_string()));
        }

        state.opened += 1;
        state.next_consumer += 1;

        Ok(Box::new(MemoryConsumer {
            id: state.next_consumer,
            worker_id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryConsumer {
    id: u64,
    worker_id: usize,
    shared: Arc<Shared>,
}

impl MemoryConsumer {
    /// Puts everything this consumer still holds back at the head of the queue
    fn release(&self) {
        let mut state = self.shared.state.lock();
        let held: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.consumer == self.id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in held {
            if let Some(in_flight) = state.in_flight.remove(&tag) {
                state.ready.push_front(in_flight.message);
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        let mut counted_overlap = false;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return None;
                }

                if state.held_by(self.id) > 0 {
                    if !counted_overlap {
                        state.overlapping_requests += 1;
                        counted_overlap = true;
                    }
                } else if let Some(message) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery::new(tag, message.body.clone(), message.deliveries);

                    state.in_flight.insert(
                        tag,
                        InFlight {
                            consumer: self.id,
                            message: Message {
                                body: message.body,
                                deliveries: message.deliveries + 1,
                            },
                        },
                    );
                    return Some(Ok(delivery));
                }
            }

            notified.await;
        }
    }

    async fn settle(&mut self, delivery: Delivery, disposition: Disposition) -> Result<(), QueueError> {
        let tag = delivery.tag();
        let mut state = self.shared.state.lock();

        let owned = state
            .in_flight
            .get(&tag)
            .is_some_and(|f| f.consumer == self.id);
        let Some(in_flight) = owned.then(|| state.in_flight.remove(&tag)).flatten() else {
            return Err(QueueError::UnknownDelivery(tag));
        };

        state.settlements.push(Settlement {
            tag,
            worker_id: self.worker_id,
            body: in_flight.message.body.clone(),
            disposition,
        });

        match disposition {
            Disposition::Ack | Disposition::Reject => {}
            Disposition::Requeue => state.ready.push_front(in_flight.message),
            Disposition::DeadLetter => state.dead_letters.push(in_flight.message.body),
        }

        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(self: Box<Self>) {
        // Drop releases whatever is still held
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}
