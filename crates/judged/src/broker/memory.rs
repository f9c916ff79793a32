//! In-process broker

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryTag};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Message>,
    unacked: HashMap<DeliveryTag, Message>,
    prefetch: u32,
    next_tag: DeliveryTag,
    closed: bool,
    published: Vec<Vec<u8>>,
    acked: Vec<Vec<u8>>,
    dead: Vec<Vec<u8>>,
    max_unacked: usize,
}

impl State {
    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }

    fn drained(&self) -> bool {
        self.closed && self.queue.is_empty() && self.unacked.is_empty()
    }
}

/// Queue held in memory, with prefetch credit and dead-lettering
///
/// After [`close`](Self::close), consumers receive `None` once every message
/// has been settled without being requeued.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    max_deliveries: u32,
}

impl MemoryBroker {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            max_deliveries: max_deliveries.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a task payload
    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.state().queue.push_back(Message {
            payload: payload.into(),
            deliveries: 0,
        });
        self.notify.notify_waiters();
    }

    /// Stop accepting new work; consumers finish once everything is settled
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    /// Result payloads published so far
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state().published.clone()
    }

    /// Task payloads that were acknowledged
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.state().acked.clone()
    }

    /// Task payloads that were dead-lettered
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state().dead.clone()
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    /// Deliveries not yet settled
    pub fn in_flight(&self) -> usize {
        self.state().unacked.len()
    }

    /// Highest number of simultaneously unsettled deliveries observed
    pub fn max_in_flight(&self) -> usize {
        self.state().max_unacked
    }

    fn settle(&self, tag: DeliveryTag) -> Result<Message, BrokerError> {
        self.state()
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn set_prefetch(&self, count: u32) -> Result<(), BrokerError> {
        self.state().prefetch = count;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.drained() {
                    return Ok(None);
                }
                if state.has_credit()
                    && let Some(mut message) = state.queue.pop_front()
                {
                    message.deliveries += 1;
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        payload: message.payload.clone(),
                        attempt: message.deliveries,
                    };
                    state.unacked.insert(tag, message);
                    state.max_unacked = state.max_unacked.max(state.unacked.len());
                    return Ok(Some(delivery));
                }
            }

            notified.await;
        }
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.state().published.push(payload);
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let message = self.settle(tag)?;
        self.state().acked.push(message.payload);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let message = self.settle(tag)?;
        {
            let mut state = self.state();
            if requeue && message.deliveries < self.max_deliveries {
                debug!(tag, deliveries = message.deliveries, "requeued message");
                state.queue.push_back(message);
            } else {
                warn!(tag, deliveries = message.deliveries, "dead-lettered message");
                state.dead.push(message.payload);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
