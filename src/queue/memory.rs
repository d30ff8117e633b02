use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::{Acknowledge, Delivery, DurableQueue, QueueError, QueueName};

struct Pending {
    data: Vec<u8>,
    redelivered: bool,
}

struct Lane {
    tx: mpsc::UnboundedSender<Pending>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Pending>>>,
}

type DeadLetters = Arc<Mutex<Vec<(QueueName, Vec<u8>)>>>;

/// Process-local queue with broker-like settlement: unsettled deliveries
/// that are dropped come back redelivered, rejected ones are dead-lettered.
#[derive(Clone)]
pub struct MemoryQueue {
    lanes: Arc<HashMap<QueueName, Lane>>,
    dead: DeadLetters,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let lanes = QueueName::ALL
            .into_iter()
            .map(|name| {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    name,
                    Lane {
                        tx,
                        rx: Arc::new(Mutex::new(rx)),
                    },
                )
            })
            .collect();

        Self {
            lanes: Arc::new(lanes),
            dead: Arc::default(),
        }
    }

    fn lane(&self, queue: QueueName) -> Result<&Lane, QueueError> {
        self.lanes.get(&queue).ok_or(QueueError::Closed(queue.as_str()))
    }

    /// Payloads rejected from `queue` without requeue.
    pub async fn dead_letters(&self, queue: QueueName) -> Vec<Vec<u8>> {
        self.dead
            .lock()
            .await
            .iter()
            .filter(|(name, _)| *name == queue)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, queue: QueueName, payload: &[u8]) -> Result<(), QueueError> {
        self.lane(queue)?
            .tx
            .send(Pending {
                data: payload.to_vec(),
                redelivered: false,
            })
            .map_err(|_| QueueError::Closed(queue.as_str()))
    }

    async fn consume(
        &self,
        queue: QueueName,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError> {
        let lane = self.lane(queue)?;
        let rx = lane.rx.clone();
        let tx = lane.tx.clone();
        let dead = self.dead.clone();

        let deliveries = futures_util::stream::unfold(rx, move |rx| {
            let tx = tx.clone();
            let dead = dead.clone();
            async move {
                let pending = rx.lock().await.recv().await?;
                let acker = MemoryAcker {
                    queue,
                    data: pending.data.clone(),
                    tx,
                    dead,
                    settled: AtomicBool::new(false),
                };
                let delivery = Delivery::new(pending.data, pending.redelivered, Box::new(acker));
                Some((Ok(delivery), rx))
            }
        });

        Ok(deliveries.boxed())
    }
}

struct MemoryAcker {
    queue: QueueName,
    data: Vec<u8>,
    tx: mpsc::UnboundedSender<Pending>,
    dead: DeadLetters,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Closed(self.queue.as_str()));
        }
        Ok(())
    }

    fn requeue(&self) -> Result<(), QueueError> {
        self.tx
            .send(Pending {
                data: self.data.clone(),
                redelivered: true,
            })
            .map_err(|_| QueueError::Closed(self.queue.as_str()))
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle()
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.settle()?;
        if requeue {
            self.requeue()
        } else {
            self.dead.lock().await.push((self.queue, self.data.clone()));
            Ok(())
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            let _ = self.requeue();
        }
    }
}
