//! Queue and event plumbing shared by the round keeper and the probe buddies.
//!
//! Two durable FIFO queues carry encoded tasks and results, while a broadcast channel carries
//! [ControlEvent]s to every subscriber. Payloads are opaque bytes here; see `queue_models::codec`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use queue_models::ControlEvent;
use tokio::sync::mpsc;

pub use memory::MemoryTransport;
pub use rabbit::RabbitTransport;

mod memory;
mod rabbit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Tasks,
    Results,
}

pub type EventStream = mpsc::UnboundedReceiver<ControlEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Appends to the tail of the queue.
    async fn push(&self, queue: Queue, payload: Vec<u8>) -> Result<()>;

    /// Removes from the head of the queue, waiting at most `timeout` for something to arrive.
    async fn blocking_pop(&self, queue: Queue, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Number of messages waiting in the queue.
    async fn length(&self, queue: Queue) -> Result<u32>;

    /// Drops everything waiting in the queue, returning how many messages were dropped.
    async fn drain(&self, queue: Queue) -> Result<u32>;

    async fn publish(&self, event: ControlEvent) -> Result<()>;

    /// Events published after this call are delivered to the returned stream.
    async fn subscribe(&self) -> Result<EventStream>;

    async fn drain_all(&self) -> Result<u32> {
        Ok(self.drain(Queue::Tasks).await? + self.drain(Queue::Results).await?)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn push(&self, queue: Queue, payload: Vec<u8>) -> Result<()> {
        (**self).push(queue, payload).await
    }

    async fn blocking_pop(&self, queue: Queue, timeout: Duration) -> Result<Option<Vec<u8>>> {
        (**self).blocking_pop(queue, timeout).await
    }

    async fn length(&self, queue: Queue) -> Result<u32> {
        (**self).length(queue).await
    }

    async fn drain(&self, queue: Queue) -> Result<u32> {
        (**self).drain(queue).await
    }

    async fn publish(&self, event: ControlEvent) -> Result<()> {
        (**self).publish(event).await
    }

    async fn subscribe(&self) -> Result<EventStream> {
        (**self).subscribe().await
    }
}
