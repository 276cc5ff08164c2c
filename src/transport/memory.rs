use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use queue_models::ControlEvent;
use tokio::sync::{mpsc, Notify};

use super::{EventStream, Queue, Transport};

/// In-process [Transport], used by tests and for running everything in a single process.
#[derive(Default)]
pub struct MemoryTransport {
    tasks: Slot,
    results: Slot,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ControlEvent>>>,
    published: Mutex<Vec<ControlEvent>>,
    broken: AtomicBool,
}

#[derive(Default)]
struct Slot {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Slot {
    fn take(&self) -> Option<Vec<u8>> {
        self.items.lock().ok()?.pop_front()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, queue: Queue) -> &Slot {
        match queue {
            Queue::Tasks => &self.tasks,
            Queue::Results => &self.results,
        }
    }

    /// While broken, every queue operation and every publish fails as if the broker were gone.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn check_broken(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("transport is broken");
        }
        Ok(())
    }

    /// Every event published so far, oldest first.
    pub fn published(&self) -> Vec<ControlEvent> {
        self.published
            .lock()
            .map(|it| it.clone())
            .unwrap_or_default()
    }

    /// Snapshot of what is waiting in the queue, without consuming it.
    pub fn peek_all(&self, queue: Queue) -> Vec<Vec<u8>> {
        self.slot(queue)
            .items
            .lock()
            .map(|it| it.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn push(&self, queue: Queue, payload: Vec<u8>) -> Result<()> {
        self.check_broken()?;
        let slot = self.slot(queue);
        match slot.items.lock() {
            Ok(mut items) => items.push_back(payload),
            Err(_) => bail!("queue lock poisoned"),
        }
        slot.notify.notify_one();
        Ok(())
    }

    async fn blocking_pop(&self, queue: Queue, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.check_broken()?;
        let slot = self.slot(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            // registered before checking, so a push in between is not lost
            notified.as_mut().enable();
            if let Some(item) = slot.take() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(slot.take());
            }
        }
    }

    async fn length(&self, queue: Queue) -> Result<u32> {
        self.check_broken()?;
        match self.slot(queue).items.lock() {
            Ok(items) => Ok(items.len() as u32),
            Err(_) => bail!("queue lock poisoned"),
        }
    }

    async fn drain(&self, queue: Queue) -> Result<u32> {
        self.check_broken()?;
        match self.slot(queue).items.lock() {
            Ok(mut items) => {
                let count = items.len() as u32;
                items.clear();
                Ok(count)
            }
            Err(_) => bail!("queue lock poisoned"),
        }
    }

    async fn publish(&self, event: ControlEvent) -> Result<()> {
        self.check_broken()?;
        if let Ok(mut published) = self.published.lock() {
            published.push(event);
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => bail!("subscriber lock poisoned"),
        }
        Ok(rx)
    }
}
