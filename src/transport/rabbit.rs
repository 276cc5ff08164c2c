use std::collections::HashMap;
use std::time::Duration;

use amqprs::channel::{
    BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, ConsumerMessage,
    QueuePurgeArguments,
};
use amqprs::BasicProperties;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use queue_models::ControlEvent;
use tokio::sync::{mpsc, Mutex};

use crate::helpers::rabbit::{self, ConfigureRabbit, RabbitHandle};

use super::{EventStream, Queue, Transport};

const PERSISTENT: u8 = 2;

/// [Transport] on top of RabbitMQ. Queues are published to through the default exchange, events
/// go through a fanout exchange that every subscriber binds a private queue to.
pub struct RabbitTransport {
    handle: RabbitHandle,
    params: rabbit::Params,
    publish_lock: Mutex<()>,
    consumers: Mutex<HashMap<Queue, Consumer>>,
}

struct Consumer {
    handle: RabbitHandle,
    rx: mpsc::UnboundedReceiver<ConsumerMessage>,
}

impl RabbitTransport {
    pub async fn connect(params: &rabbit::Params, conn_name: &str) -> Result<Self> {
        let handle = RabbitHandle::connect(&params.amqp_uri, conn_name).await?;
        ConfigureRabbit::new(&handle)
            .declare_queue(&params.task_queue)
            .await?
            .declare_queue(&params.result_queue)
            .await?
            .declare_exchange(&params.events_exchange, "fanout")
            .await?;
        Ok(RabbitTransport {
            handle,
            params: params.clone(),
            publish_lock: Mutex::new(()),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    fn queue_name(&self, queue: Queue) -> &str {
        match queue {
            Queue::Tasks => &self.params.task_queue,
            Queue::Results => &self.params.result_queue,
        }
    }

    async fn start_consumer(&self, queue: Queue) -> Result<Consumer> {
        let handle = self.handle.fork().await?;
        handle.limit_prefetch(1).await?;
        let name = self.queue_name(queue);
        let (tag, rx) = handle
            .chan()
            .basic_consume_rx(BasicConsumeArguments::new(name, ""))
            .await
            .with_context(|| format!("while starting consumer on {}", name))?;
        debug!("Consuming from {} as {}", name, tag);
        Ok(Consumer { handle, rx })
    }
}

impl Consumer {
    async fn ack(&self, msg: &ConsumerMessage) -> Result<()> {
        if let Some(deliver) = &msg.deliver {
            self.handle
                .chan()
                .basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false))
                .await
                .context("while acknowledging delivery")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RabbitTransport {
    async fn push(&self, queue: Queue, payload: Vec<u8>) -> Result<()> {
        let props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .finish();
        let args = BasicPublishArguments::new("", self.queue_name(queue));
        let _guard = self.publish_lock.lock().await;
        self.handle
            .chan()
            .basic_publish(props, payload, args)
            .await
            .with_context(|| format!("while publishing to {}", self.queue_name(queue)))
    }

    async fn blocking_pop(&self, queue: Queue, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut consumers = self.consumers.lock().await;
        if !consumers.contains_key(&queue) {
            let consumer = self.start_consumer(queue).await?;
            consumers.insert(queue, consumer);
        }
        let consumer = consumers
            .get_mut(&queue)
            .ok_or_else(|| anyhow!("consumer vanished"))?;
        match tokio::time::timeout(timeout, consumer.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => {
                consumer.ack(&msg).await?;
                Ok(msg.content)
            }
            Ok(None) => {
                consumers.remove(&queue);
                bail!("broker closed the consumer on {}", self.queue_name(queue))
            }
        }
    }

    async fn length(&self, queue: Queue) -> Result<u32> {
        self.handle.ready_count(self.queue_name(queue)).await
    }

    async fn drain(&self, queue: Queue) -> Result<u32> {
        let name = self.queue_name(queue);
        let purged = self
            .handle
            .chan()
            .queue_purge(QueuePurgeArguments::new(name))
            .await
            .with_context(|| format!("while purging {}", name))?
            .unwrap_or(0);
        // deliveries already prefetched to us are not purged by the broker
        let mut local = 0;
        if let Some(consumer) = self.consumers.lock().await.get_mut(&queue) {
            while let Ok(msg) = consumer.rx.try_recv() {
                consumer.ack(&msg).await?;
                local += 1;
            }
        }
        Ok(purged + local)
    }

    async fn publish(&self, event: ControlEvent) -> Result<()> {
        let args = BasicPublishArguments::new(&self.params.events_exchange, "");
        let _guard = self.publish_lock.lock().await;
        self.handle
            .chan()
            .basic_publish(BasicProperties::default(), event.to_bytes(), args)
            .await
            .with_context(|| format!("while publishing {} event", event))
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let handle = self.handle.fork().await?;
        let configure = ConfigureRabbit::new(&handle);
        let queue_name = configure.declare_private_queue().await?;
        configure
            .bind_queue_to(&queue_name, &self.params.events_exchange)
            .await?;
        let consume_args = BasicConsumeArguments::new(&queue_name, "")
            .manual_ack(false)
            .finish();
        let (_, mut rabbit_rx) = handle
            .chan()
            .basic_consume_rx(consume_args)
            .await
            .context("while subscribing to events")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // handle moves in here so the channel stays open as long as someone listens
            let _handle = handle;
            while let Some(msg) = rabbit_rx.recv().await {
                let raw = msg.content.unwrap_or_default();
                match ControlEvent::from_bytes(&raw) {
                    Some(event) => {
                        trace!("Received event {}", event);
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    None => warn!("Ignoring unknown event {:?}", String::from_utf8_lossy(&raw)),
                }
            }
            debug!("Event subscription on {} ended", queue_name);
        });
        Ok(rx)
    }
}
