use std::sync::Arc;

use amqprs::channel::{
    BasicQosArguments, Channel, ExchangeDeclareArguments, QueueBindArguments,
    QueueDeclareArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use anyhow::*;
use chrono::Local;
use log::debug;

pub struct RabbitHandle {
    connection: Arc<Connection>,
    channel: Channel,
}

impl RabbitHandle {
    pub async fn connect(amqp_uri: &str, conn_name: &str) -> Result<Self> {
        let mut connection_args = OpenConnectionArguments::try_from(amqp_uri)
            .with_context(|| format!("Invalid connection URI in {:?}", amqp_uri))?;
        connection_args.connection_name(&format!("{}@{}", conn_name, Local::now()));
        let connection = Connection::open(&connection_args)
            .await
            .with_context(|| format!("while opening RabbitMQ connection {:?}", amqp_uri))
            .context("Maybe double-check credentials?")?;
        let channel = Self::create_channel(&connection).await?;
        Ok(RabbitHandle {
            connection: Arc::new(connection),
            channel,
        })
    }

    async fn create_channel(conn: &Connection) -> Result<Channel> {
        let channel = conn
            .open_channel(None)
            .await
            .context("while opening RabbitMQ channel")?;
        debug!("Fresh RabbitMQ channel connected.");
        Ok(channel)
    }

    pub fn chan(&self) -> &Channel {
        &self.channel
    }

    /// Creates a new handle on the same connection but with a fresh channel.
    /// Each consumer gets its own channel so that prefetch limits and acks stay separate.
    pub async fn fork(&self) -> Result<RabbitHandle> {
        let channel = Self::create_channel(&self.connection).await?;
        Ok(RabbitHandle {
            connection: self.connection.clone(),
            channel,
        })
    }

    /// Limits unacknowledged deliveries on this channel, so that idle consumers don't hoard messages.
    pub async fn limit_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, count, false))
            .await
            .with_context(|| format!("while setting prefetch to {}", count))
    }

    /// Number of messages ready for delivery in the given (existing) queue.
    pub async fn ready_count(&self, queue_name: &str) -> Result<u32> {
        let args = QueueDeclareArguments::new(queue_name).passive(true).finish();
        let (_, message_count, _) = self
            .channel
            .queue_declare(args)
            .await
            .with_context(|| format!("while inspecting queue {}", queue_name))?
            .ok_or_else(|| anyhow!("passive declare of {} returned nothing", queue_name))?;
        Ok(message_count)
    }
}

pub struct ConfigureRabbit<'han> {
    handle: &'han RabbitHandle,
}

impl<'han> ConfigureRabbit<'han> {
    pub fn new(handle: &'han RabbitHandle) -> Self {
        ConfigureRabbit { handle }
    }

    fn chan(&self) -> &Channel {
        self.handle.chan()
    }

    pub async fn declare_queue(&self, name: &str) -> Result<&ConfigureRabbit> {
        let args = QueueDeclareArguments::new(name).durable(true).finish();
        self.chan()
            .queue_declare(args)
            .await
            .with_context(|| format!("while declaring queue {}", name))?;
        Ok(self)
    }

    /// Declares a server-named queue that is deleted when this channel goes away.
    pub async fn declare_private_queue(&self) -> Result<String> {
        let args = QueueDeclareArguments::new("")
            .exclusive(true)
            .auto_delete(true)
            .finish();
        let (name, _, _) = self
            .chan()
            .queue_declare(args)
            .await
            .context("while declaring private queue")?
            .ok_or_else(|| anyhow!("server did not name the private queue"))?;
        Ok(name)
    }

    pub async fn declare_exchange(&self, name: &str, typ: &str) -> Result<&ConfigureRabbit> {
        let args = ExchangeDeclareArguments::new(name, typ)
            .durable(true)
            .finish();
        self.chan()
            .exchange_declare(args)
            .await
            .with_context(|| format!("while declaring exchange {}", name))?;
        Ok(self)
    }

    pub async fn bind_queue_to(
        &self,
        queue_name: &str,
        exchange_name: &str,
    ) -> Result<&ConfigureRabbit> {
        self.chan()
            .queue_bind(QueueBindArguments::new(queue_name, exchange_name, ""))
            .await
            .with_context(|| format!("while binding {}->{}", queue_name, exchange_name))?;
        Ok(self)
    }
}
