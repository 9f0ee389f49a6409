//! RabbitMQ implementation of the broker seam, built on `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*, types::FieldTable, uri::AMQPUri, BasicProperties, Channel, Connection,
    ConnectionProperties,
};
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent, Connector, Delivery,
    DeliveryStream, EventHandler, ExchangeKind, MessageProperties, QueueSpec,
};

/// Opens `lapin` connections to a single RabbitMQ endpoint
#[derive(Clone)]
pub struct AmqpConnector {
    uri: AMQPUri,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(uri: AMQPUri, connection_name: impl Into<String>) -> Self {
        Self {
            uri,
            connection_name: connection_name.into(),
        }
    }
}

impl std::fmt::Debug for AmqpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnector")
            .field("endpoint", &self.endpoint())
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn endpoint(&self) -> String {
        format!(
            "amqp://{}:{}/{}",
            self.uri.authority.host,
            self.uri.authority.port,
            self.uri.vhost.trim_start_matches('/')
        )
    }

    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        debug!(endpoint = %self.endpoint(), "Opening AMQP connection");
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect_uri(self.uri.clone(), properties)
            .await
            .map_err(classify_connect_error)?;
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

/// Authentication refusals are fatal, everything else at connect time is treated as network-class
fn classify_connect_error(err: lapin::Error) -> BrokerError {
    let text = err.to_string();
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("access_refused") || lowered.contains("access refused") || lowered.contains("authentication") {
        BrokerError::Authentication(text)
    } else {
        BrokerError::Unreachable(text)
    }
}

fn channel_error(err: lapin::Error) -> BrokerError {
    BrokerError::Channel(err.to_string())
}

pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    /// lapin only reports connection errors; they are forwarded as shutdown events
    fn set_event_handler(&self, handler: EventHandler) {
        self.connection
            .on_error(move |err| handler(ConnectionEvent::Shutdown(err.to_string())));
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(|err| {
            if self.is_open() {
                channel_error(err)
            } else {
                BrokerError::Closed(err.to_string())
            }
        })?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|err| BrokerError::Closed(err.to_string()))
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(id) = &properties.correlation_id {
        basic = basic.with_correlation_id(id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = MessageProperties {
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_owned()),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_owned()),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        Ok(consumer
            .map(|item| item.map(from_lapin_delivery).map_err(channel_error))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> BrokerResult<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(200, "OK")
            .await
            .map_err(channel_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_map_onto_basic_properties() {
        let properties = MessageProperties::default()
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1")
            .with_content_type("application/json");
        let basic = to_basic_properties(&properties);

        assert_eq!(basic.correlation_id().as_ref().map(|s| s.as_str()), Some("abc"));
        assert_eq!(basic.reply_to().as_ref().map(|s| s.as_str()), Some("amq.gen-1"));
        assert_eq!(
            basic.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert!(to_basic_properties(&MessageProperties::default()).correlation_id().is_none());
    }

    #[test]
    fn endpoint_hides_credentials() {
        let mut uri = AMQPUri::default();
        uri.authority.userinfo.password = "secret".into();
        let connector = AmqpConnector::new(uri, "test");
        assert!(!connector.endpoint().contains("secret"));
    }
}
