use crate::wire::Content;
use crate::{AmqpProperties, Channel, Result};
use amq_protocol::protocol::basic::Deliver;

/// A message pushed by the server to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    channel_id: u16,
    consumer_tag: String,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    content: Vec<u8>,
    properties: AmqpProperties,
}

impl Delivery {
    pub(crate) fn new(channel_id: u16, content: Content<Deliver>) -> Delivery {
        let Content {
            method: deliver,
            body,
            properties,
        } = content;
        Delivery {
            channel_id,
            consumer_tag: deliver.consumer_tag,
            delivery_tag: deliver.delivery_tag,
            redelivered: deliver.redelivered,
            exchange: deliver.exchange,
            routing_key: deliver.routing_key,
            content: body,
            properties,
        }
    }

    pub(crate) fn from_parts(
        channel_id: u16,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        content: Content<()>,
    ) -> Delivery {
        Delivery {
            channel_id,
            consumer_tag: String::new(),
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
            content: content.body,
            properties: content.properties,
        }
    }

    /// The channel this message arrived on; acks must be sent on the same channel.
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Empty for messages fetched with `basic.get`.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn properties(&self) -> &AmqpProperties {
        &self.properties
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// Acknowledges this message (and, if `multiple`, every earlier unacknowledged one) on
    /// `channel`, which should be the channel it was received on.
    pub fn ack(self, channel: &Channel, multiple: bool) -> Result<()> {
        channel.basic_ack(self.delivery_tag, multiple)
    }
}
