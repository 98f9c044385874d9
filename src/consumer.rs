use crate::FieldTable;
use amq_protocol::protocol::basic::Consume;

/// Options passed to the server when starting a consumer.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to false and has an
/// empty set of arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsumerOptions {
    /// If true, the server will not send this consumer messages that were published by the
    /// consumer's connection.
    pub no_local: bool,

    /// If true, the server assumes all delivered messages are acknowledged, and the client should
    /// not acknowledge messages.
    pub no_ack: bool,

    /// If true, requires that this consumer is the only one attached to the queue. If other
    /// consumers are active, the server will close the channel.
    pub exclusive: bool,

    /// If true, the server is not asked to reply; the consumer tag must then be chosen by the
    /// client.
    pub nowait: bool,

    /// Extra arguments; these are optional in general, but may be needed for some plugins or
    /// server-specific features.
    pub arguments: FieldTable,
}

impl ConsumerOptions {
    pub(crate) fn into_consume(self, queue: &str, consumer_tag: &str) -> Consume {
        Consume {
            ticket: 0,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            no_local: self.no_local,
            no_ack: self.no_ack,
            exclusive: self.exclusive,
            nowait: self.nowait,
            arguments: self.arguments,
        }
    }
}
