use crate::wire::Content;
use crate::{Channel, Delivery, Result};
use amq_protocol::protocol::basic::GetOk;

/// A message delivered in response to a [`basic_get`](struct.Channel.html#method.basic_get)
/// request.
#[derive(Clone, Debug)]
pub struct Get {
    /// The message.
    pub delivery: Delivery,

    /// The number of messages present in the queue at the time the get was serviced.
    pub message_count: u32,
}

impl Get {
    pub(crate) fn new(channel_id: u16, content: Content<GetOk>) -> Get {
        let Content {
            method: get_ok,
            body,
            properties,
        } = content;
        let message_count = get_ok.message_count;
        let delivery = Delivery::from_parts(
            channel_id,
            get_ok.delivery_tag,
            get_ok.redelivered,
            get_ok.exchange,
            get_ok.routing_key,
            Content {
                method: (),
                body,
                properties,
            },
        );
        Get {
            delivery,
            message_count,
        }
    }

    /// Calls [`Delivery::ack`](struct.Delivery.html#method.ack) on `self.delivery`.
    #[inline]
    pub fn ack(self, channel: &Channel, multiple: bool) -> Result<()> {
        self.delivery.ack(channel, multiple)
    }
}
