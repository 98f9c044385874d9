use crate::errors::*;
use crate::AmqpProperties;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::AMQPClass;

/// One decoded frame addressed to a channel.
///
/// Heartbeats never surface as a `Frame`; they are consumed by the wire connection.
#[derive(Clone, Debug)]
pub enum Frame {
    /// A method frame carrying its decoded method.
    Method(AMQPClass),

    /// A content header announcing the body that follows.
    Header {
        class_id: u16,
        body_size: u64,
        properties: AmqpProperties,
    },

    /// A slice of content body.
    Body(Vec<u8>),
}

impl Frame {
    /// Splits a decoded wire frame into its channel number and payload. Returns `None` for
    /// heartbeats.
    pub(crate) fn from_wire(frame: AMQPFrame) -> Result<Option<(u16, Frame)>> {
        Ok(Some(match frame {
            AMQPFrame::Method(channel_id, class) => (channel_id, Frame::Method(class)),
            AMQPFrame::Header(channel_id, _, header) => {
                let header = *header;
                (
                    channel_id,
                    Frame::Header {
                        class_id: header.class_id,
                        body_size: header.body_size,
                        properties: header.properties,
                    },
                )
            }
            AMQPFrame::Body(channel_id, body) => (channel_id, Frame::Body(body)),
            AMQPFrame::Heartbeat(_) => return Ok(None),
            AMQPFrame::ProtocolHeader => return FrameUnexpectedSnafu.fail(),
        }))
    }

    pub fn is_method(&self) -> bool {
        match self {
            Frame::Method(_) => true,
            Frame::Header { .. } | Frame::Body(_) => false,
        }
    }
}
