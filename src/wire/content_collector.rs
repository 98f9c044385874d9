use crate::errors::*;
use crate::{AmqpProperties, Frame};

/// A content-carrying method together with its assembled body.
#[derive(Debug)]
pub(crate) struct Content<T> {
    pub(crate) method: T,
    pub(crate) body: Vec<u8>,
    pub(crate) properties: AmqpProperties,
}

/// Assembles the header and body frames that follow a content-carrying method
/// (`basic.deliver`, `basic.get-ok`).
pub(crate) struct ContentCollector<T> {
    state: Option<State<T>>,
}

enum State<T> {
    Method(T),
    Body(T, usize, AmqpProperties, Vec<u8>),
}

impl<T> ContentCollector<T> {
    pub(crate) fn new(method: T) -> ContentCollector<T> {
        ContentCollector {
            state: Some(State::Method(method)),
        }
    }

    /// Feeds the next frame from the channel. Returns the content once the body is complete.
    pub(crate) fn collect(&mut self, frame: Frame) -> Result<Option<Content<T>>> {
        match (self.state.take(), frame) {
            (
                Some(State::Method(method)),
                Frame::Header {
                    body_size,
                    properties,
                    ..
                },
            ) => {
                let body_size = body_size as usize;
                if body_size == 0 {
                    Ok(Some(Content {
                        method,
                        body: Vec::new(),
                        properties,
                    }))
                } else {
                    let buf = Vec::with_capacity(body_size);
                    self.state = Some(State::Body(method, body_size, properties, buf));
                    Ok(None)
                }
            }
            (Some(State::Body(method, body_size, properties, mut buf)), Frame::Body(mut body)) => {
                buf.append(&mut body);
                if buf.len() == body_size {
                    Ok(Some(Content {
                        method,
                        body: buf,
                        properties,
                    }))
                } else if buf.len() < body_size {
                    self.state = Some(State::Body(method, body_size, properties, buf));
                    Ok(None)
                } else {
                    FrameUnexpectedSnafu.fail()
                }
            }
            _ => FrameUnexpectedSnafu.fail(),
        }
    }
}
