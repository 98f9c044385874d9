//! A blocking AMQP 0-9-1 client engine.
//!
//! A [`Connection`] owns one socket to a broker and a background I/O thread that reads frames,
//! routes them to [`Channel`]s and keeps heartbeats flowing. Channels are created and tracked
//! through the connection's [`ChannelManager`]; consumer callbacks run on a separate worker
//! pool via [`ConsumerDispatch`]. [`ConnectionFactory`] builds connections from individual
//! settings or from an `amqp://` URL.

mod address;
mod auth;
mod channel;
mod channel_manager;
mod connection;
mod connection_factory;
mod connection_options;
mod consumer;
mod consumer_dispatch;
mod delivery;
mod errors;
mod exchange;
mod frame;
mod frame_buffer;
mod get;
mod heartbeats;
mod queue;
mod serialize;
mod stream;
mod wire;


pub use address::{Address, CertInfo, Protocol};
pub use auth::{AuthMechanism, Sasl};
pub use channel::Channel;
pub use channel_manager::ChannelManager;
pub use connection::Connection;
pub use connection_factory::ConnectionFactory;
pub use connection_options::{ConnectionOptions, ListenerRestartHook};
pub use consumer::ConsumerOptions;
pub use consumer_dispatch::{ConsumerDispatch, Task, WorkPool, WorkerPool};
pub use delivery::Delivery;
pub use errors::{Error, ErrorKind, Result};
pub use exchange::{ExchangeDeclareOptions, ExchangeType};
pub use frame::Frame;
pub use get::Get;
pub use queue::{QueueDeclareOptions, QueueDeclared, QueueDeleteOptions};
pub use stream::IoStream;
pub use wire::{ChannelWireConnection, ConnectionState, ConnectionTuning};

pub use amq_protocol::protocol::basic::AMQPProperties as AmqpProperties;
pub use amq_protocol::types::AMQPValue as AmqpValue;
pub use amq_protocol::types::FieldTable;

#[allow(dead_code)]
mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
