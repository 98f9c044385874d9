use crate::channel_manager::WeakChannelManager;
use crate::errors::*;
use crate::wire::{ChannelWireConnection, ConnectionState};
use crate::{
    AmqpProperties, ConsumerOptions, Delivery, ExchangeDeclareOptions, ExchangeType, FieldTable,
    Frame, Get, QueueDeclareOptions, QueueDeclared, QueueDeleteOptions,
};
use log::debug;
use std::cmp;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

// Longest single wait inside a blocking receive, so a handle closed by another thread stops
// blocking promptly.
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Handle to one open AMQP channel.
///
/// Cloning is cheap; every clone refers to the same channel. The handle does not keep its
/// connection alive: once the connection is gone, every operation fails with
/// `ConnectionClosed`. After the channel is closed (by the application, the server, or a
/// connection shutdown) every operation fails with `ChannelClosed`.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    channel_id: u16,
    conn: Weak<ChannelWireConnection>,
    state: Mutex<State>,
}

enum Status {
    Open,
    Closed(Arc<Error>),
}

struct State {
    status: Status,
    manager: Option<WeakChannelManager>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.inner.channel_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(channel_id: u16, conn: Weak<ChannelWireConnection>) -> Channel {
        Channel {
            inner: Arc::new(Inner {
                channel_id,
                conn,
                state: Mutex::new(State {
                    status: Status::Open,
                    manager: None,
                }),
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    pub(crate) fn attach(&self, manager: WeakChannelManager) {
        self.lock().manager = Some(manager);
    }

    pub fn channel_id(&self) -> u16 {
        self.inner.channel_id
    }

    pub fn is_open(&self) -> bool {
        match self.lock().status {
            Status::Open => true,
            Status::Closed(_) => false,
        }
    }

    /// Why the channel was closed, or `None` while it is open.
    pub fn close_reason(&self) -> Option<Arc<Error>> {
        match &self.lock().status {
            Status::Open => None,
            Status::Closed(reason) => Some(Arc::clone(reason)),
        }
    }

    /// Closes the channel. Calling `close` on a closed channel does nothing.
    pub fn close(&self) -> Result<()> {
        let manager = {
            let state = self.lock();
            if let Status::Closed(_) = state.status {
                return Ok(());
            }
            state.manager.as_ref().and_then(|manager| manager.upgrade())
        };
        let channel_id = self.channel_id();
        let reason = ClientClosedChannelSnafu { channel_id }.build();
        match manager {
            Some(manager) => manager.close_channel(channel_id, reason),
            None => self.shutdown(Arc::new(reason), true),
        }
    }

    /// Marks the handle closed with `reason`. Returns false if it was already closed.
    pub(crate) fn mark_closed(&self, reason: Arc<Error>) -> bool {
        let mut state = self.lock();
        match state.status {
            Status::Open => {
                debug!("channel {} closed: {}", self.channel_id(), reason);
                state.status = Status::Closed(reason);
                true
            }
            Status::Closed(_) => false,
        }
    }

    /// Marks the handle closed and, if `send_close`, performs `channel.close` on the wire.
    pub(crate) fn shutdown(&self, reason: Arc<Error>, send_close: bool) -> Result<()> {
        if !self.mark_closed(reason) || !send_close {
            return Ok(());
        }
        let conn = match self.inner.conn.upgrade() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        match conn.channel_close(self.channel_id()) {
            Ok(()) => Ok(()),
            // nothing left to close on a connection that is going away
            Err(err) if conn.state() != ConnectionState::Connected => {
                debug!("channel {} not closed on the wire: {}", self.channel_id(), err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn conn(&self) -> Result<Arc<ChannelWireConnection>> {
        if let Status::Closed(_) = self.lock().status {
            return ChannelClosedSnafu {
                channel_id: self.channel_id(),
            }
            .fail();
        }
        match self.inner.conn.upgrade() {
            Some(conn) => Ok(conn),
            None => ConnectionClosedSnafu.fail(),
        }
    }

    /// Waits up to `timeout` for the next frame addressed to this channel. `Ok(None)` means no
    /// frame arrived in time.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let conn = self.conn()?;
            let slice = cmp::min(
                deadline.saturating_duration_since(Instant::now()),
                RECEIVE_SLICE,
            );
            if let Some(frame) = conn.receive(self.channel_id(), slice)? {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Waits up to `timeout` for the next message pushed to a consumer on this channel.
    pub fn next_delivery(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let conn = self.conn()?;
            let slice = cmp::min(
                deadline.saturating_duration_since(Instant::now()),
                RECEIVE_SLICE,
            );
            if let Some(delivery) = conn.next_delivery(self.channel_id(), slice)? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.conn()?
            .basic_ack(self.channel_id(), delivery_tag, multiple)
    }

    pub fn basic_cancel<S: AsRef<str>>(&self, consumer_tag: S, nowait: bool) -> Result<()> {
        self.conn()?
            .basic_cancel(self.channel_id(), consumer_tag.as_ref(), nowait)
    }

    /// Starts a consumer on `queue`; messages are then retrieved with
    /// [`next_delivery`](#method.next_delivery). Returns the consumer tag.
    pub fn basic_consume<S0: AsRef<str>, S1: AsRef<str>>(
        &self,
        queue: S0,
        consumer_tag: S1,
        options: ConsumerOptions,
    ) -> Result<String> {
        self.conn()?.basic_consume(
            self.channel_id(),
            queue.as_ref(),
            consumer_tag.as_ref(),
            options,
        )
    }

    pub fn basic_get<S: AsRef<str>>(&self, queue: S, no_ack: bool) -> Result<Option<Get>> {
        self.conn()?
            .basic_get(self.channel_id(), queue.as_ref(), no_ack)
    }

    pub fn basic_publish<T: AsRef<[u8]>, S0: AsRef<str>, S1: AsRef<str>>(
        &self,
        content: T,
        exchange: S0,
        routing_key: S1,
        mandatory: bool,
        immediate: bool,
        properties: &AmqpProperties,
    ) -> Result<()> {
        self.conn()?.basic_publish(
            self.channel_id(),
            content.as_ref(),
            exchange.as_ref(),
            routing_key.as_ref(),
            mandatory,
            immediate,
            properties,
        )
    }

    pub fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.conn()?.basic_recover(self.channel_id(), requeue)
    }

    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.conn()?
            .basic_qos(self.channel_id(), prefetch_size, prefetch_count, global)
    }

    pub fn exchange_declare<S: AsRef<str>>(
        &self,
        type_: ExchangeType,
        exchange: S,
        passive: bool,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.conn()?
            .exchange_declare(self.channel_id(), type_, exchange.as_ref(), passive, options)
    }

    pub fn exchange_delete<S: AsRef<str>>(
        &self,
        exchange: S,
        if_unused: bool,
        nowait: bool,
    ) -> Result<()> {
        self.conn()?
            .exchange_delete(self.channel_id(), exchange.as_ref(), if_unused, nowait)
    }

    pub fn queue_bind<S0: AsRef<str>, S1: AsRef<str>, S2: AsRef<str>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        nowait: bool,
        arguments: FieldTable,
    ) -> Result<()> {
        self.conn()?.queue_bind(
            self.channel_id(),
            queue.as_ref(),
            exchange.as_ref(),
            routing_key.as_ref(),
            nowait,
            arguments,
        )
    }

    pub fn queue_declare<S: AsRef<str>>(
        &self,
        queue: S,
        passive: bool,
        options: QueueDeclareOptions,
    ) -> Result<Option<QueueDeclared>> {
        self.conn()?
            .queue_declare(self.channel_id(), queue.as_ref(), passive, options)
    }

    pub fn queue_delete<S: AsRef<str>>(
        &self,
        queue: S,
        options: QueueDeleteOptions,
    ) -> Result<Option<u32>> {
        self.conn()?
            .queue_delete(self.channel_id(), queue.as_ref(), options)
    }

    pub fn queue_purge<S: AsRef<str>>(&self, queue: S, nowait: bool) -> Result<Option<u32>> {
        self.conn()?
            .queue_purge(self.channel_id(), queue.as_ref(), nowait)
    }

    pub fn queue_unbind<S0: AsRef<str>, S1: AsRef<str>, S2: AsRef<str>>(
        &self,
        queue: S0,
        exchange: S1,
        routing_key: S2,
        arguments: FieldTable,
    ) -> Result<()> {
        self.conn()?.queue_unbind(
            self.channel_id(),
            queue.as_ref(),
            exchange.as_ref(),
            routing_key.as_ref(),
            arguments,
        )
    }
}
