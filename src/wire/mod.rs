use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::heartbeats::{HeartbeatState, HeartbeatTimers};
use crate::serialize::{IntoAmqpClass, OutputBuffer, TryFromAmqpClass};
use crate::stream::{IoStream, Transport};
use crate::{
    Address, AmqpProperties, AuthMechanism, CertInfo, Channel, ConnectionOptions, ConsumerOptions,
    Delivery, ExchangeDeclareOptions, ExchangeType, FieldTable, Frame, Get, Protocol,
    QueueDeclareOptions, QueueDeclared, QueueDeleteOptions,
};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    Ack, Cancel, CancelOk, ConsumeOk, Deliver, Get as AmqpGet, GetEmpty, GetOk, Publish,
    Qos, QosOk, Recover, RecoverOk,
};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{
    Close as ChannelClose, CloseOk as ChannelCloseOk, Open as ChannelOpen,
    OpenOk as ChannelOpenOk,
};
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{
    Close as ConnectionClose, CloseOk as ConnectionCloseOk, TuneOk,
};
use amq_protocol::protocol::constants::{FRAME_MIN_SIZE, REPLY_SUCCESS as AMQP_REPLY_SUCCESS};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    DeclareOk as ExchangeDeclareOk, Delete as ExchangeDelete, DeleteOk as ExchangeDeleteOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    Bind, BindOk, DeclareOk as QueueDeclareOk, DeleteOk as QueueDeleteOk,
    Purge, PurgeOk, Unbind, UnbindOk,
};
use amq_protocol::protocol::AMQPClass;
use log::{debug, error, trace, warn};
use mio::net::TcpStream;
use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use snafu::ResultExt;
use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::{cmp, mem, thread};

mod channel_slots;
mod connection_state;
mod content_collector;
mod handshake_state;

use self::channel_slots::ChannelSlots;
pub use self::connection_state::ConnectionState;
pub(crate) use self::content_collector::Content;
use self::content_collector::ContentCollector;
use self::handshake_state::{HandshakeParams, HandshakeState};

// AMQP_REPLY_SUCCESS is a u8, but we need a u16 where we use it.
const REPLY_SUCCESS: u16 = AMQP_REPLY_SUCCESS as u16;

const STREAM: Token = Token(0);

// Upper bound on any single blocking wait, so shutdown requests and deadlines are noticed.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Limits agreed with the server during the tune exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTuning {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl From<&TuneOk> for ConnectionTuning {
    fn from(tune_ok: &TuneOk) -> ConnectionTuning {
        ConnectionTuning {
            channel_max: tune_ok.channel_max,
            frame_max: tune_ok.frame_max,
            heartbeat: tune_ok.heartbeat,
        }
    }
}

struct Io {
    stream: Box<dyn IoStream>,
    frames: FrameBuffer,
}

struct ChannelSlot {
    frames: VecDeque<Frame>,
    closing: bool,
    // a reply went unanswered, so later replies can no longer be matched to requests
    expired: bool,
}

impl ChannelSlot {
    fn new() -> ChannelSlot {
        ChannelSlot {
            frames: VecDeque::new(),
            closing: false,
            expired: false,
        }
    }
}

struct Inner {
    state: ConnectionState,
    io: Option<Io>,
    outbuf: OutputBuffer,
    slots: ChannelSlots<ChannelSlot>,
    tuning: Option<ConnectionTuning>,
    heartbeats: HeartbeatTimers,
    closed_by_server: HashMap<u16, (u16, String)>,
    pending_server_closes: Vec<u16>,
    server_close: Option<(u16, String)>,
    loss_reason: Option<String>,
    close_ok_received: bool,
    frames_sent: u64,
}

fn channel_missing(closed_by_server: &HashMap<u16, (u16, String)>, channel_id: u16) -> Error {
    match closed_by_server.get(&channel_id) {
        Some((code, message)) => ServerClosedChannelSnafu {
            channel_id,
            code: *code,
            message: message.clone(),
        }
        .build(),
        None => ChannelNotFoundSnafu { channel_id }.build(),
    }
}

impl Inner {
    fn new() -> Inner {
        Inner {
            state: ConnectionState::Initialized,
            io: None,
            outbuf: OutputBuffer::empty(),
            slots: ChannelSlots::new(),
            tuning: None,
            heartbeats: HeartbeatTimers::default(),
            closed_by_server: HashMap::new(),
            pending_server_closes: Vec::new(),
            server_close: None,
            loss_reason: None,
            close_ok_received: false,
            frames_sent: 0,
        }
    }

    /// Fails unless we are connected and `channel_id` is open and not being closed.
    fn ensure_open(&self, channel_id: u16) -> Result<()> {
        self.state.ensure_connected()?;
        match self.slots.get(channel_id) {
            Some(slot) if !slot.closing && !slot.expired => Ok(()),
            Some(_) => ChannelClosedSnafu { channel_id }.fail(),
            None => Err(channel_missing(&self.closed_by_server, channel_id)),
        }
    }

    /// Like `ensure_open`, but a channel whose RPC timed out may still be closed.
    fn ensure_closable(&self, channel_id: u16) -> Result<()> {
        self.state.ensure_connected()?;
        match self.slots.get(channel_id) {
            Some(slot) if !slot.closing => Ok(()),
            Some(_) => ChannelClosedSnafu { channel_id }.fail(),
            None => Err(channel_missing(&self.closed_by_server, channel_id)),
        }
    }

    /// Gives up on the reply `channel_id` was waiting for. The channel accepts nothing but
    /// `channel.close` afterwards.
    fn expire(&mut self, channel_id: u16) -> Error {
        if let Some(slot) = self.slots.get_mut(channel_id) {
            warn!("rpc on channel {} timed out; channel is no longer usable", channel_id);
            slot.expired = true;
        }
        RpcTimeoutSnafu { channel_id }.build()
    }

    fn push_method<M: IntoAmqpClass>(&mut self, channel_id: u16, method: M) -> Result<()> {
        let class = method.into_class();
        trace!("sending method on channel {}: {:?}", channel_id, class);
        self.outbuf.push_method(channel_id, class)?;
        self.frames_sent += 1;
        Ok(())
    }

    fn push_content(
        &mut self,
        channel_id: u16,
        class_id: u16,
        content: &[u8],
        properties: &AmqpProperties,
    ) -> Result<()> {
        self.outbuf
            .push_content_header(channel_id, class_id, content.len(), properties)?;
        self.frames_sent += 1;

        // 7 byte header and single byte frame-end
        let frame_max = self
            .tuning
            .map(|tuning| tuning.frame_max as usize)
            .unwrap_or(FRAME_MIN_SIZE as usize);
        for chunk in content.chunks(frame_max - 8) {
            self.outbuf.push_content_body(channel_id, chunk)?;
            self.frames_sent += 1;
        }
        trace!(
            "sending {} content bytes on channel {}",
            content.len(),
            channel_id
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(io) = &mut self.io {
            if write_to_stream(&mut io.stream, &mut self.outbuf)? > 0 {
                self.heartbeats.record_tx_activity(Instant::now());
            }
        }
        Ok(())
    }

    /// Writes what we can, reads everything available and routes it. Returns true if any
    /// frame was routed to a channel (so waiters should recheck their queues).
    fn pump(&mut self) -> Result<bool> {
        self.flush()?;
        let io = match &mut self.io {
            Some(io) => io,
            None => return Ok(false),
        };
        let mut received = Vec::new();
        let n = io.frames.read_from(&mut io.stream, |frame| {
            trace!("read frame {:?}", frame);
            received.push(frame);
            Ok(())
        })?;
        if n > 0 {
            self.heartbeats.record_rx_activity(Instant::now());
        }
        let mut routed = false;
        for frame in received {
            routed |= self.route(frame)?;
        }
        // replies (close-ok) generated while routing
        self.flush()?;
        Ok(routed)
    }

    fn route(&mut self, frame: AMQPFrame) -> Result<bool> {
        let (channel_id, frame) = match Frame::from_wire(frame)? {
            Some(frame) => frame,
            None => {
                trace!("received heartbeat");
                return Ok(false);
            }
        };
        if channel_id == 0 {
            return self.route_channel0(frame);
        }
        match frame {
            Frame::Method(AMQPClass::Channel(AmqpChannel::Close(close))) => {
                warn!(
                    "server closed channel {} (code={}, message={})",
                    channel_id, close.reply_code, close.reply_text
                );
                self.push_method(channel_id, AmqpChannel::CloseOk(ChannelCloseOk {}))?;
                self.slots.remove(channel_id);
                self.closed_by_server
                    .insert(channel_id, (close.reply_code, close.reply_text));
                self.pending_server_closes.push(channel_id);
                Ok(true)
            }
            frame => match self.slots.get_mut(channel_id) {
                Some(slot) => {
                    slot.frames.push_back(frame);
                    Ok(true)
                }
                None => {
                    warn!(
                        "discarding frame for unknown channel {}: {:?}",
                        channel_id, frame
                    );
                    Ok(false)
                }
            },
        }
    }

    fn route_channel0(&mut self, frame: Frame) -> Result<bool> {
        match frame {
            Frame::Method(AMQPClass::Connection(AmqpConnection::Close(close))) => {
                self.push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
                self.server_close = Some((close.reply_code, close.reply_text.clone()));
                ServerClosedConnectionSnafu {
                    code: close.reply_code,
                    message: close.reply_text,
                }
                .fail()
            }
            Frame::Method(AMQPClass::Connection(AmqpConnection::CloseOk(_))) => {
                debug!("received connection close-ok");
                self.close_ok_received = true;
                Ok(true)
            }
            Frame::Method(AMQPClass::Connection(AmqpConnection::Blocked(blocked))) => {
                warn!("connection blocked by server: {:?}", blocked);
                Ok(false)
            }
            Frame::Method(AMQPClass::Connection(AmqpConnection::Unblocked(_))) => {
                debug!("connection unblocked by server");
                Ok(false)
            }
            other => {
                warn!("discarding unexpected frame on channel 0: {:?}", other);
                Ok(false)
            }
        }
    }

    fn pop_frame(&mut self, channel_id: u16) -> Result<Option<Frame>> {
        match self.slots.get_mut(channel_id) {
            Some(slot) => {
                if let Some(frame) = slot.frames.pop_front() {
                    return Ok(Some(frame));
                }
            }
            None => {
                self.state.ensure_connected()?;
                return Err(channel_missing(&self.closed_by_server, channel_id));
            }
        }
        self.state.ensure_connected()?;
        Ok(None)
    }

    /// Removes the first method frame on `channel_id` accepted by `matches`, leaving every
    /// other frame in place. Returns the frame's former position alongside the method.
    fn take_method<F>(&mut self, channel_id: u16, matches: F) -> Result<Option<(usize, AMQPClass)>>
    where
        F: Fn(&AMQPClass) -> bool,
    {
        match self.slots.get_mut(channel_id) {
            Some(slot) => {
                let position = slot.frames.iter().position(|frame| match frame {
                    Frame::Method(class) => matches(class),
                    _ => false,
                });
                if let Some(idx) = position {
                    if let Some(Frame::Method(class)) = slot.frames.remove(idx) {
                        return Ok(Some((idx, class)));
                    }
                }
            }
            None => {
                self.state.ensure_connected()?;
                return Err(channel_missing(&self.closed_by_server, channel_id));
            }
        }
        self.state.ensure_connected()?;
        Ok(None)
    }

    fn take_frame_at(&mut self, channel_id: u16, idx: usize) -> Result<Option<Frame>> {
        match self.slots.get_mut(channel_id) {
            Some(slot) if idx < slot.frames.len() => return Ok(slot.frames.remove(idx)),
            Some(_) => (),
            None => {
                self.state.ensure_connected()?;
                return Err(channel_missing(&self.closed_by_server, channel_id));
            }
        }
        self.state.ensure_connected()?;
        Ok(None)
    }
}

fn write_to_stream<W: Write + ?Sized>(stream: &mut W, outbuf: &mut OutputBuffer) -> Result<usize> {
    let len = outbuf.len();
    let mut pos = 0;
    while pos < len {
        match stream.write(&outbuf[pos..]) {
            Ok(0) => return UnexpectedSocketCloseSnafu.fail(),
            Ok(n) => {
                trace!("wrote {} bytes", n);
                pos += n;
            }
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err).context(IoSnafu),
            },
        }
    }
    if pos == len {
        outbuf.clear();
    } else {
        outbuf.drain_written(pos);
    }
    Ok(pos)
}

fn describe(err: &Error) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        description.push_str(": ");
        description.push_str(&cause.to_string());
        source = cause.source();
    }
    description
}

fn resolve(host_port: &str) -> Result<SocketAddr> {
    let mut addrs = host_port
        .to_socket_addrs()
        .context(ResolveAddressSnafu { address: host_port })?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
            .context(ResolveAddressSnafu { address: host_port }),
    }
}

/// Sleeps for `duration`, waking early (with `ConnectAborted`) if `shutdown` is set.
pub(crate) fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return ConnectAbortedSnafu.fail();
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(cmp::min(deadline - now, WAIT_SLICE));
    }
}

/// Calls `open` (with the 1-based attempt number) up to `retries` times, sleeping `wait`
/// between attempts. Only I/O failures are retried; the last failure is returned as is.
pub(crate) fn open_with_retries<T, F>(
    retries: u32,
    wait: Duration,
    shutdown: &AtomicBool,
    mut open: F,
) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let retries = retries.max(1);
    let mut attempt = 1;
    loop {
        match open(attempt) {
            Ok(val) => return Ok(val),
            Err(err) if err.is_io() && attempt < retries => {
                warn!(
                    "socket open attempt {}/{} failed ({}); retrying in {:?}",
                    attempt,
                    retries,
                    describe(&err),
                    wait
                );
                sleep_unless_shutdown(wait, shutdown)?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One physical AMQP connection: its lifecycle state machine, the open channels multiplexed
/// over it, and every protocol operation the engine performs on them.
///
/// All state lives behind one internal lock. Blocking operations (RPCs, `receive`) release
/// it while they wait, so any number of threads may use different channels concurrently;
/// whichever thread happens to read the socket routes frames for every channel.
pub struct ChannelWireConnection {
    address: Address,
    auth: AuthMechanism,
    options: ConnectionOptions,
    transport: Transport,
    poll: Poll,
    inner: Mutex<Inner>,
    frames_ready: Condvar,
}

impl ChannelWireConnection {
    /// Allocates an unconnected wire connection. TLS configuration is loaded here for
    /// `amqps` and `tunnel` addresses.
    pub fn new(
        address: Address,
        auth: AuthMechanism,
        cert_info: Option<CertInfo>,
        options: ConnectionOptions,
    ) -> Result<ChannelWireConnection> {
        let cert_info = cert_info.unwrap_or_default();
        let transport = Transport::new(address.protocol(), &cert_info)?;
        let poll = Poll::new().context(IoSnafu)?;
        Ok(ChannelWireConnection {
            address,
            auth,
            options,
            transport,
            poll,
            inner: Mutex::new(Inner::new()),
            frames_ready: Condvar::new(),
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Negotiated limits; `None` until connected.
    pub fn tuning(&self) -> Option<ConnectionTuning> {
        self.lock().tuning
    }

    /// Number of frames queued for the transport since the connection was established.
    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Reply code and text of a server-initiated `connection.close`, if one was received.
    pub fn server_close_reason(&self) -> Option<(u16, String)> {
        self.lock().server_close.clone()
    }

    /// Why the connection was lost, if it was.
    pub fn loss_reason(&self) -> Option<String> {
        self.lock().loss_reason.clone()
    }

    /// Channels the server has closed since the last call, with the reason for each.
    pub fn take_server_closed_channels(&self) -> Vec<(u16, Error)> {
        let mut inner = self.lock();
        let ids = mem::replace(&mut inner.pending_server_closes, Vec::new());
        ids.into_iter()
            .map(|channel_id| (channel_id, channel_missing(&inner.closed_by_server, channel_id)))
            .collect()
    }

    /// Opens the socket (retrying as configured) and performs the login handshake.
    pub fn connect(&self, shutdown: &AtomicBool) -> Result<ConnectionTuning> {
        self.lock().state.advance(ConnectionState::Connecting)?;
        debug!("connecting to {}", self.address);

        let result = self.establish(shutdown);
        let mut inner = self.lock();
        let (stream, frames, tune_ok) = match result {
            Ok(established) => established,
            Err(err) => {
                // a concurrent close() may already have moved us to Disconnected
                let _ = inner.state.advance(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        if let Err(err) = inner.state.advance(ConnectionState::Connected) {
            let _ = self.poll.deregister(&*stream);
            return Err(err);
        }

        let tuning = ConnectionTuning::from(&tune_ok);
        inner.slots.set_channel_max(tuning.channel_max);
        if tuning.heartbeat > 0 {
            let interval = Duration::from_secs(u64::from(tuning.heartbeat));
            debug!("starting heartbeat timers ({:?})", interval);
            inner.heartbeats.start(interval, Instant::now());
        }
        inner.tuning = Some(tuning);
        inner.io = Some(Io { stream, frames });
        debug!("connected to {} ({:?})", self.address, tuning);
        Ok(tuning)
    }

    fn establish(
        &self,
        shutdown: &AtomicBool,
    ) -> Result<(Box<dyn IoStream>, FrameBuffer, TuneOk)> {
        let host_port = self.address.host_port();
        let addr = resolve(&host_port)?;
        let retries = self.options.retries;
        let wait = self.options.retry_wait;
        let socket = open_with_retries(retries, wait, shutdown, |attempt| {
            debug!(
                "opening socket to {} (attempt {}/{})",
                host_port, attempt, retries
            );
            self.open_socket(&addr, &host_port, wait, shutdown)
        })?;

        let deadline = Instant::now() + self.options.connection_timeout;
        let mut stream = self.transport.wrap(socket, self.address.host(), |evented| {
            self.wait_ready(
                evented,
                Ready::readable() | Ready::writable(),
                deadline,
                shutdown,
            )
        })?;

        match self.login(&mut stream, deadline, shutdown) {
            Ok((frames, tune_ok)) => Ok((stream, frames, tune_ok)),
            Err(err) => {
                let _ = self.poll.deregister(&*stream);
                Err(err)
            }
        }
    }

    fn open_socket(
        &self,
        addr: &SocketAddr,
        host_port: &str,
        wait: Duration,
        shutdown: &AtomicBool,
    ) -> Result<TcpStream> {
        let stream =
            TcpStream::connect(addr).context(SocketConnectSnafu { address: host_port })?;
        self.poll
            .register(&stream, STREAM, Ready::writable(), PollOpt::edge())
            .context(IoSnafu)?;

        let deadline = Instant::now() + wait;
        let connected = self
            .wait_ready(&stream, Ready::writable(), deadline, shutdown)
            .and_then(|()| match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(err)) | Err(err) => {
                    Err(err).context(SocketConnectSnafu { address: host_port })
                }
            })
            // writable without an error can still mean refused on some platforms
            .and_then(|()| {
                stream
                    .peer_addr()
                    .map(|_| ())
                    .context(SocketConnectSnafu { address: host_port })
            });
        if let Err(err) = connected {
            let _ = self.poll.deregister(&stream);
            return Err(err);
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {}", err);
        }
        Ok(stream)
    }

    fn wait_ready<E: Evented + ?Sized>(
        &self,
        evented: &E,
        interest: Ready,
        deadline: Instant,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        self.poll
            .reregister(evented, STREAM, interest, PollOpt::edge())
            .context(IoSnafu)?;
        let mut events = Events::with_capacity(4);
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return ConnectAbortedSnafu.fail();
            }
            let now = Instant::now();
            if now >= deadline {
                return SocketConnectTimeoutSnafu {
                    address: self.address.host_port(),
                }
                .fail();
            }
            self.poll
                .poll(&mut events, Some(cmp::min(deadline - now, WAIT_SLICE)))
                .context(IoSnafu)?;
            if !events.is_empty() {
                return Ok(());
            }
        }
    }

    fn login(
        &self,
        stream: &mut Box<dyn IoStream>,
        deadline: Instant,
        shutdown: &AtomicBool,
    ) -> Result<(FrameBuffer, TuneOk)> {
        let params = HandshakeParams {
            options: &self.options,
            auth: &self.auth,
            virtual_host: self.address.virtual_host(),
        };
        let mut frames = FrameBuffer::new();
        let mut outbuf = OutputBuffer::with_protocol_header();
        let mut state = HandshakeState::Start;

        loop {
            write_to_stream(stream, &mut outbuf)?;
            if outbuf.is_empty() {
                if let HandshakeState::Done(tune_ok) = &state {
                    return Ok((frames, tune_ok.clone()));
                }
            }

            let mut received = Vec::new();
            let read = frames.read_from(stream, |frame| {
                trace!("read handshake frame {:?}", frame);
                received.push(frame);
                Ok(())
            });
            let got_frames = !received.is_empty();
            for frame in received {
                state.process(&params, &mut outbuf, frame)?;
            }
            if let HandshakeState::ServerClosing(close) = &state {
                // best effort; the server may already have hung up
                let _ = write_to_stream(stream, &mut outbuf);
                return LoginRefusedSnafu {
                    code: close.reply_code,
                    message: close.reply_text.clone(),
                }
                .fail();
            }
            read?;

            if !got_frames {
                let interest = if outbuf.is_empty() {
                    Ready::readable()
                } else {
                    Ready::readable() | Ready::writable()
                };
                self.wait_ready(&**stream, interest, deadline, shutdown)?;
            }
        }
    }

    // Marks the connection lost and returns the IoInterrupted error describing why. Only the
    // first loss produces IoInterrupted; later failures see ConnectionClosed.
    fn lose(&self, inner: &mut Inner, err: Error) -> Error {
        if inner.state == ConnectionState::Disconnected {
            return ConnectionClosedSnafu.build();
        }
        let reason = describe(&err);
        if inner.state == ConnectionState::Disconnecting {
            debug!("connection to {} ended while closing: {}", self.address, reason);
        } else {
            error!("connection to {} lost: {}", self.address, reason);
        }
        let _ = inner.flush();
        inner.outbuf.clear();
        self.release_io(inner);
        let _ = inner.state.advance(ConnectionState::Disconnected);
        inner.loss_reason = Some(reason.clone());
        self.frames_ready.notify_all();
        IoInterruptedSnafu { reason }.build()
    }

    fn release_io(&self, inner: &mut Inner) {
        if let Some(io) = inner.io.take() {
            if let Err(err) = self.poll.deregister(&*io.stream) {
                debug!("failed to deregister stream: {}", err);
            }
        }
    }

    // Runs the listener-restart hook for a freshly detected loss. Called without the lock
    // held, at most once per public operation.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::IoInterrupted { reason }) = &result {
            self.options.restart_hook.notify(reason);
        }
        result
    }

    fn pump(&self, inner: &mut Inner) -> Result<()> {
        match inner.pump() {
            Ok(true) => {
                self.frames_ready.notify_all();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(self.lose(inner, err)),
        }
    }

    fn flush(&self, inner: &mut Inner) -> Result<()> {
        match inner.flush() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.lose(inner, err)),
        }
    }

    // Repeatedly pumps the socket and runs `check` until it produces a value or `deadline`
    // passes. The lock is released between attempts.
    fn wait_until<'a, T, F>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        deadline: Instant,
        mut check: F,
    ) -> Result<(MutexGuard<'a, Inner>, Option<T>)>
    where
        F: FnMut(&mut Inner) -> Result<Option<T>>,
    {
        loop {
            if let Some(found) = check(&mut *inner)? {
                return Ok((inner, Some(found)));
            }
            self.pump(&mut inner)?;
            if let Some(found) = check(&mut *inner)? {
                return Ok((inner, Some(found)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok((inner, None));
            }
            let slice = cmp::min(deadline - now, WAIT_SLICE);
            inner = self.frames_ready.wait_timeout(inner, slice).unwrap().0;
        }
    }

    /// Blocks until the socket may have work to do or `timeout` elapses.
    pub fn wait_for_io(&self, timeout: Duration) -> Result<()> {
        let registered = {
            let inner = self.lock();
            match &inner.io {
                Some(io) => {
                    let interest = if inner.outbuf.is_empty() {
                        Ready::readable()
                    } else {
                        Ready::readable() | Ready::writable()
                    };
                    self.poll
                        .reregister(&*io.stream, STREAM, interest, PollOpt::edge())
                        .context(IoSnafu)?;
                    true
                }
                None => false,
            }
        };
        if !registered {
            thread::sleep(cmp::min(timeout, WAIT_SLICE));
            return Ok(());
        }
        let mut events = Events::with_capacity(4);
        self.poll.poll(&mut events, Some(timeout)).context(IoSnafu)?;
        Ok(())
    }

    /// One steady-state I/O step: heartbeat bookkeeping, then flush and read.
    pub fn process_io(&self) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            self.step(&mut inner)
        };
        self.observe(result)
    }

    fn step(&self, inner: &mut Inner) -> Result<()> {
        inner.state.ensure_connected()?;
        let now = Instant::now();
        if inner.heartbeats.check_rx(now) == HeartbeatState::Expired {
            return Err(self.lose(inner, MissedServerHeartbeatsSnafu.build()));
        }
        if inner.heartbeats.check_tx(now) == HeartbeatState::Expired && inner.outbuf.is_empty() {
            trace!("sending heartbeat");
            inner.outbuf.push_heartbeat()?;
            inner.frames_sent += 1;
        }
        self.pump(inner)
    }

    /// Pops the next frame queued for `channel_id`, reading from the socket for up to
    /// `timeout`. `Ok(None)` means nothing arrived in time.
    pub fn receive(&self, channel_id: u16, timeout: Duration) -> Result<Option<Frame>> {
        let result = {
            let inner = self.lock();
            let deadline = Instant::now() + timeout;
            self.wait_until(inner, deadline, |inner| inner.pop_frame(channel_id))
                .map(|(_, frame)| frame)
        };
        self.observe(result)
    }

    /// Allocates the next channel number and performs `channel.open`.
    pub fn channel_open(self: &Arc<Self>) -> Result<Channel> {
        let channel_id = self.observe(self.open_channel())?;
        debug!("opened channel {}", channel_id);
        Ok(Channel::new(channel_id, Arc::downgrade(self)))
    }

    fn open_channel(&self) -> Result<u16> {
        let mut inner = self.lock();
        inner.state.ensure_connected()?;
        let channel_id = inner.slots.insert_next(ChannelSlot::new())?;
        inner.push_method(
            channel_id,
            AmqpChannel::Open(ChannelOpen {
                out_of_band: String::new(),
            }),
        )?;
        let deadline = Instant::now() + self.options.rpc_timeout;
        let (mut inner, reply) = self.wait_until(inner, deadline, |inner| {
            inner.take_method(channel_id, ChannelOpenOk::matches)
        })?;
        match reply {
            Some(_) => Ok(channel_id),
            None => {
                inner.slots.remove(channel_id);
                RpcTimeoutSnafu { channel_id }.fail()
            }
        }
    }

    /// Performs `channel.close` and waits for the server's close-ok.
    pub fn channel_close(&self, channel_id: u16) -> Result<()> {
        let result = self.close_channel(channel_id);
        self.observe(result)
    }

    fn close_channel(&self, channel_id: u16) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_closable(channel_id)?;
        if let Some(slot) = inner.slots.get_mut(channel_id) {
            slot.closing = true;
        }
        inner.push_method(
            channel_id,
            AmqpChannel::Close(ChannelClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "goodbye".to_string(),
                class_id: 0,
                method_id: 0,
            }),
        )?;
        let deadline = Instant::now() + self.options.rpc_timeout;
        let result = self.wait_until(inner, deadline, |inner| {
            inner.take_method(channel_id, ChannelCloseOk::matches)
        });
        let mut inner = match result {
            Ok((inner, Some(_))) => inner,
            Ok((inner, None)) => {
                warn!("timed out waiting for close-ok on channel {}", channel_id);
                inner
            }
            // crossed with a close from the server; the channel is gone either way
            Err(Error::ServerClosedChannel { .. }) => return Ok(()),
            Err(err) => {
                self.lock().slots.remove(channel_id);
                return Err(err);
            }
        };
        inner.slots.remove(channel_id);
        debug!("closed channel {}", channel_id);
        Ok(())
    }

    /// Acknowledges a server-initiated `channel.close` that has not already been answered.
    pub fn channel_close_ok(&self, channel_id: u16) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            inner.state.ensure_connected().and_then(|()| {
                if inner.slots.remove(channel_id).is_none() {
                    return Err(channel_missing(&inner.closed_by_server, channel_id));
                }
                inner.push_method(channel_id, AmqpChannel::CloseOk(ChannelCloseOk {}))?;
                self.flush(&mut inner)
            })
        };
        self.observe(result)
    }

    fn send_method<M: IntoAmqpClass>(&self, channel_id: u16, method: M) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_open(channel_id)?;
        inner.push_method(channel_id, method)?;
        self.flush(&mut inner)
    }

    fn rpc<M, T>(&self, channel_id: u16, method: M) -> Result<T>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpClass,
    {
        let mut inner = self.lock();
        inner.ensure_open(channel_id)?;
        inner.push_method(channel_id, method)?;
        let deadline = Instant::now() + self.options.rpc_timeout;
        let (mut inner, reply) = self.wait_until(inner, deadline, |inner| {
            inner.take_method(channel_id, T::matches)
        })?;
        match reply {
            Some((_, class)) => T::try_from(class),
            None => Err(inner.expire(channel_id)),
        }
    }

    // `nowait` methods are only sent; the others wait for their reply.
    fn call<M, T>(&self, channel_id: u16, method: M, nowait: bool) -> Result<Option<T>>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpClass,
    {
        let result = if nowait {
            self.send_method(channel_id, method).map(|()| None)
        } else {
            self.rpc(channel_id, method).map(Some)
        };
        self.observe(result)
    }

    fn take_content<'a, T>(
        &'a self,
        inner: MutexGuard<'a, Inner>,
        channel_id: u16,
        idx: usize,
        method: T,
        deadline: Instant,
    ) -> Result<Content<T>> {
        let mut collector = ContentCollector::new(method);
        let (mut inner, content) = self.wait_until(inner, deadline, |inner| {
            while let Some(frame) = inner.take_frame_at(channel_id, idx)? {
                if let Some(content) = collector.collect(frame)? {
                    return Ok(Some(content));
                }
            }
            Ok(None)
        })?;
        match content {
            Some(content) => Ok(content),
            None => Err(inner.expire(channel_id)),
        }
    }

    pub fn basic_ack(&self, channel_id: u16, delivery_tag: u64, multiple: bool) -> Result<()> {
        let result = self.send_method(
            channel_id,
            AmqpBasic::Ack(Ack {
                delivery_tag,
                multiple,
            }),
        );
        self.observe(result)
    }

    pub fn basic_cancel(&self, channel_id: u16, consumer_tag: &str, nowait: bool) -> Result<()> {
        let cancel = AmqpBasic::Cancel(Cancel {
            consumer_tag: consumer_tag.to_string(),
            nowait,
        });
        self.call::<_, CancelOk>(channel_id, cancel, nowait)?;
        Ok(())
    }

    /// Starts a consumer, returning its consumer tag (the server-generated one if
    /// `consumer_tag` is empty and the server was asked to reply).
    pub fn basic_consume(
        &self,
        channel_id: u16,
        queue: &str,
        consumer_tag: &str,
        options: ConsumerOptions,
    ) -> Result<String> {
        let nowait = options.nowait;
        let consume = AmqpBasic::Consume(options.into_consume(queue, consumer_tag));
        let consume_ok = self.call::<_, ConsumeOk>(channel_id, consume, nowait)?;
        Ok(consume_ok
            .map(|ok| ok.consumer_tag)
            .unwrap_or_else(|| consumer_tag.to_string()))
    }

    /// Synchronously fetches one message, or `None` if the queue is empty.
    pub fn basic_get(&self, channel_id: u16, queue: &str, no_ack: bool) -> Result<Option<Get>> {
        let result = self.get(channel_id, queue, no_ack);
        self.observe(result)
    }

    fn get(&self, channel_id: u16, queue: &str, no_ack: bool) -> Result<Option<Get>> {
        let mut inner = self.lock();
        inner.ensure_open(channel_id)?;
        inner.push_method(
            channel_id,
            AmqpBasic::Get(AmqpGet {
                ticket: 0,
                queue: queue.to_string(),
                no_ack,
            }),
        )?;
        let deadline = Instant::now() + self.options.rpc_timeout;
        let (mut inner, reply) = self.wait_until(inner, deadline, |inner| {
            inner.take_method(channel_id, |class| {
                GetOk::matches(class) || GetEmpty::matches(class)
            })
        })?;
        match reply {
            Some((idx, AMQPClass::Basic(AmqpBasic::GetOk(get_ok)))) => {
                let content = self.take_content(inner, channel_id, idx, get_ok, deadline)?;
                Ok(Some(Get::new(channel_id, content)))
            }
            Some((_, AMQPClass::Basic(AmqpBasic::GetEmpty(_)))) => Ok(None),
            Some(_) => FrameUnexpectedSnafu.fail(),
            None => Err(inner.expire(channel_id)),
        }
    }

    /// Waits up to `timeout` for the next `basic.deliver` on `channel_id` and assembles its
    /// content.
    pub fn next_delivery(&self, channel_id: u16, timeout: Duration) -> Result<Option<Delivery>> {
        let result = self.deliver(channel_id, timeout);
        self.observe(result)
    }

    fn deliver(&self, channel_id: u16, timeout: Duration) -> Result<Option<Delivery>> {
        let inner = self.lock();
        let deadline = Instant::now() + timeout;
        let (inner, found) = self.wait_until(inner, deadline, |inner| {
            inner.take_method(channel_id, Deliver::matches)
        })?;
        match found {
            Some((idx, AMQPClass::Basic(AmqpBasic::Deliver(deliver)))) => {
                // the header and body are already on their way; don't cut them off at `timeout`
                let deadline = Instant::now() + self.options.rpc_timeout;
                let content = self.take_content(inner, channel_id, idx, deliver, deadline)?;
                Ok(Some(Delivery::new(channel_id, content)))
            }
            Some(_) => FrameUnexpectedSnafu.fail(),
            None => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn basic_publish(
        &self,
        channel_id: u16,
        content: &[u8],
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: &AmqpProperties,
    ) -> Result<()> {
        let result = {
            let mut inner = self.lock();
            inner
                .ensure_open(channel_id)
                .and_then(|()| {
                    inner.push_method(
                        channel_id,
                        AmqpBasic::Publish(Publish {
                            ticket: 0,
                            exchange: exchange.to_string(),
                            routing_key: routing_key.to_string(),
                            mandatory,
                            immediate,
                        }),
                    )?;
                    inner.push_content(channel_id, Publish::get_class_id(), content, properties)
                })
                .and_then(|()| self.flush(&mut inner))
        };
        self.observe(result)
    }

    pub fn basic_recover(&self, channel_id: u16, requeue: bool) -> Result<()> {
        let recover = AmqpBasic::Recover(Recover { requeue });
        self.call::<_, RecoverOk>(channel_id, recover, false)?;
        Ok(())
    }

    pub fn basic_qos(
        &self,
        channel_id: u16,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<()> {
        let qos = AmqpBasic::Qos(Qos {
            prefetch_size,
            prefetch_count,
            global,
        });
        self.call::<_, QosOk>(channel_id, qos, false)?;
        Ok(())
    }

    pub fn exchange_declare(
        &self,
        channel_id: u16,
        type_: ExchangeType,
        exchange: &str,
        passive: bool,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let nowait = options.nowait;
        let declare = AmqpExchange::Declare(options.into_declare(type_, exchange, passive));
        self.call::<_, ExchangeDeclareOk>(channel_id, declare, nowait)?;
        Ok(())
    }

    pub fn exchange_delete(
        &self,
        channel_id: u16,
        exchange: &str,
        if_unused: bool,
        nowait: bool,
    ) -> Result<()> {
        let delete = AmqpExchange::Delete(ExchangeDelete {
            ticket: 0,
            exchange: exchange.to_string(),
            if_unused,
            nowait,
        });
        self.call::<_, ExchangeDeleteOk>(channel_id, delete, nowait)?;
        Ok(())
    }

    // Queue topology is managed on the host side of a tunnel.
    fn ensure_topology_allowed(&self, operation: &'static str) -> Result<()> {
        if self.address.protocol() == Protocol::Tunnel {
            return TopologyNotSupportedSnafu { operation }.fail();
        }
        Ok(())
    }

    pub fn queue_bind(
        &self,
        channel_id: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        nowait: bool,
        arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_topology_allowed("queue.bind")?;
        let bind = AmqpQueue::Bind(Bind {
            ticket: 0,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            nowait,
            arguments,
        });
        self.call::<_, BindOk>(channel_id, bind, nowait)?;
        Ok(())
    }

    /// Declares a queue. Returns `None` when `options.nowait` is set.
    pub fn queue_declare(
        &self,
        channel_id: u16,
        queue: &str,
        passive: bool,
        options: QueueDeclareOptions,
    ) -> Result<Option<QueueDeclared>> {
        self.ensure_topology_allowed("queue.declare")?;
        let nowait = options.nowait;
        let declare = AmqpQueue::Declare(options.into_declare(queue, passive));
        let declare_ok = self.call::<_, QueueDeclareOk>(channel_id, declare, nowait)?;
        Ok(declare_ok.map(|ok| QueueDeclared {
            name: ok.queue,
            message_count: ok.message_count,
            consumer_count: ok.consumer_count,
        }))
    }

    /// Deletes a queue, returning the number of messages it held (`None` for nowait).
    pub fn queue_delete(
        &self,
        channel_id: u16,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<Option<u32>> {
        self.ensure_topology_allowed("queue.delete")?;
        let nowait = options.nowait;
        let delete = AmqpQueue::Delete(options.into_delete(queue));
        let delete_ok = self.call::<_, QueueDeleteOk>(channel_id, delete, nowait)?;
        Ok(delete_ok.map(|ok| ok.message_count))
    }

    /// Purges a queue, returning the number of messages removed (`None` for nowait).
    pub fn queue_purge(&self, channel_id: u16, queue: &str, nowait: bool) -> Result<Option<u32>> {
        let purge = AmqpQueue::Purge(Purge {
            ticket: 0,
            queue: queue.to_string(),
            nowait,
        });
        let purge_ok = self.call::<_, PurgeOk>(channel_id, purge, nowait)?;
        Ok(purge_ok.map(|ok| ok.message_count))
    }

    pub fn queue_unbind(
        &self,
        channel_id: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.ensure_topology_allowed("queue.unbind")?;
        let unbind = AmqpQueue::Unbind(Unbind {
            ticket: 0,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        });
        self.call::<_, UnbindOk>(channel_id, unbind, false)?;
        Ok(())
    }

    /// Closes every open channel (best effort), performs `connection.close`, and releases the
    /// transport. Does nothing if the connection is already closing or closed.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Connected => (),
            ConnectionState::Initialized | ConnectionState::Connecting => {
                return inner.state.advance(ConnectionState::Disconnected);
            }
        }
        inner.state.advance(ConnectionState::Disconnecting)?;
        debug!("closing connection to {}", self.address);

        for channel_id in inner.slots.ids() {
            let close = AmqpChannel::Close(ChannelClose {
                reply_code: REPLY_SUCCESS,
                reply_text: "goodbye".to_string(),
                class_id: 0,
                method_id: 0,
            });
            if let Err(err) = inner.push_method(channel_id, close) {
                warn!("failed to close channel {}: {}", channel_id, err);
            }
        }
        let close = AmqpConnection::Close(ConnectionClose {
            reply_code: REPLY_SUCCESS,
            reply_text: "goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        });
        if let Err(err) = inner.push_method(0, close) {
            warn!("failed to send connection close: {}", err);
        }

        let deadline = Instant::now() + self.options.close_timeout;
        let result = self.wait_until(inner, deadline, |inner| {
            Ok(if inner.close_ok_received {
                Some(())
            } else {
                None
            })
        });
        let mut inner = match result {
            Ok((inner, Some(()))) => inner,
            Ok((inner, None)) => {
                warn!("timed out waiting for connection close-ok");
                inner
            }
            Err(err) => {
                debug!("connection ended before close-ok: {}", err);
                self.lock()
            }
        };
        self.release_io(&mut inner);
        inner.slots.clear();
        if inner.state != ConnectionState::Disconnected {
            inner.state.advance(ConnectionState::Disconnected)?;
        }
        self.frames_ready.notify_all();
        debug!("closed connection to {}", self.address);
        Ok(())
    }
}
