// A scripted single-connection AMQP server good enough to drive the engine in tests.

use crate::errors::*;
use crate::frame_buffer::FrameBuffer;
use crate::serialize::OutputBuffer;
use crate::{Address, AmqpProperties, FieldTable, Protocol};
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::basic::AMQPMethod as AmqpBasic;
use amq_protocol::protocol::basic::{
    CancelOk, ConsumeOk, Deliver, GetEmpty, GetOk, QosOk, RecoverOk,
};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{
    Close as ChannelClose, CloseOk as ChannelCloseOk, OpenOk as ChannelOpenOk,
};
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{
    Close as ConnectionClose, CloseOk as ConnectionCloseOk, OpenOk as ConnectionOpenOk, Start,
    Tune,
};
use amq_protocol::protocol::exchange::AMQPMethod as AmqpExchange;
use amq_protocol::protocol::exchange::{
    DeclareOk as ExchangeDeclareOk, DeleteOk as ExchangeDeleteOk,
};
use amq_protocol::protocol::queue::AMQPMethod as AmqpQueue;
use amq_protocol::protocol::queue::{
    BindOk, DeclareOk as QueueDeclareOk, DeleteOk as QueueDeleteOk, PurgeOk, UnbindOk,
};
use amq_protocol::protocol::AMQPClass;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(super) const CHANNEL_MAX: u16 = 2047;
pub(super) const FRAME_MAX: u32 = 1 << 17;

const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Behavior {
    /// Completes the handshake and answers every request.
    Normal,
    /// Accepts the socket but never says anything.
    Silent,
    /// Answers start-ok with `connection.close` (403).
    RefuseLogin,
}

enum Command {
    CloseChannel {
        channel_id: u16,
        code: u16,
        text: String,
    },
    CloseConnection {
        code: u16,
        text: String,
    },
    Deliver {
        channel_id: u16,
        consumer_tag: String,
        delivery_tag: u64,
        body: Vec<u8>,
    },
    Hangup,
}

type Log = Arc<Mutex<Vec<(u16, &'static str)>>>;
type Held = Arc<Mutex<HashSet<u16>>>;

pub(super) struct FakeBroker {
    port: u16,
    commands: Sender<Command>,
    received: Log,
    held: Held,
}

impl FakeBroker {
    pub(super) fn start(behavior: Behavior) -> FakeBroker {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = unbounded();
        let received = Log::default();
        let log = Arc::clone(&received);
        let held = Held::default();
        let session_held = Arc::clone(&held);
        thread::Builder::new()
            .name("fake-broker".to_string())
            .spawn(move || {
                if let Ok((stream, _)) = listener.accept() {
                    let session = Session::new(stream, behavior, rx, log, session_held);
                    if let Err(err) = session.and_then(Session::run) {
                        debug!("fake broker session ended: {}", err);
                    }
                }
            })
            .unwrap();
        FakeBroker {
            port,
            commands: tx,
            received,
            held,
        }
    }

    pub(super) fn address(&self) -> Address {
        Address::new(Protocol::Plain, "127.0.0.1", self.port, "/").unwrap()
    }

    pub(super) fn close_channel(&self, channel_id: u16, code: u16, text: &str) {
        self.send(Command::CloseChannel {
            channel_id,
            code,
            text: text.to_string(),
        });
    }

    pub(super) fn close_connection(&self, code: u16, text: &str) {
        self.send(Command::CloseConnection {
            code,
            text: text.to_string(),
        });
    }

    pub(super) fn deliver(&self, channel_id: u16, consumer_tag: &str, delivery_tag: u64, body: &[u8]) {
        self.send(Command::Deliver {
            channel_id,
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            body: body.to_vec(),
        });
    }

    /// Stops answering methods on `channel_id` until `release_replies`. Held methods are
    /// logged as "held" and answered, in order, once released.
    pub(super) fn hold_replies(&self, channel_id: u16) {
        self.held.lock().unwrap().insert(channel_id);
    }

    pub(super) fn release_replies(&self, channel_id: u16) {
        self.held.lock().unwrap().remove(&channel_id);
    }

    pub(super) fn hangup(&self) {
        self.send(Command::Hangup);
    }

    fn send(&self, command: Command) {
        // the session may already be gone; tests assert on what the client sees instead
        let _ = self.commands.send(command);
    }

    /// Every method the client has sent so far, as (channel, "class.method").
    pub(super) fn received(&self) -> Vec<(u16, &'static str)> {
        self.received.lock().unwrap().clone()
    }

    /// Waits up to `timeout` for the client to send `method` on `channel_id`.
    pub(super) fn wait_for(&self, channel_id: u16, method: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .received()
                .iter()
                .any(|&(ch, name)| ch == channel_id && name == method)
            {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

struct Publishing {
    routing_key: String,
    body_size: Option<u64>,
    body: Vec<u8>,
}

struct Session {
    stream: TcpStream,
    behavior: Behavior,
    commands: Receiver<Command>,
    log: Log,
    held: Held,
    deferred: Vec<(u16, AMQPClass)>,
    out: OutputBuffer,
    publishing: HashMap<u16, Publishing>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    consumers: HashMap<String, (u16, String)>,
    next_delivery_tag: u64,
    next_name: u32,
    done: bool,
}

impl Session {
    fn new(
        stream: TcpStream,
        behavior: Behavior,
        commands: Receiver<Command>,
        log: Log,
        held: Held,
    ) -> Result<Session> {
        stream.set_nodelay(true).context(IoSnafu)?;
        Ok(Session {
            stream,
            behavior,
            commands,
            log,
            held,
            deferred: Vec::new(),
            out: OutputBuffer::empty(),
            publishing: HashMap::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            next_delivery_tag: 1,
            next_name: 1,
            done: false,
        })
    }

    fn run(mut self) -> Result<()> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).context(IoSnafu)?;
        assert_eq!(&header, b"AMQP\x00\x00\x09\x01");

        if self.behavior == Behavior::Silent {
            let mut sink = [0u8; 256];
            while self.stream.read(&mut sink).context(IoSnafu)? > 0 {}
            return Ok(());
        }

        self.stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context(IoSnafu)?;
        self.out.push_method(
            0,
            AmqpConnection::Start(Start {
                version_major: 0,
                version_minor: 9,
                server_properties: FieldTable::new(),
                mechanisms: "PLAIN AMQPLAIN".to_string(),
                locales: "en_US".to_string(),
            }),
        )?;
        self.flush()?;

        let mut frames = FrameBuffer::new();
        while !self.done {
            let commands: Vec<_> = self.commands.try_iter().collect();
            for command in commands {
                if !self.command(command)? {
                    return Ok(());
                }
            }
            self.answer_released()?;
            self.flush()?;

            let mut received = Vec::new();
            let read = frames.read_from(&mut self.stream, |frame| {
                received.push(frame);
                Ok(())
            });
            for frame in received {
                self.frame(frame)?;
            }
            self.flush()?;
            read?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.out.is_empty() {
            self.stream.write_all(&self.out[0..]).context(IoSnafu)?;
            self.out.clear();
        }
        Ok(())
    }

    fn record(&self, channel_id: u16, method: &'static str) {
        trace!("fake broker received {} on channel {}", method, channel_id);
        self.log.lock().unwrap().push((channel_id, method));
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        let name = format!("{}-{}", prefix, self.next_name);
        self.next_name += 1;
        name
    }

    // Returns false if the session should end right away.
    fn command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::CloseChannel {
                channel_id,
                code,
                text,
            } => self.out.push_method(
                channel_id,
                AmqpChannel::Close(ChannelClose {
                    reply_code: code,
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                }),
            )?,
            Command::CloseConnection { code, text } => self.out.push_method(
                0,
                AmqpConnection::Close(ConnectionClose {
                    reply_code: code,
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                }),
            )?,
            Command::Deliver {
                channel_id,
                consumer_tag,
                delivery_tag,
                body,
            } => self.push_deliver(channel_id, consumer_tag, delivery_tag, "", &body)?,
            Command::Hangup => return Ok(false),
        }
        Ok(true)
    }

    fn push_content(&mut self, channel_id: u16, body: &[u8]) -> Result<()> {
        self.out
            .push_content_header(channel_id, 60, body.len(), &AmqpProperties::default())?;
        if !body.is_empty() {
            self.out.push_content_body(channel_id, body)?;
        }
        Ok(())
    }

    fn push_deliver(
        &mut self,
        channel_id: u16,
        consumer_tag: String,
        delivery_tag: u64,
        routing_key: &str,
        body: &[u8],
    ) -> Result<()> {
        self.out.push_method(
            channel_id,
            AmqpBasic::Deliver(Deliver {
                consumer_tag,
                delivery_tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: routing_key.to_string(),
            }),
        )?;
        self.push_content(channel_id, body)
    }

    // Routes a fully received publish straight to its queue (default exchange semantics).
    fn published(&mut self, publishing: Publishing) -> Result<()> {
        let Publishing {
            routing_key, body, ..
        } = publishing;
        match self.consumers.get(&routing_key).cloned() {
            Some((channel_id, consumer_tag)) => {
                let delivery_tag = self.next_delivery_tag;
                self.next_delivery_tag += 1;
                self.push_deliver(channel_id, consumer_tag, delivery_tag, &routing_key, &body)
            }
            None => {
                self.queues.entry(routing_key).or_default().push_back(body);
                Ok(())
            }
        }
    }

    fn frame(&mut self, frame: AMQPFrame) -> Result<()> {
        match frame {
            AMQPFrame::Method(channel_id, class) => self.method(channel_id, class),
            AMQPFrame::Header(channel_id, _, header) => {
                let complete = match self.publishing.get_mut(&channel_id) {
                    Some(publishing) => {
                        publishing.body_size = Some(header.body_size);
                        header.body_size == 0
                    }
                    None => false,
                };
                if complete {
                    if let Some(publishing) = self.publishing.remove(&channel_id) {
                        self.published(publishing)?;
                    }
                }
                Ok(())
            }
            AMQPFrame::Body(channel_id, body) => {
                let complete = match self.publishing.get_mut(&channel_id) {
                    Some(publishing) => {
                        publishing.body.extend_from_slice(&body);
                        publishing.body_size == Some(publishing.body.len() as u64)
                    }
                    None => false,
                };
                if complete {
                    if let Some(publishing) = self.publishing.remove(&channel_id) {
                        self.published(publishing)?;
                    }
                }
                Ok(())
            }
            AMQPFrame::Heartbeat(_) | AMQPFrame::ProtocolHeader => Ok(()),
        }
    }

    // Answers deferred methods whose channel is no longer held.
    fn answer_released(&mut self) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        let held = self.held.lock().unwrap().clone();
        let (still_held, released): (Vec<_>, Vec<_>) = self
            .deferred
            .drain(..)
            .partition(|(channel_id, _)| held.contains(channel_id));
        self.deferred = still_held;
        for (channel_id, class) in released {
            self.method(channel_id, class)?;
        }
        Ok(())
    }

    fn method(&mut self, channel_id: u16, class: AMQPClass) -> Result<()> {
        let behind = self.deferred.iter().any(|&(ch, _)| ch == channel_id);
        if channel_id != 0 && (behind || self.held.lock().unwrap().contains(&channel_id)) {
            self.record(channel_id, "held");
            self.deferred.push((channel_id, class));
            return Ok(());
        }
        match class {
            AMQPClass::Connection(method) => self.connection_method(method),
            AMQPClass::Channel(method) => self.channel_method(channel_id, method),
            AMQPClass::Exchange(method) => self.exchange_method(channel_id, method),
            AMQPClass::Queue(method) => self.queue_method(channel_id, method),
            AMQPClass::Basic(method) => self.basic_method(channel_id, method),
            other => panic!("fake broker cannot handle {:?}", other),
        }
    }

    fn connection_method(&mut self, method: AmqpConnection) -> Result<()> {
        match method {
            AmqpConnection::StartOk(_) => {
                self.record(0, "connection.start-ok");
                if self.behavior == Behavior::RefuseLogin {
                    self.out.push_method(
                        0,
                        AmqpConnection::Close(ConnectionClose {
                            reply_code: 403,
                            reply_text: "ACCESS_REFUSED - Login was refused".to_string(),
                            class_id: 0,
                            method_id: 0,
                        }),
                    )?;
                } else {
                    self.out.push_method(
                        0,
                        AmqpConnection::Tune(Tune {
                            channel_max: CHANNEL_MAX,
                            frame_max: FRAME_MAX,
                            heartbeat: 0,
                        }),
                    )?;
                }
            }
            AmqpConnection::TuneOk(_) => self.record(0, "connection.tune-ok"),
            AmqpConnection::Open(_) => {
                self.record(0, "connection.open");
                self.out.push_method(
                    0,
                    AmqpConnection::OpenOk(ConnectionOpenOk {
                        known_hosts: String::new(),
                    }),
                )?;
            }
            AmqpConnection::Close(_) => {
                self.record(0, "connection.close");
                self.out
                    .push_method(0, AmqpConnection::CloseOk(ConnectionCloseOk {}))?;
                self.done = true;
            }
            AmqpConnection::CloseOk(_) => {
                self.record(0, "connection.close-ok");
                self.done = true;
            }
            other => panic!("fake broker cannot handle {:?}", other),
        }
        Ok(())
    }

    fn channel_method(&mut self, channel_id: u16, method: AmqpChannel) -> Result<()> {
        match method {
            AmqpChannel::Open(_) => {
                self.record(channel_id, "channel.open");
                self.out.push_method(
                    channel_id,
                    AmqpChannel::OpenOk(ChannelOpenOk {
                        channel_id: String::new(),
                    }),
                )?;
            }
            AmqpChannel::Close(_) => {
                self.record(channel_id, "channel.close");
                self.publishing.remove(&channel_id);
                self.consumers.retain(|_, (ch, _)| *ch != channel_id);
                self.out
                    .push_method(channel_id, AmqpChannel::CloseOk(ChannelCloseOk {}))?;
            }
            AmqpChannel::CloseOk(_) => {
                self.record(channel_id, "channel.close-ok");
                self.consumers.retain(|_, (ch, _)| *ch != channel_id);
            }
            other => panic!("fake broker cannot handle {:?}", other),
        }
        Ok(())
    }

    fn exchange_method(&mut self, channel_id: u16, method: AmqpExchange) -> Result<()> {
        match method {
            AmqpExchange::Declare(declare) => {
                self.record(channel_id, "exchange.declare");
                if !declare.nowait {
                    self.out
                        .push_method(channel_id, AmqpExchange::DeclareOk(ExchangeDeclareOk {}))?;
                }
            }
            AmqpExchange::Delete(delete) => {
                self.record(channel_id, "exchange.delete");
                if !delete.nowait {
                    self.out
                        .push_method(channel_id, AmqpExchange::DeleteOk(ExchangeDeleteOk {}))?;
                }
            }
            other => panic!("fake broker cannot handle {:?}", other),
        }
        Ok(())
    }

    fn queue_method(&mut self, channel_id: u16, method: AmqpQueue) -> Result<()> {
        match method {
            AmqpQueue::Declare(declare) => {
                self.record(channel_id, "queue.declare");
                let name = if declare.queue.is_empty() {
                    self.fresh_name("amq.gen")
                } else {
                    declare.queue
                };
                let message_count = self.queues.entry(name.clone()).or_default().len() as u32;
                let consumer_count = if self.consumers.contains_key(&name) { 1 } else { 0 };
                if !declare.nowait {
                    self.out.push_method(
                        channel_id,
                        AmqpQueue::DeclareOk(QueueDeclareOk {
                            queue: name,
                            message_count,
                            consumer_count,
                        }),
                    )?;
                }
            }
            AmqpQueue::Bind(bind) => {
                self.record(channel_id, "queue.bind");
                if !bind.nowait {
                    self.out.push_method(channel_id, AmqpQueue::BindOk(BindOk {}))?;
                }
            }
            AmqpQueue::Unbind(_) => {
                self.record(channel_id, "queue.unbind");
                self.out
                    .push_method(channel_id, AmqpQueue::UnbindOk(UnbindOk {}))?;
            }
            AmqpQueue::Purge(purge) => {
                self.record(channel_id, "queue.purge");
                let message_count = self
                    .queues
                    .get_mut(&purge.queue)
                    .map(|queue| queue.drain(..).count() as u32)
                    .unwrap_or(0);
                if !purge.nowait {
                    self.out
                        .push_method(channel_id, AmqpQueue::PurgeOk(PurgeOk { message_count }))?;
                }
            }
            AmqpQueue::Delete(delete) => {
                self.record(channel_id, "queue.delete");
                let message_count = self
                    .queues
                    .remove(&delete.queue)
                    .map(|queue| queue.len() as u32)
                    .unwrap_or(0);
                if !delete.nowait {
                    self.out.push_method(
                        channel_id,
                        AmqpQueue::DeleteOk(QueueDeleteOk { message_count }),
                    )?;
                }
            }
            other => panic!("fake broker cannot handle {:?}", other),
        }
        Ok(())
    }

    fn basic_method(&mut self, channel_id: u16, method: AmqpBasic) -> Result<()> {
        match method {
            AmqpBasic::Qos(_) => {
                self.record(channel_id, "basic.qos");
                self.out.push_method(channel_id, AmqpBasic::QosOk(QosOk {}))?;
            }
            AmqpBasic::Consume(consume) => {
                self.record(channel_id, "basic.consume");
                let consumer_tag = if consume.consumer_tag.is_empty() {
                    self.fresh_name("amq.ctag")
                } else {
                    consume.consumer_tag
                };
                self.consumers
                    .insert(consume.queue.clone(), (channel_id, consumer_tag.clone()));
                if !consume.nowait {
                    self.out.push_method(
                        channel_id,
                        AmqpBasic::ConsumeOk(ConsumeOk {
                            consumer_tag: consumer_tag.clone(),
                        }),
                    )?;
                }
                let backlog: Vec<_> = self
                    .queues
                    .get_mut(&consume.queue)
                    .map(|queue| queue.drain(..).collect())
                    .unwrap_or_default();
                for body in backlog {
                    let delivery_tag = self.next_delivery_tag;
                    self.next_delivery_tag += 1;
                    self.push_deliver(
                        channel_id,
                        consumer_tag.clone(),
                        delivery_tag,
                        &consume.queue,
                        &body,
                    )?;
                }
            }
            AmqpBasic::Cancel(cancel) => {
                self.record(channel_id, "basic.cancel");
                let tag = cancel.consumer_tag.clone();
                self.consumers.retain(|_, (_, consumer_tag)| *consumer_tag != tag);
                if !cancel.nowait {
                    self.out.push_method(
                        channel_id,
                        AmqpBasic::CancelOk(CancelOk {
                            consumer_tag: cancel.consumer_tag,
                        }),
                    )?;
                }
            }
            AmqpBasic::Get(get) => {
                self.record(channel_id, "basic.get");
                let (body, message_count) = match self.queues.get_mut(&get.queue) {
                    Some(queue) => (queue.pop_front(), queue.len() as u32),
                    None => (None, 0),
                };
                match body {
                    Some(body) => {
                        let delivery_tag = self.next_delivery_tag;
                        self.next_delivery_tag += 1;
                        self.out.push_method(
                            channel_id,
                            AmqpBasic::GetOk(GetOk {
                                delivery_tag,
                                redelivered: false,
                                exchange: String::new(),
                                routing_key: get.queue,
                                message_count,
                            }),
                        )?;
                        self.push_content(channel_id, &body)?;
                    }
                    None => self.out.push_method(
                        channel_id,
                        AmqpBasic::GetEmpty(GetEmpty {
                            cluster_id: String::new(),
                        }),
                    )?,
                }
            }
            AmqpBasic::Publish(publish) => {
                self.record(channel_id, "basic.publish");
                self.publishing.insert(
                    channel_id,
                    Publishing {
                        routing_key: publish.routing_key,
                        body_size: None,
                        body: Vec::new(),
                    },
                );
            }
            AmqpBasic::Ack(_) => self.record(channel_id, "basic.ack"),
            AmqpBasic::Recover(_) => {
                self.record(channel_id, "basic.recover");
                self.out
                    .push_method(channel_id, AmqpBasic::RecoverOk(RecoverOk {}))?;
            }
            other => panic!("fake broker cannot handle {:?}", other),
        }
        Ok(())
    }
}
