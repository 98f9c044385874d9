use crate::consumer_dispatch::panic_message;
use crate::errors::*;
use crate::wire::{sleep_unless_shutdown, ChannelWireConnection, ConnectionState, ConnectionTuning};
use crate::{
    Address, AuthMechanism, CertInfo, Channel, ChannelManager, ConnectionOptions,
    ConsumerDispatch,
};
use log::{debug, error, warn};
use snafu::ResultExt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

// Pause before recreating the wire connection after a failed connect.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

// Bound on each steady-state wait for socket readiness.
const IO_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct EngineConfig {
    address: Address,
    auth: AuthMechanism,
    cert_info: Option<CertInfo>,
    options: ConnectionOptions,
}

impl EngineConfig {
    fn new_wire(&self) -> Result<ChannelWireConnection> {
        ChannelWireConnection::new(
            self.address.clone(),
            self.auth.clone(),
            self.cert_info.clone(),
            self.options.clone(),
        )
    }
}

enum Startup {
    Pending,
    Connected,
    Failed(Error),
}

struct EngineState {
    config: Option<Arc<EngineConfig>>,
    wire: Option<Arc<ChannelWireConnection>>,
    channel_manager: Option<ChannelManager>,
    dispatch: Option<Arc<ConsumerDispatch>>,
    tuning: Option<ConnectionTuning>,
    startup: Startup,
    was_started: bool,
    is_running: bool,
    was_close_called: bool,
}

struct Shared {
    state: Mutex<EngineState>,
    startup: Condvar,
    should_shutdown: AtomicBool,
}

impl Shared {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    fn shutdown_requested(&self) -> bool {
        self.should_shutdown.load(Ordering::SeqCst)
    }
}

/// An AMQP connection driven by a dedicated background I/O thread.
///
/// The lifecycle is `new` → [`init`](#method.init) → [`start`](#method.start) → (channels) →
/// [`close`](#method.close). `close` must be called before the `Connection` is dropped;
/// dropping an initialized connection without closing it is logged as an error and the
/// connection is closed anyway.
///
/// # Example
///
/// ```rust,no_run
/// use amqp_engine::{Address, Connection, ConnectionOptions, Protocol, Result};
///
/// # fn run() -> Result<()> {
/// let address = Address::new(Protocol::Plain, "localhost", 5672, "/")?;
/// let connection = Connection::new();
/// connection.init("guest", "guest", address, None, ConnectionOptions::default())?;
/// connection.start()?;
///
/// let channel = connection.create_channel()?;
/// channel.basic_publish("hello", "", "hello", false, false, &Default::default())?;
///
/// connection.close()
/// # }
/// ```
pub struct Connection {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let (initialized, was_close_called) = {
            let state = self.shared.lock();
            (state.config.is_some(), state.was_close_called)
        };
        if initialized && !was_close_called {
            error!("connection dropped without calling close(); closing it now");
            if let Err(err) = self.close() {
                error!("failed to close dropped connection: {}", err);
            }
        }
    }
}

impl Connection {
    pub fn new() -> Connection {
        Connection {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    config: None,
                    wire: None,
                    channel_manager: None,
                    dispatch: None,
                    tuning: None,
                    startup: Startup::Pending,
                    was_started: false,
                    is_running: false,
                    was_close_called: false,
                }),
                startup: Condvar::new(),
                should_shutdown: AtomicBool::new(false),
            }),
            io_thread: Mutex::new(None),
        }
    }

    /// Validates credentials, stores the configuration, allocates the (unconnected) wire
    /// connection and starts the consumer worker pool. Must be called exactly once, before
    /// [`start`](#method.start).
    pub fn init(
        &self,
        username: &str,
        password: &str,
        address: Address,
        cert_info: Option<CertInfo>,
        options: ConnectionOptions,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        if state.config.is_some() {
            return AlreadyInitializedSnafu.fail();
        }
        let auth = AuthMechanism::new(username, password)?;
        let config = EngineConfig {
            address,
            auth,
            cert_info,
            options,
        };
        let wire = config.new_wire()?;
        let dispatch = ConsumerDispatch::new(
            config.options.consumer_threads,
            config.options.consumer_queue_depth,
        )?;
        debug!("initialized connection to {}", config.address);
        state.config = Some(Arc::new(config));
        state.wire = Some(Arc::new(wire));
        state.dispatch = Some(Arc::new(dispatch));
        Ok(())
    }

    /// Starts the background I/O thread and waits (up to the configured connection timeout)
    /// for it to connect.
    ///
    /// Returns `Ok` only if the thread reported a successful connect in time. A failure the
    /// thread hits first is returned as is; otherwise the thread is stopped and joined and
    /// `ConnectionTimeout` is returned.
    pub fn start(&self) -> Result<()> {
        let config = {
            let mut state = self.shared.lock();
            let config = match &state.config {
                Some(config) => Arc::clone(config),
                None => return NotInitializedSnafu.fail(),
            };
            if state.was_started {
                return AlreadyStartedSnafu.fail();
            }
            if state.was_close_called {
                return ConnectionClosedSnafu.fail();
            }
            state.was_started = true;
            config
        };

        let shared = Arc::clone(&self.shared);
        let io_thread = Builder::new()
            .name("amqp-engine-io".to_string())
            .spawn(move || io_thread_main(shared))
            .context(ForkFailedSnafu)?;
        *self.io_thread.lock().unwrap() = Some(io_thread);

        let timeout = config.options.connection_timeout;
        let deadline = Instant::now() + timeout;
        let failure = {
            let mut state = self.shared.lock();
            loop {
                match state.startup {
                    Startup::Connected => return Ok(()),
                    Startup::Failed(_) => {
                        break mem::replace(&mut state.startup, Startup::Pending);
                    }
                    Startup::Pending => (),
                }
                let now = Instant::now();
                if now >= deadline {
                    break Startup::Pending;
                }
                state = self
                    .shared
                    .startup
                    .wait_timeout(state, deadline - now)
                    .unwrap()
                    .0;
            }
        };

        match failure {
            Startup::Failed(err) => {
                self.join_io_thread();
                Err(err)
            }
            _ => {
                warn!(
                    "timed out after {:?} connecting to {}",
                    timeout, config.address
                );
                self.shared.should_shutdown.store(true, Ordering::SeqCst);
                self.join_io_thread();
                ConnectionTimeoutSnafu {
                    address: config.address.to_string(),
                    timeout,
                }
                .fail()
            }
        }
    }

    fn join_io_thread(&self) {
        let io_thread = self.io_thread.lock().unwrap().take();
        if let Some(io_thread) = io_thread {
            if io_thread.join().is_err() {
                error!("I/O thread panicked");
            }
        }
    }

    /// Opens a new channel.
    pub fn create_channel(&self) -> Result<Channel> {
        let (manager, wire) = {
            let state = self.shared.lock();
            if !state.is_running {
                return ConnectionClosedSnafu.fail();
            }
            match (&state.channel_manager, &state.wire) {
                (Some(manager), Some(wire)) => (manager.clone(), Arc::clone(wire)),
                _ => return ConnectionClosedSnafu.fail(),
            }
        };
        manager.create_channel(&wire)
    }

    /// Closes `channel`. Fails with `NotRunning` if the connection is not running.
    pub fn close_channel(&self, channel: &Channel) -> Result<()> {
        let manager = {
            let state = self.shared.lock();
            match (&state.channel_manager, state.is_running) {
                (Some(manager), true) => manager.clone(),
                _ => return NotRunningSnafu.fail(),
            }
        };
        let channel_id = channel.channel_id();
        manager.close_channel(channel_id, ClientClosedChannelSnafu { channel_id }.build())
    }

    /// Shuts the connection down: stops consumer dispatch, stops and joins the I/O thread,
    /// then waits until every channel has been closed. Calling `close` again does nothing.
    pub fn close(&self) -> Result<()> {
        let dispatch = {
            let mut state = self.shared.lock();
            if state.was_close_called {
                return Ok(());
            }
            state.was_close_called = true;
            state.dispatch.clone()
        };
        debug!("closing connection");
        self.shared.should_shutdown.store(true, Ordering::SeqCst);
        if let Some(dispatch) = dispatch {
            dispatch.notify_connection_closed();
        }
        self.join_io_thread();

        let (manager, wire) = {
            let mut state = self.shared.lock();
            state.is_running = false;
            (state.channel_manager.clone(), state.wire.take())
        };
        // only left behind if the I/O thread never took it over
        if let Some(wire) = wire {
            if let Err(err) = wire.close() {
                debug!("failed to close wire connection: {}", err);
            }
        }
        if let Some(manager) = manager {
            manager.wait_until_drained();
        }
        debug!("connection closed");
        Ok(())
    }

    /// True while the background thread is running a connected session and `close` has not
    /// been called.
    pub fn is_open(&self) -> bool {
        let state = self.shared.lock();
        state.is_running && !state.was_close_called
    }

    pub fn open_channel_count(&self) -> usize {
        let manager = self.shared.lock().channel_manager.clone();
        manager.map_or(0, |manager| manager.open_channel_count())
    }

    /// Channel max, frame max and heartbeat agreed with the server.
    pub fn negotiated(&self) -> Option<ConnectionTuning> {
        self.shared.lock().tuning
    }

    pub fn address(&self) -> Option<Address> {
        let state = self.shared.lock();
        state.config.as_ref().map(|config| config.address.clone())
    }

    /// The wire connection currently in use, if any.
    pub fn wire(&self) -> Option<Arc<ChannelWireConnection>> {
        self.shared.lock().wire.clone()
    }

    /// Runs `task` on the consumer worker pool.
    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<()> {
        let dispatch = self.shared.lock().dispatch.clone();
        match dispatch {
            Some(dispatch) => dispatch.add_work(task),
            None => NotInitializedSnafu.fail(),
        }
    }
}

fn io_thread_main(shared: Arc<Shared>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| run(&shared))) {
        let message = panic_message(&*payload);
        error!("I/O thread panicked: {}", message);
        let manager = {
            let mut state = shared.lock();
            state.is_running = false;
            if let Startup::Pending = state.startup {
                state.startup = Startup::Failed(
                    IoThreadPanicSnafu {
                        message: message.clone(),
                    }
                    .build(),
                );
            }
            shared.startup.notify_all();
            state.channel_manager.clone()
        };
        if let Some(manager) = manager {
            manager.notify_connection_close(IoThreadPanicSnafu { message }.build());
        }
    }
}

fn run(shared: &Shared) {
    let wire = match connect(shared) {
        Ok(wire) => wire,
        Err(err) => {
            debug!("I/O thread exiting before connecting: {}", err);
            let mut state = shared.lock();
            state.startup = Startup::Failed(err);
            shared.startup.notify_all();
            return;
        }
    };
    let reason = steady_state(shared, &wire);
    shutdown(shared, &wire, reason);
}

// Connects the current wire connection, replacing it with a fresh one after every I/O failure
// until we connect, hit a non-I/O failure, or are asked to shut down.
fn connect(shared: &Shared) -> Result<Arc<ChannelWireConnection>> {
    let (config, mut wire) = {
        let state = shared.lock();
        match (&state.config, &state.wire) {
            (Some(config), Some(wire)) => (Arc::clone(config), Arc::clone(wire)),
            _ => return NotInitializedSnafu.fail(),
        }
    };

    loop {
        match wire.connect(&shared.should_shutdown) {
            Ok(tuning) => {
                let mut state = shared.lock();
                if shared.shutdown_requested() {
                    drop(state);
                    let _ = wire.close();
                    return ConnectAbortedSnafu.fail();
                }
                debug!(
                    "connected to {} (channel_max={}, frame_max={}, heartbeat={})",
                    config.address, tuning.channel_max, tuning.frame_max, tuning.heartbeat
                );
                state.tuning = Some(tuning);
                state.channel_manager = Some(ChannelManager::new());
                state.is_running = true;
                state.startup = Startup::Connected;
                shared.startup.notify_all();
                return Ok(wire);
            }
            Err(err) if err.is_io() && !shared.shutdown_requested() => {
                warn!("connecting to {} failed ({}); retrying", config.address, err);
                sleep_unless_shutdown(RECONNECT_DELAY, &shared.should_shutdown)?;
                wire = Arc::new(config.new_wire()?);
                shared.lock().wire = Some(Arc::clone(&wire));
            }
            Err(err) => return Err(err),
        }
    }
}

// Drives I/O until shutdown is requested or the connection drops; returns why it stopped.
fn steady_state(shared: &Shared, wire: &ChannelWireConnection) -> Error {
    let manager = shared.lock().channel_manager.clone();
    loop {
        if shared.shutdown_requested() {
            return ClientClosedConnectionSnafu.build();
        }
        let result = wire
            .wait_for_io(IO_POLL_INTERVAL)
            .and_then(|()| wire.process_io());
        if let Some(manager) = &manager {
            for (channel_id, reason) in wire.take_server_closed_channels() {
                manager.remove_channel(channel_id, reason);
            }
        }
        if shared.shutdown_requested() {
            return ClientClosedConnectionSnafu.build();
        }
        if let Err(err) = result {
            return exit_reason(wire, err);
        }
        if wire.state() != ConnectionState::Connected {
            return exit_reason(wire, ConnectionClosedSnafu.build());
        }
    }
}

fn exit_reason(wire: &ChannelWireConnection, err: Error) -> Error {
    if let Some((code, message)) = wire.server_close_reason() {
        return ServerClosedConnectionSnafu { code, message }.build();
    }
    if let Some(reason) = wire.loss_reason() {
        return IoInterruptedSnafu { reason }.build();
    }
    err
}

fn shutdown(shared: &Shared, wire: &ChannelWireConnection, reason: Error) {
    if shared.shutdown_requested() {
        debug!("shutting down connection to {}", wire.address());
    } else {
        error!(
            "connection to {} closed unexpectedly: {}",
            wire.address(),
            reason
        );
    }
    let manager = {
        let mut state = shared.lock();
        state.is_running = false;
        state.channel_manager.clone()
    };
    if let Some(manager) = manager {
        manager.notify_connection_close(reason);
    }
    if let Err(err) = wire.close() {
        debug!("failed to close wire connection: {}", err);
    }
    shared.lock().wire = None;
}
