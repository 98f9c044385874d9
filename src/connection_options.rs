use crate::errors::*;
use crate::Sasl;
use amq_protocol::protocol::connection::{Open, Start, StartOk, Tune, TuneOk};
use amq_protocol::protocol::constants::FRAME_MIN_SIZE;
use amq_protocol::types::{AMQPValue, FieldTable};
use log::warn;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked (once per loss event) when an established connection is lost, with a
/// free-text reason. Hosts use it to restart whatever listener depends on the connection.
///
/// The default hook only logs. Two default hooks compare equal; custom hooks are equal only
/// to clones of themselves.
#[derive(Clone, Default)]
pub struct ListenerRestartHook(Option<Arc<dyn Fn(&str) + Send + Sync>>);

impl ListenerRestartHook {
    pub fn new<F: Fn(&str) + Send + Sync + 'static>(f: F) -> Self {
        ListenerRestartHook(Some(Arc::new(f)))
    }

    pub(crate) fn notify(&self, reason: &str) {
        match &self.0 {
            Some(f) => f(reason),
            None => warn!("connection lost ({}); listener restart requested", reason),
        }
    }
}

impl fmt::Debug for ListenerRestartHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("ListenerRestartHook(custom)"),
            None => f.write_str("ListenerRestartHook(default)"),
        }
    }
}

impl PartialEq for ListenerRestartHook {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Options that control the overall AMQP connection and the engine driving it.
///
/// `ConnectionOptions` uses the builder pattern. The default settings are equivalent to
///
/// ```rust
/// use amqp_engine::ConnectionOptions;
/// use std::time::Duration;
///
/// # fn default_connection_options() -> ConnectionOptions {
/// ConnectionOptions::default()
///     .locale("en_US")
///     .channel_max(0)
///     .frame_max(0)
///     .heartbeat(60)
///     .connection_timeout(Duration::from_secs(30))
///     .retries(3)
///     .retry_wait(Duration::from_secs(1))
///     .consumer_threads(4)
///     .consumer_queue_depth(100)
///     .rpc_timeout(Duration::from_secs(30))
///     .close_timeout(Duration::from_secs(2))
///     .information(None)
/// # }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionOptions {
    pub(crate) locale: String,
    pub(crate) channel_max: u16,
    pub(crate) frame_max: u32,
    pub(crate) heartbeat: u16,
    pub(crate) connection_timeout: Duration,
    pub(crate) retries: u32,
    pub(crate) retry_wait: Duration,
    pub(crate) consumer_threads: usize,
    pub(crate) consumer_queue_depth: usize,
    pub(crate) rpc_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) restart_hook: ListenerRestartHook,
    information: Option<String>,
}

impl Default for ConnectionOptions {
    // NOTE: If we change this, make sure to change the doc comment above.
    fn default() -> Self {
        ConnectionOptions {
            locale: "en_US".to_string(),
            channel_max: 0,
            frame_max: 0,
            heartbeat: 60,
            connection_timeout: Duration::from_secs(30),
            retries: 3,
            retry_wait: Duration::from_secs(1),
            consumer_threads: 4,
            consumer_queue_depth: 100,
            rpc_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(2),
            restart_hook: ListenerRestartHook::default(),
            information: None,
        }
    }
}

impl ConnectionOptions {
    /// Sets the locale. AMQP requires servers support the `en_US` locale (which is also the
    /// default locale for `ConnectionOptions`).
    pub fn locale<T: Into<String>>(self, locale: T) -> Self {
        ConnectionOptions {
            locale: locale.into(),
            ..self
        }
    }

    /// Sets the maximum number of channels that can be opened on this connection. Setting this
    /// value to 0 means to let the server choose. If this value is set to a nonzero value that is
    /// different from the server's requested value, the lower of the two will be used.
    ///
    /// Channel numbers are never reused on a connection, so this also bounds the total number of
    /// channels that can be opened over the connection's lifetime.
    pub fn channel_max(self, channel_max: u16) -> Self {
        ConnectionOptions {
            channel_max,
            ..self
        }
    }

    /// Sets the maximum size in bytes of frames used for this connection. Setting this value to 0
    /// means to let the server choose. If this value is set to a nonzero value that is different
    /// from the server's requested value, the lower of the two will be used.
    ///
    /// AMQP specifies a minimum frame_max of 4096; attempting to set a value lower than this will
    /// result in an error when attempting to open the connection.
    pub fn frame_max(self, frame_max: u32) -> Self {
        ConnectionOptions { frame_max, ..self }
    }

    /// Sets the heartbeat interval in seconds. Setting this value to 0 disables heartbeats. If
    /// this value is greater than 0 but different than the server's requested heartbeat interval,
    /// the lower of the two will be used.
    pub fn heartbeat(self, heartbeat: u16) -> Self {
        ConnectionOptions { heartbeat, ..self }
    }

    /// Sets how long [`Connection::start`](crate::Connection::start) waits for the background
    /// thread to finish connecting before giving up with a connection timeout.
    pub fn connection_timeout(self, connection_timeout: Duration) -> Self {
        ConnectionOptions {
            connection_timeout,
            ..self
        }
    }

    /// Sets how many socket-open attempts a single connect makes before failing.
    pub fn retries(self, retries: u32) -> Self {
        ConnectionOptions {
            retries: retries.max(1),
            ..self
        }
    }

    /// Sets how long each socket-open attempt may take, which is also the pause between attempts.
    pub fn retry_wait(self, retry_wait: Duration) -> Self {
        ConnectionOptions { retry_wait, ..self }
    }

    /// Same as [`retry_wait`](#method.retry_wait) in whole seconds.
    pub fn seconds_to_wait(self, seconds: u64) -> Self {
        self.retry_wait(Duration::from_secs(seconds))
    }

    /// Sets the number of worker threads executing consumer work.
    pub fn consumer_threads(self, consumer_threads: usize) -> Self {
        ConnectionOptions {
            consumer_threads: consumer_threads.max(1),
            ..self
        }
    }

    /// Sets how many consumer tasks may be queued before `dispatch` blocks.
    pub fn consumer_queue_depth(self, consumer_queue_depth: usize) -> Self {
        ConnectionOptions {
            consumer_queue_depth,
            ..self
        }
    }

    /// Sets how long synchronous methods (declare, bind, consume, ...) wait for their reply.
    pub fn rpc_timeout(self, rpc_timeout: Duration) -> Self {
        ConnectionOptions {
            rpc_timeout,
            ..self
        }
    }

    /// Sets how long closing the connection waits for the server's close-ok.
    pub fn close_timeout(self, close_timeout: Duration) -> Self {
        ConnectionOptions {
            close_timeout,
            ..self
        }
    }

    /// Sets the hook invoked when an established connection is lost.
    pub fn restart_hook(self, restart_hook: ListenerRestartHook) -> Self {
        ConnectionOptions {
            restart_hook,
            ..self
        }
    }

    /// Sets the "information" string reported during handshaking to the server. This string
    /// is displayed in the RabbitMQ management interface under "Client properties" of a
    /// connection.
    pub fn information(self, information: Option<String>) -> Self {
        ConnectionOptions {
            information,
            ..self
        }
    }

    pub(crate) fn make_start_ok<Auth: Sasl>(&self, auth: &Auth, start: Start) -> Result<StartOk> {
        // helper to search space-separated strings (mechanisms and locales)
        fn server_supports(server: &str, client: &str) -> bool {
            server.split(' ').any(|s| s == client)
        }

        let mechanism = auth.mechanism();
        if !server_supports(&start.mechanisms, &mechanism) {
            return UnsupportedAuthMechanismSnafu {
                available: start.mechanisms.clone(),
                requested: mechanism,
            }
            .fail();
        }
        if !server_supports(&start.locales, &self.locale) {
            return UnsupportedLocaleSnafu {
                available: start.locales.clone(),
                requested: self.locale.clone(),
            }
            .fail();
        }

        let mut client_properties = FieldTable::new();
        let mut set_prop = |k: &str, v: String| {
            client_properties.insert(k.to_string(), AMQPValue::LongString(v));
        };
        set_prop("product", crate::built_info::PKG_NAME.to_string());
        set_prop("version", crate::built_info::PKG_VERSION.to_string());
        set_prop(
            "platform",
            format!(
                "{} / {}",
                crate::built_info::CFG_OS,
                crate::built_info::RUSTC_VERSION
            ),
        );
        if let Some(information) = &self.information {
            set_prop("information", information.to_string());
        }
        let mut capabilities = FieldTable::new();
        capabilities.insert(
            "connection.blocked".to_string(),
            AMQPValue::Boolean(true),
        );
        client_properties.insert(
            "capabilities".to_string(),
            AMQPValue::FieldTable(capabilities),
        );

        Ok(StartOk {
            client_properties,
            mechanism,
            response: auth.response(),
            locale: self.locale.clone(),
        })
    }

    pub(crate) fn make_tune_ok(&self, tune: Tune) -> Result<TuneOk> {
        fn promote_0_u16(val: u16) -> u16 {
            if val == 0 {
                u16::max_value()
            } else {
                val
            }
        }
        fn promote_0_u32(val: u32) -> u32 {
            if val == 0 {
                u32::max_value()
            } else {
                val
            }
        }

        let channel_max = u16::min(promote_0_u16(tune.channel_max), promote_0_u16(self.channel_max));
        let frame_max = u32::min(promote_0_u32(tune.frame_max), promote_0_u32(self.frame_max));
        let heartbeat = u16::min(tune.heartbeat, self.heartbeat);

        if frame_max < u32::from(FRAME_MIN_SIZE) {
            return FrameMaxTooSmallSnafu {
                min: u32::from(FRAME_MIN_SIZE),
                requested: frame_max,
            }
            .fail();
        }

        Ok(TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        })
    }

    pub(crate) fn make_open(&self, virtual_host: &str) -> Open {
        Open {
            virtual_host: virtual_host.to_string(),
            capabilities: "".to_string(), // reserved
            insist: false,                // reserved
        }
    }
}
