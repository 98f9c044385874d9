use crate::wire::ConnectionState;
use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;
use std::{io, result};

/// A type alias for handling errors throughout the engine.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Broad classes of [`Error`]; use [`Error::kind`] to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An operation was invoked in a state that does not permit it. Never retried.
    IllegalState,

    /// [`Connection::start`](crate::Connection::start) did not reach a connected state in time.
    ConnectionTimeout,

    /// The broker rejected a request or the peer violated the protocol.
    Protocol,

    /// A socket-level failure while establishing or using the connection.
    Io,

    /// An established connection was lost.
    IoInterrupted,

    /// The connection (or channel) has been closed.
    ConnectionClosed,

    /// Invalid configuration (addresses, credentials, certificates, URLs).
    Configuration,

    /// A failure inside the engine itself.
    Internal,
}

/// An error that can occur from the connection engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// A wire-level operation was attempted while the connection was not connected.
    #[snafu(display("connection is not connected (state = {:?})", state))]
    NotConnected { state: ConnectionState },

    /// A connection state transition that only moves forward was asked to move backward.
    #[snafu(display("illegal connection state transition from {:?} to {:?}", from, to))]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The channel is not (or no longer) open on this connection.
    #[snafu(display("channel {} not found", channel_id))]
    ChannelNotFound { channel_id: u16 },

    /// The channel handle has been closed by the application.
    #[snafu(display("channel {} has been closed", channel_id))]
    ChannelClosed { channel_id: u16 },

    /// `init` was called on an engine that is already initialized.
    #[snafu(display("connection engine is already initialized"))]
    AlreadyInitialized,

    /// `start` was called on an engine that has not been initialized.
    #[snafu(display("connection engine has not been initialized"))]
    NotInitialized,

    /// `start` was called more than once.
    #[snafu(display("connection engine has already been started"))]
    AlreadyStarted,

    /// An operation requiring a running engine was called on one that is not running.
    #[snafu(display("connection engine is not running"))]
    NotRunning,

    /// Queue topology management was requested over a tunnel transport.
    #[snafu(display("{} is not supported over a tunnel connection", operation))]
    TopologyNotSupported { operation: &'static str },

    /// The engine did not connect within the configured timeout.
    #[snafu(display("timed out after {:?} connecting to {}", timeout, address))]
    ConnectionTimeout { address: String, timeout: Duration },

    /// The connection has been closed (by the client or as a consequence of an earlier failure).
    #[snafu(display("connection has been closed"))]
    ConnectionClosed,

    /// The client closed the connection.
    #[snafu(display("client closed connection"))]
    ClientClosedConnection,

    /// The client closed the channel.
    #[snafu(display("client closed channel {}", channel_id))]
    ClientClosedChannel { channel_id: u16 },

    /// The server closed the connection.
    #[snafu(display("server closed connection (code={} message={})", code, message))]
    ServerClosedConnection { code: u16, message: String },

    /// The server closed a channel.
    #[snafu(display(
        "server closed channel {} (code={}, message={})",
        channel_id,
        code,
        message
    ))]
    ServerClosedChannel {
        channel_id: u16,
        code: u16,
        message: String,
    },

    /// The server refused the login handshake.
    #[snafu(display("server refused login (code={} message={})", code, message))]
    LoginRefused { code: u16, message: String },

    /// The server does not offer the requested SASL mechanism.
    #[snafu(display(
        "requested auth mechanism unavailable (available = {}, requested = {})",
        available,
        requested
    ))]
    UnsupportedAuthMechanism { available: String, requested: String },

    /// The server does not offer the requested locale.
    #[snafu(display(
        "requested locale unavailable (available = {}, requested = {})",
        available,
        requested
    ))]
    UnsupportedLocale { available: String, requested: String },

    /// The negotiated frame max is below the AMQP minimum.
    #[snafu(display("requested frame max is too small (min = {}, requested = {})", min, requested))]
    FrameMaxTooSmall { min: u32, requested: u32 },

    #[snafu(display("SASL secure/secure-ok exchanges are not supported"))]
    SaslSecureNotSupported,

    /// A synchronous method did not receive its reply in time.
    #[snafu(display("timed out waiting for reply on channel {}", channel_id))]
    RpcTimeout { channel_id: u16 },

    /// Every channel number up to the negotiated channel max has been handed out.
    #[snafu(display("no more channel ids are available"))]
    ExhaustedChannelIds,

    #[snafu(display("AMQP protocol error - received unexpected frame"))]
    FrameUnexpected,

    #[snafu(display("received malformed data - expected AMQP frame"))]
    ReceivedMalformed,

    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    #[snafu(display("missed heartbeats from server"))]
    MissedServerHeartbeats,

    #[snafu(display("I/O error"))]
    Io { source: io::Error },

    #[snafu(display("could not resolve {}", address))]
    ResolveAddress { address: String, source: io::Error },

    #[snafu(display("failed to open socket to {}", address))]
    SocketConnect { address: String, source: io::Error },

    #[snafu(display("timed out opening socket to {}", address))]
    SocketConnectTimeout { address: String },

    /// An established connection was lost; reported once per loss event.
    #[snafu(display("connection interrupted: {}", reason))]
    IoInterrupted { reason: String },

    /// Connecting was abandoned because shutdown was requested.
    #[snafu(display("connect aborted by shutdown request"))]
    ConnectAborted,

    #[snafu(display("unsupported protocol {:?} (expected amqp, amqps or tunnel)", protocol))]
    UnsupportedProtocol { protocol: String },

    #[snafu(display("tunnel connections must target localhost (got {})", host))]
    InvalidTunnelHost { host: String },

    #[snafu(display("username must not be empty"))]
    EmptyUsername,

    #[snafu(display("invalid URL: {}", url))]
    InvalidUrl { url: String },

    #[snafu(display("failed to parse URL"))]
    ParseUrl { source: url::ParseError },

    #[snafu(display("could not read {}", path.display()))]
    ReadCertificate { path: PathBuf, source: io::Error },

    #[cfg(feature = "native-tls")]
    #[snafu(display("could not build TLS connector"))]
    CreateTlsConnector { source: native_tls::Error },

    #[cfg(feature = "native-tls")]
    #[snafu(display("TLS handshake failed"))]
    TlsHandshake { source: native_tls::Error },

    #[snafu(display("TLS transport requested but the native-tls feature is not enabled"))]
    TlsFeatureNotEnabled,

    #[snafu(display("internal serialization error (this is a bug)"))]
    InternalSerializationError,

    #[snafu(display("failed to spawn thread"))]
    ForkFailed { source: io::Error },

    #[snafu(display("I/O thread died unexpectedly: {}", message))]
    IoThreadPanic { message: String },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            NotConnected { .. }
            | IllegalTransition { .. }
            | ChannelNotFound { .. }
            | ChannelClosed { .. }
            | AlreadyInitialized
            | NotInitialized
            | AlreadyStarted
            | NotRunning
            | TopologyNotSupported { .. } => ErrorKind::IllegalState,
            ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            ServerClosedConnection { .. }
            | ServerClosedChannel { .. }
            | LoginRefused { .. }
            | UnsupportedAuthMechanism { .. }
            | UnsupportedLocale { .. }
            | FrameMaxTooSmall { .. }
            | SaslSecureNotSupported
            | RpcTimeout { .. }
            | ExhaustedChannelIds
            | FrameUnexpected
            | ReceivedMalformed => ErrorKind::Protocol,
            UnexpectedSocketClose
            | MissedServerHeartbeats
            | Io { .. }
            | ResolveAddress { .. }
            | SocketConnect { .. }
            | SocketConnectTimeout { .. } => ErrorKind::Io,
            #[cfg(feature = "native-tls")]
            TlsHandshake { .. } => ErrorKind::Io,
            IoInterrupted { .. } => ErrorKind::IoInterrupted,
            ConnectionClosed
            | ClientClosedConnection
            | ClientClosedChannel { .. }
            | ConnectAborted => ErrorKind::ConnectionClosed,
            UnsupportedProtocol { .. }
            | InvalidTunnelHost { .. }
            | EmptyUsername
            | InvalidUrl { .. }
            | ParseUrl { .. }
            | ReadCertificate { .. }
            | TlsFeatureNotEnabled => ErrorKind::Configuration,
            #[cfg(feature = "native-tls")]
            CreateTlsConnector { .. } => ErrorKind::Configuration,
            InternalSerializationError | ForkFailed { .. } | IoThreadPanic { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// True for transient socket-level failures that the engine retries while connecting.
    pub fn is_io(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}
