use crate::errors::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Transport flavor used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain TCP (`amqp`).
    Plain,

    /// TLS-wrapped TCP (`amqps`).
    Secure,

    /// TLS-wrapped TCP to a local tunnel endpoint. The host must be `localhost` or
    /// `127.0.0.1`, and queue topology management is not available.
    Tunnel,
}

impl Protocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Plain => "amqp",
            Protocol::Secure => "amqps",
            Protocol::Tunnel => "tunnel",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Plain => 5672,
            Protocol::Secure | Protocol::Tunnel => 5671,
        }
    }

    #[inline]
    pub fn is_tls(self) -> bool {
        self != Protocol::Plain
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Protocol> {
        match s.to_ascii_lowercase().as_str() {
            "amqp" => Ok(Protocol::Plain),
            "amqps" => Ok(Protocol::Secure),
            "tunnel" => Ok(Protocol::Tunnel),
            _ => UnsupportedProtocolSnafu { protocol: s }.fail(),
        }
    }
}

/// Location of a broker: protocol, host, port and virtual host.
///
/// Immutable once built; share it freely between threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    protocol: Protocol,
    host: String,
    port: u16,
    virtual_host: String,
    display: String,
}

impl Address {
    pub fn new<H: Into<String>, V: Into<String>>(
        protocol: Protocol,
        host: H,
        port: u16,
        virtual_host: V,
    ) -> Result<Address> {
        let host = host.into();
        let virtual_host = virtual_host.into();
        if protocol == Protocol::Tunnel && host != "localhost" && host != "127.0.0.1" {
            return InvalidTunnelHostSnafu { host }.fail();
        }
        let display = format!(
            "{}://{}:{}/{}",
            protocol.scheme(),
            host,
            port,
            virtual_host.trim_start_matches('/')
        );
        Ok(Address {
            protocol,
            host,
            port,
            virtual_host,
            display,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    /// `host:port`, suitable for socket address resolution.
    pub(crate) fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Paths to TLS material. Absent `CertInfo` means no client identity and no extra trust root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertInfo {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl CertInfo {
    pub fn new<A, C, K>(ca_cert: A, client_cert: C, client_key: K) -> CertInfo
    where
        A: Into<PathBuf>,
        C: Into<PathBuf>,
        K: Into<PathBuf>,
    {
        CertInfo {
            ca_cert: Some(ca_cert.into()),
            client_cert: Some(client_cert.into()),
            client_key: Some(client_key.into()),
        }
    }
}
