use crate::errors::*;
use crate::{CertInfo, Protocol};
use mio::net::TcpStream;
use mio::Evented;
use std::io::{Read, Write};

/// A connected, non-blocking byte stream the wire connection can drive.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}

#[cfg(feature = "native-tls")]
mod native_tls;

#[cfg(feature = "native-tls")]
pub(crate) use self::native_tls::TlsConnector;

/// How a freshly connected socket is turned into an [`IoStream`].
pub(crate) enum Transport {
    Plain,
    #[cfg(feature = "native-tls")]
    Tls(TlsConnector),
}

impl Transport {
    pub(crate) fn new(protocol: Protocol, cert_info: &CertInfo) -> Result<Transport> {
        if protocol.is_tls() {
            Transport::tls(cert_info)
        } else {
            Ok(Transport::Plain)
        }
    }

    #[cfg(feature = "native-tls")]
    fn tls(cert_info: &CertInfo) -> Result<Transport> {
        Ok(Transport::Tls(TlsConnector::from_cert_info(cert_info)?))
    }

    #[cfg(not(feature = "native-tls"))]
    fn tls(_: &CertInfo) -> Result<Transport> {
        TlsFeatureNotEnabledSnafu.fail()
    }

    /// Wraps a connected socket. `wait` is called whenever the TLS handshake needs the socket
    /// to become readable or writable before it can progress.
    #[cfg_attr(not(feature = "native-tls"), allow(unused_variables, unused_mut))]
    pub(crate) fn wrap<W>(
        &self,
        stream: TcpStream,
        domain: &str,
        mut wait: W,
    ) -> Result<Box<dyn IoStream>>
    where
        W: FnMut(&dyn Evented) -> Result<()>,
    {
        match self {
            Transport::Plain => Ok(Box::new(stream)),
            #[cfg(feature = "native-tls")]
            Transport::Tls(connector) => {
                let mut handshake = connector.connect(domain, stream)?;
                loop {
                    if let Some(stream) = handshake.progress_handshake()? {
                        return Ok(Box::new(stream));
                    }
                    wait(&handshake)?;
                }
            }
        }
    }
}
