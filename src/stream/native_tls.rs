use super::IoStream;
use crate::errors::*;
use crate::CertInfo;
use log::{debug, warn};
use mio::{Evented, Poll, PollOpt, Ready, Token};
use native_tls::{Certificate, HandshakeError, Identity, MidHandshakeTlsStream};
use snafu::ResultExt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// TLS settings for `amqps` and `tunnel` connections.
pub(crate) struct TlsConnector(native_tls::TlsConnector);

impl TlsConnector {
    /// Builds a connector requiring TLS 1.2 or newer. Certificate and hostname verification
    /// are disabled; `cert_info` only contributes an extra trust root and a client identity.
    pub(crate) fn from_cert_info(cert_info: &CertInfo) -> Result<TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        builder
            .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);

        if let Some(path) = &cert_info.ca_cert {
            let pem = read_pem(path)?;
            let cert = Certificate::from_pem(&pem).context(CreateTlsConnectorSnafu)?;
            builder.add_root_certificate(cert);
        }

        match (&cert_info.client_cert, &cert_info.client_key) {
            (Some(cert), Some(key)) => {
                let cert = read_pem(cert)?;
                let key = read_pem(key)?;
                let identity = Identity::from_pkcs8(&cert, &key).context(CreateTlsConnectorSnafu)?;
                builder.identity(identity);
            }
            (None, None) => (),
            _ => warn!("client certificate and key must both be set; ignoring client identity"),
        }

        let connector = builder.build().context(CreateTlsConnectorSnafu)?;
        Ok(TlsConnector(connector))
    }

    pub(crate) fn connect<S>(&self, domain: &str, stream: S) -> Result<TlsHandshakeStream<S>>
    where
        S: Read + Write,
    {
        debug!("starting TLS handshake with {}", domain);
        let inner = Some(match self.0.connect(domain, stream) {
            Ok(s) => InnerHandshake::Done(s),
            Err(HandshakeError::WouldBlock(s)) => InnerHandshake::MidHandshake(s),
            Err(HandshakeError::Failure(err)) => return Err(err).context(TlsHandshakeSnafu),
        });
        Ok(TlsHandshakeStream { inner })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).context(ReadCertificateSnafu { path })
}

pub(crate) struct TlsHandshakeStream<S> {
    inner: Option<InnerHandshake<S>>,
}

enum InnerHandshake<S> {
    MidHandshake(MidHandshakeTlsStream<S>),
    Done(native_tls::TlsStream<S>),
}

impl<S: Read + Write> InnerHandshake<S> {
    fn get_ref(&self) -> &S {
        match self {
            InnerHandshake::MidHandshake(s) => s.get_ref(),
            InnerHandshake::Done(s) => s.get_ref(),
        }
    }
}

impl<S: Evented + Read + Write + Send + 'static> TlsHandshakeStream<S> {
    /// Returns `Ok(None)` while the handshake still needs socket I/O.
    pub(crate) fn progress_handshake(&mut self) -> Result<Option<TlsStream<S>>> {
        let mid_hs = match self.inner.take().unwrap() {
            InnerHandshake::MidHandshake(mid_hs) => mid_hs,
            InnerHandshake::Done(s) => return Ok(Some(TlsStream(s))),
        };

        match mid_hs.handshake() {
            Ok(s) => Ok(Some(TlsStream(s))),
            Err(HandshakeError::WouldBlock(s)) => {
                self.inner = Some(InnerHandshake::MidHandshake(s));
                Ok(None)
            }
            Err(HandshakeError::Failure(err)) => Err(err).context(TlsHandshakeSnafu),
        }
    }
}

impl<S: Evented + Read + Write> Evented for TlsHandshakeStream<S> {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.inner
            .as_ref()
            .unwrap()
            .get_ref()
            .register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.inner
            .as_ref()
            .unwrap()
            .get_ref()
            .reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.inner.as_ref().unwrap().get_ref().deregister(poll)
    }
}

pub(crate) struct TlsStream<S>(native_tls::TlsStream<S>);

impl<S: Evented + Read + Write + Send + 'static> IoStream for TlsStream<S> {}

impl<S: Read + Write> Read for TlsStream<S> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<S: Evented + Read + Write> Evented for TlsStream<S> {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.0.get_ref().deregister(poll)
    }
}
