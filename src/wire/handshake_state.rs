use crate::connection_options::ConnectionOptions;
use crate::errors::*;
use crate::serialize::{OutputBuffer, TryFromAmqpClass};
use crate::Sasl;
use amq_protocol::frame::AMQPFrame;
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{Close, CloseOk, OpenOk, Secure, Start, Tune, TuneOk};
use amq_protocol::protocol::AMQPClass;
use log::{debug, error};

/// What the login handshake needs besides the frames themselves.
pub(super) struct HandshakeParams<'a, Auth: Sasl> {
    pub(super) options: &'a ConnectionOptions,
    pub(super) auth: &'a Auth,
    pub(super) virtual_host: &'a str,
}

#[derive(Debug)]
pub(super) enum HandshakeState {
    Start,
    Secure,
    Tune,
    Open(TuneOk),
    ServerClosing(Close),
    Done(TuneOk),
}

impl HandshakeState {
    pub(super) fn process<Auth: Sasl>(
        &mut self,
        params: &HandshakeParams<'_, Auth>,
        outbuf: &mut OutputBuffer,
        frame: AMQPFrame,
    ) -> Result<()> {
        let class = match frame {
            // unlikely but not impossible to receive a heartbeat during handshake
            AMQPFrame::Heartbeat(0) => {
                debug!("received heartbeat");
                return Ok(());
            }
            AMQPFrame::Method(0, class) => class,
            _ => return FrameUnexpectedSnafu.fail(),
        };

        // The server answers a refused login or a bad vhost with a close at any point.
        if let AMQPClass::Connection(AmqpConnection::Close(close)) = class {
            match self {
                HandshakeState::ServerClosing(_) | HandshakeState::Done(_) => {
                    return FrameUnexpectedSnafu.fail();
                }
                _ => {
                    debug!("server closed connection during handshake: {:?}", close);
                    outbuf.push_method(0, AmqpConnection::CloseOk(CloseOk {}))?;
                    *self = HandshakeState::ServerClosing(close);
                    return Ok(());
                }
            }
        }

        match self {
            HandshakeState::Start => {
                let start = Start::try_from(class)?;
                debug!("received handshake {:?}", start);

                let start_ok = params.options.make_start_ok(params.auth, start)?;
                debug!("sending handshake start-ok (mechanism {})", start_ok.mechanism);
                outbuf.push_method(0, AmqpConnection::StartOk(start_ok))?;

                *self = HandshakeState::Secure;
            }
            HandshakeState::Secure => {
                // PLAIN never needs a secure/secure-ok round trip
                if Secure::matches(&class) {
                    error!("received unsupported handshake {:?}", class);
                    return SaslSecureNotSupportedSnafu.fail();
                }
                *self = HandshakeState::Tune;
                return self.process(params, outbuf, AMQPFrame::Method(0, class));
            }
            HandshakeState::Tune => {
                let tune = Tune::try_from(class)?;
                debug!("received handshake {:?}", tune);

                let tune_ok = params.options.make_tune_ok(tune)?;
                debug!("sending handshake {:?}", tune_ok);
                outbuf.push_method(0, AmqpConnection::TuneOk(tune_ok.clone()))?;

                let open = params.options.make_open(params.virtual_host);
                debug!("sending handshake {:?}", open);
                outbuf.push_method(0, AmqpConnection::Open(open))?;

                *self = HandshakeState::Open(tune_ok);
            }
            HandshakeState::Open(tune_ok) => {
                let open_ok = OpenOk::try_from(class)?;
                debug!("received handshake {:?}", open_ok);
                *self = HandshakeState::Done(tune_ok.clone());
            }
            HandshakeState::ServerClosing(_) | HandshakeState::Done(_) => {
                return FrameUnexpectedSnafu.fail();
            }
        }
        Ok(())
    }
}
