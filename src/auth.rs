use crate::errors::*;

/// A trait encapsulating the operations required to authenticate to an AMQP server.
///
/// # Warning
///
/// SASL mechanisms that require AMQP secure / secure-ok exchanges are not supported.
pub trait Sasl: Clone + Send + Sync + 'static {
    /// The SASL mechanism to report. The server must support this mechanism
    /// for authentication to succeed.
    fn mechanism(&self) -> String;

    /// The response body to send along with the mechanism.
    fn response(&self) -> String;
}

/// Username/password credentials used during the login handshake (SASL PLAIN).
///
/// The username is required; the password may be empty, which some transports
/// (e.g. [`Protocol::Tunnel`](crate::Protocol::Tunnel)) rely on.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthMechanism {
    username: String,
    password: String,
}

impl AuthMechanism {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Result<AuthMechanism> {
        let username = username.into();
        if username.is_empty() {
            return EmptyUsernameSnafu.fail();
        }
        Ok(AuthMechanism {
            username,
            password: password.into(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// Never print the password.
impl std::fmt::Debug for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMechanism")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Sasl for AuthMechanism {
    fn mechanism(&self) -> String {
        "PLAIN".to_string()
    }

    fn response(&self) -> String {
        format!("\x00{}\x00{}", self.username, self.password)
    }
}
