//! Client-side authentication of new connections.
//!
//! The server may demand SASL authentication in reply to STARTUP. The
//! connector drives that exchange frame by frame; what goes *into* the
//! tokens is delegated to an [`Authenticator`] capability supplied through
//! the connection settings. [`PasswordAuthenticator`] covers the common
//! username/password case; anything else (Kerberos, LDAP passthrough, ...)
//! is a custom implementation of the two traits below.

use async_trait::async_trait;

pub use crate::errors::AuthError;

/// Factory for authentication exchanges, configured once per manager.
/// A fresh [`AuthExchange`] is created for every connection the server asks
/// to authenticate.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Starts an exchange against the authenticator the server announced
    /// (e.g. `org.apache.cassandra.auth.PasswordAuthenticator`). Returning
    /// an error fails the connection attempt as a critical error.
    async fn begin_exchange(
        &self,
        authenticator_name: &str,
    ) -> Result<Box<dyn AuthExchange>, AuthError>;
}

/// The client side of one connection's SASL exchange.
///
/// [`next_token`](AuthExchange::next_token) is called first with `None` to
/// produce the initial response, then once per server challenge, until the
/// server answers with a success frame ([`finish`](AuthExchange::finish))
/// or an error frame (which the pool reports as a critical failure).
#[async_trait]
pub trait AuthExchange: Send {
    /// Produces the next client token. `challenge` is `None` for the
    /// initial round and carries the server's challenge token afterwards.
    async fn next_token(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError>;

    /// Receives the proof token carried by the server's success frame.
    /// Most mechanisms have nothing left to verify at this point.
    async fn finish(&mut self, _proof: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication: answers the exchange with a single
/// SASL PLAIN initial response and rejects any further challenge.
pub struct PasswordAuthenticator {
    username: String,
    password: String,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PasswordAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn begin_exchange(
        &self,
        _authenticator_name: &str,
    ) -> Result<Box<dyn AuthExchange>, AuthError> {
        Ok(Box::new(PlainExchange {
            username: self.username.clone(),
            password: self.password.clone(),
        }))
    }
}

struct PlainExchange {
    username: String,
    password: String,
}

#[async_trait]
impl AuthExchange for PlainExchange {
    async fn next_token(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError> {
        if challenge.is_some() {
            return Err(
                "SASL PLAIN consists of a single message, but the server sent a challenge"
                    .to_string(),
            );
        }

        // RFC 4616: [authzid] NUL authcid NUL passwd, with an empty authzid.
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_exchange_is_single_round() {
        let authenticator = PasswordAuthenticator::new("basalt", "hunter2");
        let mut exchange = authenticator
            .begin_exchange("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        let token = exchange.next_token(None).await.unwrap().unwrap();
        assert_eq!(token, b"\0basalt\0hunter2");

        // PLAIN has no second round.
        assert!(exchange.next_token(Some(b"anything")).await.is_err());
        exchange.finish(None).await.unwrap();
    }
}
