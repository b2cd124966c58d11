//! SASL mechanism plug-ins (§4.4.c).
//!
//! A mechanism is a capability set (`mechanism_name()`,
//! `initial_response_bytes()`) rather than a concrete credential type;
//! two implementations are bundled here since a client that can never
//! actually authenticate is not runnable. Per-mechanism credential
//! derivation beyond these two (SCRAM and friends) remains out of scope.

use bytes::BufMut;
use fe2o3_amqp_types::primitives::{Binary, Symbol};

const ANONYMOUS: &str = "ANONYMOUS";
const PLAIN: &str = "PLAIN";

/// A client-side SASL mechanism.
pub trait SaslMechanism: std::fmt::Debug {
    /// The mechanism name advertised in SASL-INIT.
    fn name(&self) -> Symbol;

    /// The initial response to send alongside SASL-INIT, if any.
    fn initial_response(&self) -> Option<Binary>;

    /// Computes a response to a SASL-CHALLENGE, if this mechanism is able
    /// to answer one. Both bundled mechanisms return `None`, which drives
    /// the negotiation state machine to `Error` (§4.4.b) rather than
    /// leaving the challenge unanswered.
    fn respond(&mut self, challenge: &[u8]) -> Option<Vec<u8>> {
        let _ = challenge;
        None
    }
}

/// The `ANONYMOUS` mechanism: an empty initial response, no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> Symbol {
        Symbol::from(ANONYMOUS)
    }

    fn initial_response(&self) -> Option<Binary> {
        None
    }
}

/// The `PLAIN` mechanism (RFC 4616): `[authzid] UTF8NUL authcid UTF8NUL passwd`
/// as the initial response.
#[derive(Debug, Clone)]
pub struct Plain {
    /// Authorization identity (the identity to act as). Left empty unless
    /// it differs from `authcid`, per RFC 4616 §2.
    pub authzid: Option<String>,
    /// Authentication identity (the username presenting the credentials)
    pub authcid: String,
    /// Password
    pub password: String,
}

impl Plain {
    /// Creates a new `PLAIN` mechanism instance with no `authzid`.
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Creates a new `PLAIN` mechanism instance that authenticates as
    /// `authcid` but requests authorization as `authzid`.
    pub fn with_authzid(
        authzid: impl Into<String>,
        authcid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            authzid: Some(authzid.into()),
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> Symbol {
        Symbol::from(PLAIN)
    }

    fn initial_response(&self) -> Option<Binary> {
        let authzid = self.authzid.as_deref().unwrap_or("").as_bytes();
        let authcid = self.authcid.as_bytes();
        let password = self.password.as_bytes();
        let mut buf = Vec::with_capacity(authzid.len() + authcid.len() + password.len() + 2);
        buf.put_slice(authzid);
        buf.put_u8(0);
        buf.put_slice(authcid);
        buf.put_u8(0);
        buf.put_slice(password);
        Some(Binary::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_is_nul_separated() {
        let mech = Plain::new("guest", "guest");
        let response = mech.initial_response().unwrap();
        assert_eq!(response.as_slice(), b"\0guest\0guest");
        assert_eq!(mech.name(), Symbol::from("PLAIN"));
    }

    #[test]
    fn plain_with_authzid_prefixes_the_authorization_identity() {
        let mech = Plain::with_authzid("admin", "guest", "guest");
        let response = mech.initial_response().unwrap();
        assert_eq!(response.as_slice(), b"admin\0guest\0guest");
    }

    #[test]
    fn anonymous_has_no_initial_response() {
        let mech = Anonymous;
        assert!(mech.initial_response().is_none());
        assert_eq!(mech.name(), Symbol::from("ANONYMOUS"));
    }
}
