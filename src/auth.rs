//! Legacy jabber:iq:auth (pre-SASL) authentication.
//!
//! The flow is two iq round trips: a discovery get listing the fields the
//! server accepts for this user, then a set carrying the credentials. When
//! the server accepts `<digest>`, the password never crosses the wire: the
//! digest is the lowercase hex SHA-1 of the stream id concatenated with
//! the password. Plaintext is only used as a fallback and only when the
//! policy explicitly allows it.

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::Error;
use crate::stanza::Stanza;

const AUTH_NS: &str = "jabber:iq:auth";

/// Which credential forms the server advertised in the discovery reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AuthMechanisms {
    pub plaintext: bool,
    pub digest: bool,
    pub zero_knowledge: bool,
}

/// Controls fallback behavior when the server cannot do digest auth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Allow sending the password as plaintext when the server offers no
    /// `<digest>` field. Off by default.
    pub allow_plaintext: bool,
}

/// Lowercase hex SHA-1 over the stream id concatenated with the password.
pub fn digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// The discovery iq get asking which auth fields the server accepts.
pub(crate) fn discovery_request(username: &str) -> Stanza {
    Stanza::new_iq("get").with_child(
        Stanza::new("query")
            .with_attribute("xmlns", AUTH_NS)
            .with_child(Stanza::new("username").with_text(username)),
    )
}

/// Reads the advertised fields out of the discovery reply. A reply without
/// a query element is treated as plaintext-only, which is what ancient
/// servers that never implemented discovery do.
pub(crate) fn mechanisms_from_reply(reply: &Stanza) -> AuthMechanisms {
    let Some(query) = reply.child("query") else {
        return AuthMechanisms {
            plaintext: true,
            ..AuthMechanisms::default()
        };
    };
    AuthMechanisms {
        plaintext: query.child("password").is_some(),
        digest: query.child("digest").is_some(),
        zero_knowledge: query.child("sequence").is_some() && query.child("token").is_some(),
    }
}

/// Builds the credentials iq set, picking the strongest mechanism the
/// server offers that the policy allows.
pub(crate) fn auth_request(
    stream_id: &str,
    username: &str,
    password: &str,
    resource: &str,
    mechanisms: AuthMechanisms,
    policy: AuthPolicy,
) -> Result<Stanza, Error> {
    let mut query = Stanza::new("query")
        .with_attribute("xmlns", AUTH_NS)
        .with_child(Stanza::new("username").with_text(username));

    if mechanisms.zero_knowledge && !mechanisms.digest {
        // 0k auth is not implemented; servers that offer it also offer
        // digest in practice.
        debug!("server advertised zero-knowledge auth, falling back");
    }

    if mechanisms.digest {
        query
            .add_child(Stanza::new("digest").with_text(digest(stream_id, password)));
    } else if mechanisms.plaintext && policy.allow_plaintext {
        query.add_child(Stanza::new("password").with_text(password));
    } else {
        return Err(Error::PlaintextRefused);
    }

    query.add_child(Stanza::new("resource").with_text(resource));

    Ok(Stanza::new_iq("set").with_child(query))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery_reply(fields: &[&str]) -> Stanza {
        let mut query = Stanza::new("query").with_attribute("xmlns", AUTH_NS);
        for field in fields {
            query.add_child(Stanza::new(*field));
        }
        Stanza::new_iq("result").with_child(query)
    }

    #[test]
    fn test_digest_is_sha1_of_concatenation() {
        // sha1("s1secret")
        assert_eq!(
            digest("s1", "secret"),
            "3d1121b21f6287dc58010ebe9a95fa84ee2483d4"
        );
        // sha1("streamidpass")
        assert_eq!(
            digest("streamid", "pass"),
            "5efd8878f1d62e64d06811636eb686c5d3362909"
        );
    }

    #[test]
    fn test_discovery_request_shape() {
        let iq = discovery_request("kat");
        assert_eq!(iq.attribute("type"), Some("get"));
        let query = iq.child("query").unwrap();
        assert_eq!(query.attribute("xmlns"), Some(AUTH_NS));
        assert_eq!(query.child("username").unwrap().text(), "kat");
    }

    #[test]
    fn test_mechanisms_parsing() {
        let reply = discovery_reply(&["username", "password", "digest", "resource"]);
        let mechs = mechanisms_from_reply(&reply);
        assert!(mechs.plaintext);
        assert!(mechs.digest);
        assert!(!mechs.zero_knowledge);

        let reply = discovery_reply(&["username", "sequence", "token"]);
        let mechs = mechanisms_from_reply(&reply);
        assert!(mechs.zero_knowledge);
        assert!(!mechs.digest);
    }

    #[test]
    fn test_missing_query_defaults_to_plaintext() {
        let reply = Stanza::new_iq("result");
        let mechs = mechanisms_from_reply(&reply);
        assert!(mechs.plaintext);
        assert!(!mechs.digest);
    }

    #[test]
    fn test_digest_preferred_over_plaintext() {
        let mechs = AuthMechanisms {
            plaintext: true,
            digest: true,
            zero_knowledge: false,
        };
        let iq = auth_request("s1", "kat", "secret", "home", mechs, AuthPolicy::default())
            .unwrap();
        assert_eq!(iq.attribute("type"), Some("set"));
        let query = iq.child("query").unwrap();
        assert!(query.child("password").is_none());
        assert_eq!(
            query.child("digest").unwrap().text(),
            "3d1121b21f6287dc58010ebe9a95fa84ee2483d4"
        );
        assert_eq!(query.child("resource").unwrap().text(), "home");
    }

    #[test]
    fn test_plaintext_refused_by_default() {
        let mechs = AuthMechanisms {
            plaintext: true,
            digest: false,
            zero_knowledge: false,
        };
        let err = auth_request("s1", "kat", "secret", "home", mechs, AuthPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::PlaintextRefused));
    }

    #[test]
    fn test_plaintext_allowed_when_opted_in() {
        let mechs = AuthMechanisms {
            plaintext: true,
            digest: false,
            zero_knowledge: false,
        };
        let policy = AuthPolicy {
            allow_plaintext: true,
        };
        let iq = auth_request("s1", "kat", "secret", "home", mechs, policy).unwrap();
        let query = iq.child("query").unwrap();
        assert_eq!(query.child("password").unwrap().text(), "secret");
        assert!(query.child("digest").is_none());
    }

    #[test]
    fn test_no_usable_mechanism() {
        let mechs = AuthMechanisms::default();
        let err = auth_request("s1", "kat", "secret", "home", mechs, AuthPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::PlaintextRefused));
    }
}
