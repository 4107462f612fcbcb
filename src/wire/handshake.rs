//! Session handshake.
//!
//! The first frame on every connection must be a [`Hello`]. The host checks
//! two things before it accepts any other frame kind:
//!
//! 1. `protocol_version` equals [`PROTOCOL_VERSION`];
//! 2. `token` equals the configured shared secret. Both sides are hashed
//!    with SHA-256 first so the comparison does not depend on token length.
//!
//! On success the host answers [`HelloAck`]; otherwise [`HelloNack`] and the
//! connection is closed.

use sha2::{Digest, Sha256};

use crate::wire::messages::{Hello, HelloAck, HelloNack, PROTOCOL_VERSION};

/// Host identification sent in [`HelloAck`].
#[must_use]
pub fn server_info() -> String {
    format!("live-harness/{}", env!("CARGO_PKG_VERSION"))
}

/// Build the greeting a client sends first.
#[must_use]
pub fn client_hello(client: impl Into<String>, token: impl Into<String>) -> Hello {
    Hello {
        protocol_version: PROTOCOL_VERSION,
        client: client.into(),
        token: token.into(),
    }
}

/// Verify a greeting against the expected shared secret.
///
/// # Errors
///
/// Returns the [`HelloNack`] to send back when the version or token is wrong.
pub fn verify(hello: &Hello, expected_token: &str, session_id: &str) -> Result<HelloAck, HelloNack> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(HelloNack {
            reason: format!(
                "version mismatch: client version {}, server version {PROTOCOL_VERSION}",
                hello.protocol_version
            ),
        });
    }

    if expected_token.is_empty() || digest(&hello.token) != digest(expected_token) {
        return Err(HelloNack {
            reason: "invalid token".into(),
        });
    }

    Ok(HelloAck {
        session_id: session_id.to_owned(),
        server: server_info(),
    })
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}
