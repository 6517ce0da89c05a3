//! Authentication hook for handshakes.
//!
//! Roomsync doesn't authenticate anyone itself. The server hands every
//! handshake to an [`Authenticator`] and only admits the connection if it
//! returns `Ok`. Plug in JWT validation, an API key check, or anything
//! else; [`AllowAll`] is the development default.

use std::future::Future;

use roomsync_protocol::Handshake;

use crate::SessionError;

/// Decides whether a handshake may join its namespace.
///
/// # Example
///
/// ```rust
/// use roomsync_protocol::Handshake;
/// use roomsync_session::{Authenticator, SessionError};
///
/// /// Admits callers presenting one shared secret.
/// struct SharedSecret(String);
///
/// /// Kept by the server for every admitted connection.
/// struct Member {
///     admin: bool,
/// }
///
/// impl Authenticator for SharedSecret {
///     type Session = Member;
///
///     async fn authenticate(
///         &self,
///         handshake: &Handshake,
///     ) -> Result<Member, SessionError> {
///         match handshake.token.as_deref() {
///             Some(token) if token == self.0 => Ok(Member {
///                 admin: handshake.caller_id == "root",
///             }),
///             _ => Err(SessionError::AuthFailed("bad token".into())),
///         }
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Per-connection data stored alongside each admitted socket.
    type Session: Send + Sync + 'static;

    /// Validates the handshake and returns the session data to record for
    /// the connection.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] to reject. The server answers with an
    /// error frame (code 401) and closes the socket.
    fn authenticate(
        &self,
        handshake: &Handshake,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send;
}

/// Admits every handshake under its own caller id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    type Session = String;

    async fn authenticate(&self, handshake: &Handshake) -> Result<String, SessionError> {
        Ok(handshake.caller_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use roomsync_protocol::PROTOCOL_VERSION;

    use super::*;

    struct DenyAll;

    impl Authenticator for DenyAll {
        type Session = ();

        async fn authenticate(&self, _: &Handshake) -> Result<(), SessionError> {
            Err(SessionError::AuthFailed("nobody gets in".into()))
        }
    }

    fn handshake() -> Handshake {
        Handshake {
            version: PROTOCOL_VERSION,
            namespace_id: "lobby".into(),
            caller_id: "alice".into(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_allow_all_returns_caller_id() {
        let identity = AllowAll.authenticate(&handshake()).await.unwrap();
        assert_eq!(identity, "alice");
    }

    #[tokio::test]
    async fn test_custom_authenticator_can_reject() {
        let result = DenyAll.authenticate(&handshake()).await;
        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }
}
