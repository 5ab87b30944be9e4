//! Session identity and deterministic role assignment

use serde::{Deserialize, Serialize};

/// Negotiation role within a two-party session.
///
/// The initiator creates the data channel and the first offer; the responder
/// answers. The role is a pure function of the two user ids, so both peers
/// independently compute complementary roles and offer glare cannot occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Creates the data channel and publishes the offer
    Initiator,
    /// Waits for the offer and publishes the answer
    Responder,
}

impl Role {
    /// Compute the local role from the two participant ids.
    ///
    /// The lexicographically smaller id initiates. Evaluating this on either
    /// side yields complementary roles for the same pair.
    pub fn for_pair(local_user_id: &str, remote_user_id: &str) -> Role {
        if local_user_id < remote_user_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    /// Whether this side drives the offer
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Fixed identity of one two-party call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Shared session identifier (same on both peers)
    pub session_id: String,

    /// Local participant id
    pub local_user_id: String,

    /// Remote participant id
    pub remote_user_id: String,
}

impl SessionIdentity {
    /// Create a new session identity
    pub fn new(
        session_id: impl Into<String>,
        local_user_id: impl Into<String>,
        remote_user_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
        }
    }

    /// Role of the local participant, fixed for the session lifetime
    pub fn role(&self) -> Role {
        Role::for_pair(&self.local_user_id, &self.remote_user_id)
    }

    /// Pub/sub channel name for this session's signaling traffic
    pub fn channel_id(&self) -> String {
        format!("call:{}", self.session_id)
    }

    /// Check whether a sender id is our own (self-echo filter)
    pub fn is_self(&self, sender_id: &str) -> bool {
        sender_id == self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_is_deterministic_and_complementary() {
        assert_eq!(Role::for_pair("alice", "bob"), Role::Initiator);
        assert_eq!(Role::for_pair("bob", "alice"), Role::Responder);

        // Same answer regardless of which side evaluates it
        let a_says = Role::for_pair("user-17", "user-42");
        let b_says = Role::for_pair("user-42", "user-17");
        assert_ne!(a_says, b_says);
        assert!(a_says.is_initiator());
    }

    #[test]
    fn test_session_role_and_channel() {
        let session = SessionIdentity::new("room-9", "alice", "bob");
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.channel_id(), "call:room-9");

        let peer = SessionIdentity::new("room-9", "bob", "alice");
        assert_eq!(peer.role(), Role::Responder);
        assert_eq!(peer.channel_id(), session.channel_id());
    }

    #[test]
    fn test_self_echo_filter() {
        let session = SessionIdentity::new("room-9", "alice", "bob");
        assert!(session.is_self("alice"));
        assert!(!session.is_self("bob"));
    }
}
