//! Replication session gateway.
//!
//! Subscribers connect over WebSocket, receive bracketed change frames and
//! acknowledge progress with status frames.

pub mod close;
mod connection;
mod manager;
mod session;
mod shard;

pub use close::CloseReason;
pub use connection::handle_socket;
pub use manager::{ConnectionManager, Session};
pub use session::{
    handle_inbound, record_delivered, run_session, Outbound, SessionContext, SessionParams,
};
pub use shard::{MemoryShardStateStore, ShardState, ShardStateStore};

use crate::auth::{check_token, AuthError};

/// Check the token a subscriber presented.
///
/// A missing token is an authentication failure, a wrong one a policy
/// violation.
pub fn authorize(expected: Option<&str>, presented: Option<&str>) -> Result<(), CloseReason> {
    check_token(expected, presented).map_err(|err| match err {
        AuthError::Missing => CloseReason::auth_failure(err.to_string()),
        AuthError::Malformed | AuthError::Invalid => CloseReason::policy_violation(err.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_codes() {
        assert!(authorize(None, None).is_ok());
        assert!(authorize(Some("s3cret"), Some("s3cret")).is_ok());
        assert_eq!(authorize(Some("s3cret"), None).unwrap_err().code, close::AUTH_FAILURE);
        assert_eq!(
            authorize(Some("s3cret"), Some("guess")).unwrap_err().code,
            close::POLICY_VIOLATION
        );
    }
}
