//! WebSocket close codes and reasons.

use axum::extract::ws::{CloseFrame, Message};

/// The subscriber presented no credentials.
pub const AUTH_FAILURE: u16 = 3000;
/// The subscriber broke the protocol or presented bad credentials.
pub const POLICY_VIOLATION: u16 = 1008;
/// Something failed on our side.
pub const INTERNAL_ERROR: u16 = 1011;
/// The upstream stream ended; reconnecting resumes it.
pub const SERVICE_RESTART: u16 = 1012;

/// Budget for a close reason, in bytes.
pub const MAX_REASON_BYTES: usize = 123;

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// A close with `reason` cut to [`MAX_REASON_BYTES`].
    pub fn new(code: u16, reason: impl AsRef<str>) -> Self {
        Self {
            code,
            reason: truncate_reason(reason.as_ref()).to_string(),
        }
    }

    pub fn auth_failure(reason: impl AsRef<str>) -> Self {
        Self::new(AUTH_FAILURE, reason)
    }

    pub fn policy_violation(reason: impl AsRef<str>) -> Self {
        Self::new(POLICY_VIOLATION, reason)
    }

    pub fn internal(reason: impl AsRef<str>) -> Self {
        Self::new(INTERNAL_ERROR, reason)
    }

    pub fn service_restart(reason: impl AsRef<str>) -> Self {
        Self::new(SERVICE_RESTART, reason)
    }

    pub fn into_message(self) -> Message {
        Message::Close(Some(CloseFrame {
            code: self.code,
            reason: self.reason.into(),
        }))
    }
}

/// Longest prefix of `reason` within the byte budget that ends on a
/// character boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
