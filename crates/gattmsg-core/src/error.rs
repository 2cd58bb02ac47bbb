//! 会话错误与 ATT 状态码

use crate::ids::PeerHandle;
use serde::{Deserialize, Serialize};

/// 会话层错误
///
/// 需要 `Clone` 以便通过事件总线广播给多个订阅者。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum SessionError {
    #[error("Bluetooth radio is not powered on")]
    RadioNotReady,

    #[error("Session is not ready: {0}")]
    NotReady(String),

    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Peer {0} is not in disconnected state")]
    PeerBusy(PeerHandle),

    #[error("Already advertising")]
    AlreadyAdvertising,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message exceeds the 512-byte attribute value limit")]
    Encoding,
}

/// 外设应答 ATT 请求时使用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttStatus {
    Success,
    InvalidOffset,
    Failure,
}

impl AttStatus {
    /// ATT 协议中的错误码
    pub fn code(self) -> u8 {
        match self {
            AttStatus::Success => 0x00,
            AttStatus::InvalidOffset => 0x07,
            // Unlikely Error
            AttStatus::Failure => 0x0E,
        }
    }

    pub fn is_success(self) -> bool {
        self == AttStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_att_codes() {
        assert_eq!(AttStatus::Success.code(), 0x00);
        assert_eq!(AttStatus::InvalidOffset.code(), 0x07);
        assert_eq!(AttStatus::Failure.code(), 0x0E);
        assert!(!AttStatus::InvalidOffset.is_success());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::InvalidState {
            operation: "start_scan",
            state: "Connected".to_string(),
        };
        assert_eq!(err.to_string(), "start_scan is not allowed in state Connected");
        assert_eq!(
            SessionError::PeerBusy(PeerHandle::from("AA")).to_string(),
            "Peer AA is not in disconnected state"
        );
    }
}
