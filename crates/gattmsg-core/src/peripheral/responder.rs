//! ATT 请求应答
//!
//! 针对单个可变特征值应答读/写请求。ATT 允许超出 MTU 的分片读写，
//! 因此必须校验 offset。

use log::{debug, warn};

use crate::error::AttStatus;
use crate::ids::{CharacteristicUuid, PeerHandle, RequestId};
use crate::link::PeripheralLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttOperation {
    Read,
    Write,
}

/// 入站 ATT 请求，应答后即销毁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub characteristic: CharacteristicUuid,
    pub offset: usize,
    pub operation: AttOperation,
    pub payload: Option<Vec<u8>>,
    /// 发起请求的中心设备（平台可能不提供）
    pub central: Option<PeerHandle>,
}

impl PendingRequest {
    pub fn read(id: RequestId, characteristic: CharacteristicUuid, offset: usize) -> Self {
        Self {
            id,
            characteristic,
            offset,
            operation: AttOperation::Read,
            payload: None,
            central: None,
        }
    }

    pub fn write(
        id: RequestId,
        characteristic: CharacteristicUuid,
        offset: usize,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            characteristic,
            offset,
            operation: AttOperation::Write,
            payload: Some(payload),
            central: None,
        }
    }

    pub fn from_central(mut self, central: PeerHandle) -> Self {
        self.central = Some(central);
        self
    }
}

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderOutcome {
    /// 没有匹配的请求，未应答
    Ignored,
    /// 已应答（读成功或被拒绝）
    Responded { request: RequestId, status: AttStatus },
    /// 写入已接受，值已替换
    Accepted {
        request: RequestId,
        central: Option<PeerHandle>,
        payload: Vec<u8>,
    },
}

pub struct RequestResponder {
    target: CharacteristicUuid,
    value: Vec<u8>,
}

impl RequestResponder {
    pub fn new(target: CharacteristicUuid, initial: Vec<u8>) -> Self {
        Self {
            target,
            value: initial,
        }
    }

    pub fn target(&self) -> CharacteristicUuid {
        self.target
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = value;
    }

    /// 读请求：返回从 offset 到末尾的后缀
    pub fn handle_read<L: PeripheralLink>(
        &self,
        request: &PendingRequest,
        link: &mut L,
    ) -> ResponderOutcome {
        if request.characteristic != self.target {
            debug!(
                "Read request {} for unrelated characteristic {}",
                request.id, request.characteristic
            );
            return ResponderOutcome::Ignored;
        }

        if request.offset > self.value.len() {
            warn!(
                "Read request {}: invalid offset {} (value is {} bytes)",
                request.id,
                request.offset,
                self.value.len()
            );
            link.respond_to_request(request.id, AttStatus::InvalidOffset, None);
            return ResponderOutcome::Responded {
                request: request.id,
                status: AttStatus::InvalidOffset,
            };
        }

        let suffix = self.value[request.offset..].to_vec();
        debug!(
            "Read request {}: offset={}, returning {} bytes",
            request.id,
            request.offset,
            suffix.len()
        );
        link.respond_to_request(request.id, AttStatus::Success, Some(suffix));
        ResponderOutcome::Responded {
            request: request.id,
            status: AttStatus::Success,
        }
    }

    /// 写请求批次：只处理第一个匹配目标特征的请求，整值替换
    pub fn handle_write_batch<L: PeripheralLink>(
        &mut self,
        requests: &[PendingRequest],
        link: &mut L,
    ) -> ResponderOutcome {
        let Some(request) = requests.iter().find(|r| r.characteristic == self.target) else {
            warn!(
                "No request in batch of {} matches characteristic {}",
                requests.len(),
                self.target
            );
            return ResponderOutcome::Ignored;
        };

        if request.offset > self.value.len() {
            warn!(
                "Write request {}: invalid offset {} (value is {} bytes)",
                request.id,
                request.offset,
                self.value.len()
            );
            link.respond_to_request(request.id, AttStatus::InvalidOffset, None);
            return ResponderOutcome::Responded {
                request: request.id,
                status: AttStatus::InvalidOffset,
            };
        }

        let payload = request.payload.clone().unwrap_or_default();
        debug!(
            "Write request {}: replacing value with {} bytes",
            request.id,
            payload.len()
        );
        self.value.clone_from(&payload);
        link.respond_to_request(request.id, AttStatus::Success, None);

        ResponderOutcome::Accepted {
            request: request.id,
            central: request.central.clone(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::MESSAGE_CHAR_UUID;
    use crate::link::PeripheralRequest;

    const OTHER: CharacteristicUuid =
        CharacteristicUuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    fn responder(value: &[u8]) -> RequestResponder {
        RequestResponder::new(MESSAGE_CHAR_UUID, value.to_vec())
    }

    #[test]
    fn test_read_suffix() {
        let r = responder(b"hello");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        r.handle_read(&PendingRequest::read(RequestId(1), MESSAGE_CHAR_UUID, 2), &mut link);
        assert_eq!(
            link,
            vec![PeripheralRequest::Respond {
                request: RequestId(1),
                status: AttStatus::Success,
                payload: Some(b"llo".to_vec())
            }]
        );
    }

    #[test]
    fn test_read_at_end_is_empty_success() {
        let r = responder(b"hello");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        let outcome =
            r.handle_read(&PendingRequest::read(RequestId(1), MESSAGE_CHAR_UUID, 5), &mut link);
        assert_eq!(
            outcome,
            ResponderOutcome::Responded {
                request: RequestId(1),
                status: AttStatus::Success
            }
        );
        assert_eq!(
            link[0],
            PeripheralRequest::Respond {
                request: RequestId(1),
                status: AttStatus::Success,
                payload: Some(Vec::new())
            }
        );
    }

    #[test]
    fn test_read_past_end_rejected() {
        let r = responder(b"hello");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        r.handle_read(&PendingRequest::read(RequestId(3), MESSAGE_CHAR_UUID, 6), &mut link);
        assert_eq!(
            link,
            vec![PeripheralRequest::Respond {
                request: RequestId(3),
                status: AttStatus::InvalidOffset,
                payload: None
            }]
        );
    }

    #[test]
    fn test_read_unrelated_ignored() {
        let r = responder(b"hello");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        let outcome = r.handle_read(&PendingRequest::read(RequestId(1), OTHER, 0), &mut link);
        assert_eq!(outcome, ResponderOutcome::Ignored);
        assert!(link.is_empty());
    }

    #[test]
    fn test_write_replaces_value() {
        let mut r = responder(b"a much longer value");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        let outcome = r.handle_write_batch(
            &[PendingRequest::write(RequestId(1), MESSAGE_CHAR_UUID, 0, b"hi".to_vec())],
            &mut link,
        );
        assert!(matches!(outcome, ResponderOutcome::Accepted { .. }));
        assert_eq!(r.value(), b"hi");
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut r = responder(b"abc");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        let outcome = r.handle_write_batch(
            &[PendingRequest::write(RequestId(9), MESSAGE_CHAR_UUID, 4, b"zz".to_vec())],
            &mut link,
        );
        assert_eq!(
            outcome,
            ResponderOutcome::Responded {
                request: RequestId(9),
                status: AttStatus::InvalidOffset
            }
        );
        assert_eq!(r.value(), b"abc");
    }

    #[test]
    fn test_write_batch_without_match() {
        let mut r = responder(b"abc");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        let outcome = r.handle_write_batch(
            &[
                PendingRequest::write(RequestId(1), OTHER, 0, b"x".to_vec()),
                PendingRequest::write(RequestId(2), OTHER, 0, b"y".to_vec()),
            ],
            &mut link,
        );
        assert_eq!(outcome, ResponderOutcome::Ignored);
        assert!(link.is_empty());
        assert_eq!(r.value(), b"abc");
    }

    #[test]
    fn test_write_only_first_match() {
        let mut r = responder(b"");
        let mut link: Vec<PeripheralRequest> = Vec::new();
        r.handle_write_batch(
            &[
                PendingRequest::write(RequestId(1), MESSAGE_CHAR_UUID, 0, b"first".to_vec()),
                PendingRequest::write(RequestId(2), MESSAGE_CHAR_UUID, 0, b"second".to_vec()),
            ],
            &mut link,
        );
        assert_eq!(r.value(), b"first");
        assert_eq!(link.len(), 1);
    }
}
