//! 平台协作者接口
//!
//! 会话向平台 BLE 栈发出的请求。所有方法都是"提交即返回"，对应的完成事件
//! 之后作为新事件回到会话。
//!
//! 两种实现:
//! - `Vec<Request>`: 记录请求（测试、回放）
//! - `mpsc::UnboundedSender<Request>`: 驱动任务的请求队列

use crate::error::AttStatus;
use crate::gatt::GattProfile;
use crate::ids::{CharacteristicUuid, PeerHandle, RequestId, ServiceUuid};
use log::warn;
use tokio::sync::mpsc;

/// 中心端发出的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralRequest {
    Scan {
        filter: Option<Vec<ServiceUuid>>,
    },
    StopScan,
    Connect(PeerHandle),
    Disconnect(PeerHandle),
    DiscoverServices(PeerHandle),
    DiscoverCharacteristics {
        peer: PeerHandle,
        service: ServiceUuid,
    },
    SubscribeNotify {
        peer: PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
    },
    WriteCharacteristic {
        peer: PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
        value: Vec<u8>,
    },
}

/// 中心端协作者
pub trait CentralLink {
    fn submit(&mut self, request: CentralRequest);

    fn request_scan(&mut self, filter: Option<Vec<ServiceUuid>>) {
        self.submit(CentralRequest::Scan { filter });
    }

    fn request_stop_scan(&mut self) {
        self.submit(CentralRequest::StopScan);
    }

    fn request_connect(&mut self, peer: &PeerHandle) {
        self.submit(CentralRequest::Connect(peer.clone()));
    }

    fn request_disconnect(&mut self, peer: &PeerHandle) {
        self.submit(CentralRequest::Disconnect(peer.clone()));
    }

    fn request_discover_services(&mut self, peer: &PeerHandle) {
        self.submit(CentralRequest::DiscoverServices(peer.clone()));
    }

    fn request_discover_characteristics(&mut self, peer: &PeerHandle, service: ServiceUuid) {
        self.submit(CentralRequest::DiscoverCharacteristics {
            peer: peer.clone(),
            service,
        });
    }

    fn request_subscribe_notify(
        &mut self,
        peer: &PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
    ) {
        self.submit(CentralRequest::SubscribeNotify {
            peer: peer.clone(),
            service,
            characteristic,
        });
    }

    fn request_write_characteristic(
        &mut self,
        peer: &PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
        value: Vec<u8>,
    ) {
        self.submit(CentralRequest::WriteCharacteristic {
            peer: peer.clone(),
            service,
            characteristic,
            value,
        });
    }
}

/// 外设端发出的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralRequest {
    PublishService(GattProfile),
    StartAdvertising {
        services: Vec<ServiceUuid>,
        local_name: String,
    },
    StopAdvertising,
    Respond {
        request: RequestId,
        status: AttStatus,
        payload: Option<Vec<u8>>,
    },
    NotifyValue {
        characteristic: CharacteristicUuid,
        value: Vec<u8>,
    },
}

/// 外设端协作者
pub trait PeripheralLink {
    fn submit(&mut self, request: PeripheralRequest);

    fn request_publish_service(&mut self, profile: GattProfile) {
        self.submit(PeripheralRequest::PublishService(profile));
    }

    fn request_start_advertising(&mut self, services: Vec<ServiceUuid>, local_name: &str) {
        self.submit(PeripheralRequest::StartAdvertising {
            services,
            local_name: local_name.to_string(),
        });
    }

    fn request_stop_advertising(&mut self) {
        self.submit(PeripheralRequest::StopAdvertising);
    }

    fn respond_to_request(
        &mut self,
        request: RequestId,
        status: AttStatus,
        payload: Option<Vec<u8>>,
    ) {
        self.submit(PeripheralRequest::Respond {
            request,
            status,
            payload,
        });
    }

    fn request_notify_value(&mut self, characteristic: CharacteristicUuid, value: Vec<u8>) {
        self.submit(PeripheralRequest::NotifyValue {
            characteristic,
            value,
        });
    }
}

impl CentralLink for Vec<CentralRequest> {
    fn submit(&mut self, request: CentralRequest) {
        self.push(request);
    }
}

impl PeripheralLink for Vec<PeripheralRequest> {
    fn submit(&mut self, request: PeripheralRequest) {
        self.push(request);
    }
}

impl CentralLink for mpsc::UnboundedSender<CentralRequest> {
    fn submit(&mut self, request: CentralRequest) {
        if let Err(e) = self.send(request) {
            warn!("Central driver is gone, dropping {:?}", e.0);
        }
    }
}

impl PeripheralLink for mpsc::UnboundedSender<PeripheralRequest> {
    fn submit(&mut self, request: PeripheralRequest) {
        if let Err(e) = self.send(request) {
            warn!("Peripheral driver is gone, dropping {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};

    #[test]
    fn test_vec_records_in_order() {
        let peer = PeerHandle::from("AA:BB");
        let mut link: Vec<CentralRequest> = Vec::new();
        link.request_connect(&peer);
        link.request_discover_characteristics(&peer, MESSAGE_SERVICE_UUID);

        assert_eq!(
            link,
            vec![
                CentralRequest::Connect(peer.clone()),
                CentralRequest::DiscoverCharacteristics {
                    peer,
                    service: MESSAGE_SERVICE_UUID
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_unbounded_sender_link() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<PeripheralRequest>();
        tx.request_notify_value(MESSAGE_CHAR_UUID, b"hi".to_vec());
        tx.respond_to_request(RequestId(7), AttStatus::InvalidOffset, None);

        assert_eq!(
            rx.recv().await,
            Some(PeripheralRequest::NotifyValue {
                characteristic: MESSAGE_CHAR_UUID,
                value: b"hi".to_vec()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(PeripheralRequest::Respond {
                request: RequestId(7),
                status: AttStatus::InvalidOffset,
                payload: None
            })
        );
    }

    #[test]
    fn test_send_after_driver_dropped() {
        let (mut tx, rx) = mpsc::unbounded_channel::<CentralRequest>();
        drop(rx);
        // 只记录警告，不 panic
        tx.request_stop_scan();
    }
}
