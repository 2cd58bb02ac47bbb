//! 特征发现序列器
//!
//! 平台原语一次只能发现一个服务的特征，所以把服务发现的结果排成队列，
//! 上一个服务的完成事件到达后才发出下一个请求，从不并发。
//!
//! 流程:
//! 1. `begin`: 服务列表入队，为队首请求特征发现
//! 2. `on_characteristics_discovered`: 写入 Catalog，为 notify 特征请求订阅，出队
//! 3. 队列非空则继续下一个，否则整体完成

use log::{debug, error, info, warn};
use std::collections::VecDeque;

use crate::events::DiscoveryFailure;
use crate::gatt::{Catalog, CharacteristicRecord, ServiceRecord};
use crate::ids::{PeerHandle, ServiceUuid};
use crate::link::CentralLink;

/// 序列器处理一个事件后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStep {
    /// 已发出下一个发现请求
    Pending,
    /// 所有服务的特征均已发现
    Complete,
    Failed(DiscoveryFailure),
    /// 事件与当前队列不符，已忽略
    Ignored,
}

#[derive(Debug, Default)]
pub struct DiscoverySequencer {
    queue: VecDeque<ServiceUuid>,
}

impl DiscoverySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 服务发现完成
    ///
    /// 重复的服务 UUID 不去重，会各自处理一次。
    pub fn begin<L: CentralLink>(
        &mut self,
        peer: &PeerHandle,
        services: Vec<ServiceUuid>,
        catalog: &mut Catalog,
        link: &mut L,
    ) -> DiscoveryStep {
        self.queue.clear();

        if services.is_empty() {
            warn!("Peer {} exposes no services", peer);
            return DiscoveryStep::Failed(DiscoveryFailure::NoServices);
        }

        for service in &services {
            catalog.upsert_service(ServiceRecord::new(*service));
        }
        self.queue.extend(services);

        debug!(
            "Discovering characteristics for {} service(s) on {}",
            self.queue.len(),
            peer
        );
        self.request_front(peer, link);
        DiscoveryStep::Pending
    }

    /// 某个服务的特征发现完成
    pub fn on_characteristics_discovered<L: CentralLink>(
        &mut self,
        peer: &PeerHandle,
        service: ServiceUuid,
        result: Result<Vec<CharacteristicRecord>, String>,
        catalog: &mut Catalog,
        link: &mut L,
    ) -> DiscoveryStep {
        match self.queue.front() {
            None => {
                warn!(
                    "Characteristics for {} arrived with no discovery in flight",
                    service
                );
                return DiscoveryStep::Ignored;
            }
            Some(front) if *front != service => {
                warn!(
                    "Characteristics for {} arrived while waiting for {}",
                    service, front
                );
                return DiscoveryStep::Ignored;
            }
            Some(_) => {}
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                error!("Characteristic discovery for {} failed: {}", service, e);
                let abandoned = self.abandon();
                debug!("Abandoned {} queued service(s)", abandoned);
                return DiscoveryStep::Failed(DiscoveryFailure::Transport(e));
            }
        };

        let mut record = ServiceRecord::new(service);
        for characteristic in characteristics {
            let characteristic = CharacteristicRecord {
                service,
                ..characteristic
            };
            record.characteristics.insert(characteristic.uuid);
            if characteristic.properties.notify {
                debug!("Subscribing to notifications of {}", characteristic.uuid);
                link.request_subscribe_notify(peer, service, characteristic.uuid);
            }
            catalog.upsert_characteristic(characteristic);
        }
        debug!(
            "Service {}: {} characteristic(s)",
            service,
            record.characteristics.len()
        );
        catalog.upsert_service(record);

        self.queue.pop_front();
        if self.queue.is_empty() {
            info!("GATT discovery complete for {}", peer);
            DiscoveryStep::Complete
        } else {
            debug!("Discovering characteristics for the next service");
            self.request_front(peer, link);
            DiscoveryStep::Pending
        }
    }

    /// 丢弃队列，返回被丢弃的服务数
    pub fn abandon(&mut self) -> usize {
        let remaining = self.queue.len();
        self.queue.clear();
        remaining
    }

    pub fn is_active(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    fn request_front<L: CentralLink>(&self, peer: &PeerHandle, link: &mut L) {
        if let Some(service) = self.queue.front() {
            link.request_discover_characteristics(peer, *service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{CharProperties, MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};
    use crate::ids::CharacteristicUuid;
    use crate::link::CentralRequest;

    const BATTERY: ServiceUuid = ServiceUuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    const LEVEL: CharacteristicUuid =
        CharacteristicUuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    fn peer() -> PeerHandle {
        PeerHandle::from("AA:BB:CC:DD:EE:FF")
    }

    #[test]
    fn test_empty_services_fail() {
        let mut seq = DiscoverySequencer::new();
        let mut catalog = Catalog::new();
        let mut link: Vec<CentralRequest> = Vec::new();

        let step = seq.begin(&peer(), vec![], &mut catalog, &mut link);
        assert_eq!(step, DiscoveryStep::Failed(DiscoveryFailure::NoServices));
        assert!(link.is_empty());
        assert!(!seq.is_active());
    }

    #[test]
    fn test_sequential_requests() {
        let mut seq = DiscoverySequencer::new();
        let mut catalog = Catalog::new();
        let mut link: Vec<CentralRequest> = Vec::new();

        seq.begin(
            &peer(),
            vec![BATTERY, MESSAGE_SERVICE_UUID],
            &mut catalog,
            &mut link,
        );
        // 只为队首发出请求
        assert_eq!(
            link,
            vec![CentralRequest::DiscoverCharacteristics {
                peer: peer(),
                service: BATTERY
            }]
        );

        let level = CharacteristicRecord::new(
            LEVEL,
            BATTERY,
            CharProperties {
                read: true,
                ..Default::default()
            },
        );
        let step = seq.on_characteristics_discovered(
            &peer(),
            BATTERY,
            Ok(vec![level]),
            &mut catalog,
            &mut link,
        );
        assert_eq!(step, DiscoveryStep::Pending);
        assert_eq!(
            link.last(),
            Some(&CentralRequest::DiscoverCharacteristics {
                peer: peer(),
                service: MESSAGE_SERVICE_UUID
            })
        );

        let message = CharacteristicRecord::new(
            MESSAGE_CHAR_UUID,
            MESSAGE_SERVICE_UUID,
            CharProperties::MESSAGE,
        );
        let step = seq.on_characteristics_discovered(
            &peer(),
            MESSAGE_SERVICE_UUID,
            Ok(vec![message]),
            &mut catalog,
            &mut link,
        );
        assert_eq!(step, DiscoveryStep::Complete);
        assert_eq!(
            link.last(),
            Some(&CentralRequest::SubscribeNotify {
                peer: peer(),
                service: MESSAGE_SERVICE_UUID,
                characteristic: MESSAGE_CHAR_UUID
            })
        );
        assert!(
            catalog
                .service(&MESSAGE_SERVICE_UUID)
                .is_some_and(|s| s.characteristics.contains(&MESSAGE_CHAR_UUID))
        );
        assert!(catalog.characteristic(&LEVEL).is_some());
    }

    #[test]
    fn test_out_of_order_completion_ignored() {
        let mut seq = DiscoverySequencer::new();
        let mut catalog = Catalog::new();
        let mut link: Vec<CentralRequest> = Vec::new();

        seq.begin(
            &peer(),
            vec![BATTERY, MESSAGE_SERVICE_UUID],
            &mut catalog,
            &mut link,
        );
        let step = seq.on_characteristics_discovered(
            &peer(),
            MESSAGE_SERVICE_UUID,
            Ok(vec![]),
            &mut catalog,
            &mut link,
        );
        assert_eq!(step, DiscoveryStep::Ignored);
        assert_eq!(seq.remaining(), 2);
    }

    #[test]
    fn test_transport_error_abandons_queue() {
        let mut seq = DiscoverySequencer::new();
        let mut catalog = Catalog::new();
        let mut link: Vec<CentralRequest> = Vec::new();

        seq.begin(
            &peer(),
            vec![BATTERY, MESSAGE_SERVICE_UUID],
            &mut catalog,
            &mut link,
        );
        let step = seq.on_characteristics_discovered(
            &peer(),
            BATTERY,
            Err("GATT timeout".to_string()),
            &mut catalog,
            &mut link,
        );
        assert_eq!(
            step,
            DiscoveryStep::Failed(DiscoveryFailure::Transport("GATT timeout".to_string()))
        );
        assert!(!seq.is_active());
        assert_eq!(link.len(), 1);
    }

    #[test]
    fn test_duplicate_services_processed_twice() {
        let mut seq = DiscoverySequencer::new();
        let mut catalog = Catalog::new();
        let mut link: Vec<CentralRequest> = Vec::new();

        seq.begin(
            &peer(),
            vec![MESSAGE_SERVICE_UUID, MESSAGE_SERVICE_UUID],
            &mut catalog,
            &mut link,
        );
        let first = seq.on_characteristics_discovered(
            &peer(),
            MESSAGE_SERVICE_UUID,
            Ok(vec![]),
            &mut catalog,
            &mut link,
        );
        assert_eq!(first, DiscoveryStep::Pending);

        let message = CharacteristicRecord::new(
            MESSAGE_CHAR_UUID,
            MESSAGE_SERVICE_UUID,
            CharProperties::MESSAGE,
        );
        let second = seq.on_characteristics_discovered(
            &peer(),
            MESSAGE_SERVICE_UUID,
            Ok(vec![message]),
            &mut catalog,
            &mut link,
        );
        assert_eq!(second, DiscoveryStep::Complete);
        assert_eq!(catalog.services().count(), 1);
        assert_eq!(
            catalog
                .service(&MESSAGE_SERVICE_UUID)
                .map(|s| s.characteristics.len()),
            Some(1)
        );
    }
}
