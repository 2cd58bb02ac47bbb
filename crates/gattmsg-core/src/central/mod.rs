//! 中心端 (central) 角色
//!
//! - **discovery**: 逐个服务地发现特征
//! - **session**: 扫描/连接/发现/写入的状态机

pub mod discovery;
pub mod session;

pub use discovery::{DiscoverySequencer, DiscoveryStep};
pub use session::{CentralOptions, CentralSession, CentralState};

use crate::ids::{PeerHandle, ServiceUuid};
use serde::Serialize;

/// 对端连接状态（由会话维护）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PeerStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// 扫描发现的设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPeer {
    pub handle: PeerHandle,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// 广播中携带的服务 UUID
    pub services: Vec<ServiceUuid>,
    pub status: PeerStatus,
}

impl DiscoveredPeer {
    pub fn new(handle: PeerHandle) -> Self {
        Self {
            handle,
            name: None,
            rssi: None,
            services: Vec::new(),
            status: PeerStatus::Disconnected,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceUuid>) -> Self {
        self.services = services;
        self
    }

    pub fn advertises(&self, service: &ServiceUuid) -> bool {
        self.services.contains(service)
    }

    /// 用新的广播报告刷新；报告中缺失的字段保留旧值
    fn refresh(&mut self, report: DiscoveredPeer) {
        if report.name.is_some() {
            self.name = report.name;
        }
        if report.rssi.is_some() {
            self.rssi = report.rssi;
        }
        if !report.services.is_empty() {
            self.services = report.services;
        }
    }
}
