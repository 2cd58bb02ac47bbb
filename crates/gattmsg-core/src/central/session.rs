//! 中心端会话状态机
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> DiscoveringServices
//!      -> DiscoveringCharacteristics -> Ready
//! Connected/Discovering*/Ready -> Disconnecting -> Idle
//! 任意状态 -> Idle (断开连接或致命传输错误)
//! ```
//!
//! 所有操作同步且不阻塞：需要无线电参与的步骤只向 `CentralLink` 提交请求，
//! 完成事件随后通过 `on_*` 方法回到会话。

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::central::discovery::{DiscoverySequencer, DiscoveryStep};
use crate::central::{DiscoveredPeer, PeerStatus};
use crate::codec::MessageCodec;
use crate::error::SessionError;
use crate::events::{DiscoveryFailure, EventBus, RadioState, SessionEvent};
use crate::gatt::{Catalog, CharacteristicRecord, GattProfile};
use crate::ids::{CharacteristicUuid, PeerHandle, ServiceUuid};
use crate::link::CentralLink;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CentralState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnecting,
}

impl CentralState {
    /// 链路已建立（Connected 及之后，不含 Disconnecting）
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            CentralState::Connected
                | CentralState::DiscoveringServices
                | CentralState::DiscoveringCharacteristics
                | CentralState::Ready
        )
    }
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 中心端选项
#[derive(Debug, Clone)]
pub struct CentralOptions {
    pub profile: GattProfile,
    /// 扫描过滤；`None` 表示扫描所有设备
    pub scan_filter: Option<Vec<ServiceUuid>>,
    /// 忽略没有名称的设备
    pub require_peer_name: bool,
}

impl Default for CentralOptions {
    fn default() -> Self {
        Self {
            profile: GattProfile::default(),
            scan_filter: None,
            require_peer_name: true,
        }
    }
}

pub struct CentralSession<L: CentralLink> {
    link: L,
    options: CentralOptions,
    state: CentralState,
    radio: RadioState,
    peers: Vec<DiscoveredPeer>,
    /// 正在连接或已连接的对端
    target: Option<PeerHandle>,
    connected_peer: Option<PeerHandle>,
    catalog: Catalog,
    sequencer: DiscoverySequencer,
    /// 已提交、等待完成的写入
    writes_in_flight: VecDeque<(CharacteristicUuid, Vec<u8>)>,
    bus: EventBus,
}

impl<L: CentralLink> CentralSession<L> {
    pub fn new(link: L, options: CentralOptions) -> Self {
        Self {
            link,
            options,
            state: CentralState::Idle,
            radio: RadioState::Unknown,
            peers: Vec::new(),
            target: None,
            connected_peer: None,
            catalog: Catalog::new(),
            sequencer: DiscoverySequencer::new(),
            writes_in_flight: VecDeque::new(),
            bus: EventBus::new(),
        }
    }

    pub fn state(&self) -> CentralState {
        self.state
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    pub fn connected_peer(&self) -> Option<&PeerHandle> {
        self.connected_peer.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn profile(&self) -> &GattProfile {
        &self.options.profile
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn pending_discoveries(&self) -> usize {
        self.sequencer.remaining()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ------------------------------------------------------------------
    // 用户操作
    // ------------------------------------------------------------------

    pub fn start_scan(&mut self) -> Result<(), SessionError> {
        self.expect_state("start_scan", &[CentralState::Idle])?;
        if !self.radio.is_powered_on() {
            warn!("Cannot scan, radio state is {:?}", self.radio);
            return Err(SessionError::RadioNotReady);
        }

        self.peers.clear();
        self.emit_peers();
        self.link.request_scan(self.options.scan_filter.clone());
        self.set_state(CentralState::Scanning);
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<(), SessionError> {
        self.expect_state("stop_scan", &[CentralState::Scanning])?;
        self.link.request_stop_scan();
        self.set_state(CentralState::Idle);
        Ok(())
    }

    /// 连接对端；扫描中会先停止扫描（扫描和连接在无线电上互斥）
    pub fn connect(&mut self, peer: &PeerHandle) -> Result<(), SessionError> {
        self.expect_state("connect", &[CentralState::Idle, CentralState::Scanning])?;

        let status = self
            .peers
            .iter()
            .find(|p| &p.handle == peer)
            .map_or(PeerStatus::Disconnected, |p| p.status);
        if status != PeerStatus::Disconnected {
            return Err(SessionError::PeerBusy(peer.clone()));
        }

        if self.state == CentralState::Scanning {
            self.link.request_stop_scan();
        }

        info!("Connecting to {}", peer);
        self.target = Some(peer.clone());
        self.set_peer_status(peer, PeerStatus::Connecting);
        self.link.request_connect(peer);
        self.set_state(CentralState::Connecting);
        Ok(())
    }

    /// 请求断开；状态复位发生在 `on_disconnected`
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if !self.state.is_linked() {
            return Err(self.invalid_state("disconnect"));
        }
        let Some(peer) = self.connected_peer.clone() else {
            return Err(self.invalid_state("disconnect"));
        };

        let abandoned = self.sequencer.abandon();
        if abandoned > 0 {
            debug!("Abandoning {} queued characteristic discoveries", abandoned);
        }
        info!("Disconnecting from {}", peer);
        self.link.request_disconnect(&peer);
        self.set_state(CentralState::Disconnecting);
        Ok(())
    }

    /// 写特征（带响应）
    pub fn write(
        &mut self,
        characteristic: CharacteristicUuid,
        value: Vec<u8>,
    ) -> Result<(), SessionError> {
        if self.state != CentralState::Ready {
            return Err(SessionError::NotReady(format!(
                "session is in state {}",
                self.state
            )));
        }
        let record = self.writable_characteristic(&characteristic)?;
        let service = record.service;
        let Some(peer) = self.connected_peer.clone() else {
            return Err(SessionError::NotReady("no connected peer".to_string()));
        };

        debug!(
            "Writing {} bytes to {} on {}",
            value.len(),
            characteristic,
            peer
        );
        self.writes_in_flight
            .push_back((characteristic, value.clone()));
        self.link
            .request_write_characteristic(&peer, service, characteristic, value);
        Ok(())
    }

    /// 编码文本并写入消息特征
    pub fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        let payload = MessageCodec::encode(text)?;
        self.write(self.options.profile.message, payload)
    }

    // ------------------------------------------------------------------
    // 协作者事件
    // ------------------------------------------------------------------

    pub fn on_radio_state_changed(&mut self, state: RadioState) {
        if self.radio == state {
            return;
        }
        info!("Radio state: {:?} -> {:?}", self.radio, state);
        self.radio = state;
        self.bus.emit(SessionEvent::RadioStateChanged { state });

        if !state.is_powered_on() && self.state != CentralState::Idle {
            self.on_transport_error(format!("radio is {:?}", state));
        }
    }

    pub fn on_peer_discovered(&mut self, report: DiscoveredPeer) {
        if self.state != CentralState::Scanning {
            trace!("Ignoring advertisement from {} outside scan", report.handle);
            return;
        }
        if let Some(existing) = self.peers.iter_mut().find(|p| p.handle == report.handle) {
            existing.refresh(report);
        } else {
            if self.options.require_peer_name && report.name.is_none() {
                trace!("Ignoring unnamed peer {}", report.handle);
                return;
            }
            debug!(
                "Peer discovered: {} name={:?} rssi={:?}",
                report.handle, report.name, report.rssi
            );
            self.peers.push(report);
        }
        self.emit_peers();
    }

    pub fn on_connected(&mut self, peer: &PeerHandle) {
        if self.state != CentralState::Connecting || self.target.as_ref() != Some(peer) {
            warn!("Unexpected connection event from {} in {}", peer, self.state);
            return;
        }

        info!("Connected to {}", peer);
        self.connected_peer = Some(peer.clone());
        self.set_peer_status(peer, PeerStatus::Connected);
        self.set_state(CentralState::Connected);

        self.link.request_discover_services(peer);
        self.set_state(CentralState::DiscoveringServices);
    }

    pub fn on_connect_failed(&mut self, peer: &PeerHandle, error: &str) {
        if self.state != CentralState::Connecting || self.target.as_ref() != Some(peer) {
            debug!("Ignoring connect failure from {}: {}", peer, error);
            return;
        }
        error!("Failed to connect to {}: {}", peer, error);
        self.bus.emit(SessionEvent::TransportError {
            message: format!("connect to {peer} failed: {error}"),
        });
        self.reset();
    }

    /// 链路断开；错误会上报，但不阻止复位
    pub fn on_disconnected(&mut self, peer: &PeerHandle, error: Option<&str>) {
        if self.target.as_ref() != Some(peer) {
            debug!("Ignoring disconnect of unrelated peer {}", peer);
            return;
        }
        match error {
            Some(e) => {
                warn!("Disconnected from {}: {}", peer, e);
                self.bus.emit(SessionEvent::TransportError {
                    message: format!("disconnected from {peer}: {e}"),
                });
            }
            None => info!("Disconnected from {}", peer),
        }
        self.reset();
    }

    pub fn on_services_discovered(&mut self, peer: &PeerHandle, services: Vec<ServiceUuid>) {
        if !self.accepts_discovery(peer, CentralState::DiscoveringServices) {
            return;
        }
        debug!("{} service(s) discovered on {}", services.len(), peer);
        match self
            .sequencer
            .begin(peer, services, &mut self.catalog, &mut self.link)
        {
            DiscoveryStep::Pending => self.set_state(CentralState::DiscoveringCharacteristics),
            DiscoveryStep::Failed(reason) => self.discovery_failed(reason),
            DiscoveryStep::Complete | DiscoveryStep::Ignored => {}
        }
    }

    pub fn on_service_discovery_error(&mut self, peer: &PeerHandle, error: &str) {
        if !self.accepts_discovery(peer, CentralState::DiscoveringServices) {
            return;
        }
        error!("Service discovery on {} failed: {}", peer, error);
        self.discovery_failed(DiscoveryFailure::Transport(error.to_string()));
    }

    pub fn on_characteristics_discovered(
        &mut self,
        peer: &PeerHandle,
        service: ServiceUuid,
        result: Result<Vec<CharacteristicRecord>, String>,
    ) {
        if !self.accepts_discovery(peer, CentralState::DiscoveringCharacteristics) {
            return;
        }
        match self.sequencer.on_characteristics_discovered(
            peer,
            service,
            result,
            &mut self.catalog,
            &mut self.link,
        ) {
            DiscoveryStep::Complete => {
                self.set_state(CentralState::Ready);
                self.bus.emit(SessionEvent::DiscoveryComplete {
                    catalog: self.catalog.clone(),
                });
            }
            DiscoveryStep::Failed(reason) => self.discovery_failed(reason),
            DiscoveryStep::Pending | DiscoveryStep::Ignored => {}
        }
    }

    pub fn on_write_completed(
        &mut self,
        peer: &PeerHandle,
        characteristic: CharacteristicUuid,
        result: Result<(), String>,
    ) {
        if self.connected_peer.as_ref() != Some(peer) {
            debug!("Ignoring write completion from {}", peer);
            return;
        }
        let written = self
            .writes_in_flight
            .iter()
            .position(|(uuid, _)| *uuid == characteristic)
            .and_then(|i| self.writes_in_flight.remove(i));

        let result = match result {
            Ok(()) => {
                if let Some((_, value)) = written {
                    self.catalog.set_cached_value(&characteristic, value);
                }
                debug!("Write to {} acknowledged", characteristic);
                Ok(())
            }
            Err(e) => {
                warn!("Write to {} failed: {}", characteristic, e);
                Err(SessionError::Transport(e))
            }
        };
        self.bus.emit(SessionEvent::WriteCompleted {
            characteristic,
            result,
        });
    }

    /// 对端通知或读取返回的新值
    pub fn on_value_updated(
        &mut self,
        peer: &PeerHandle,
        characteristic: CharacteristicUuid,
        value: &[u8],
    ) {
        if self.connected_peer.as_ref() != Some(peer) {
            debug!("Ignoring value update from {}", peer);
            return;
        }
        if !self.catalog.set_cached_value(&characteristic, value.to_vec()) {
            debug!("Value update for unknown characteristic {}", characteristic);
        }
        if characteristic != self.options.profile.message {
            return;
        }
        if let Some(text) = MessageCodec::decode(value) {
            info!("Message from {} ({} bytes)", peer, value.len());
            self.bus.emit(SessionEvent::MessageReceived {
                from: Some(peer.clone()),
                text,
            });
        }
    }

    /// 致命传输错误：上报并复位到 Idle
    pub fn on_transport_error(&mut self, message: String) {
        error!("Transport error: {}", message);
        self.bus.emit(SessionEvent::TransportError { message });
        if self.state == CentralState::Scanning {
            self.link.request_stop_scan();
        }
        if self.state != CentralState::Idle {
            self.reset();
        }
    }

    /// 订阅通知失败只上报，链路和已发现的目录保持不变
    pub fn on_subscribe_failed(
        &mut self,
        peer: &PeerHandle,
        characteristic: CharacteristicUuid,
        error: &str,
    ) {
        if self.connected_peer.as_ref() != Some(peer) {
            debug!("Ignoring subscribe failure from {}", peer);
            return;
        }
        warn!("Failed to subscribe to {} on {}: {}", characteristic, peer, error);
        self.bus.emit(SessionEvent::TransportError {
            message: format!("subscribe to {characteristic} failed: {error}"),
        });
    }

    // ------------------------------------------------------------------
    // 内部
    // ------------------------------------------------------------------

    fn reset(&mut self) {
        let abandoned = self.sequencer.abandon();
        if abandoned > 0 {
            debug!("Discarding {} queued characteristic discoveries", abandoned);
        }
        if let Some(peer) = self.target.take() {
            self.set_peer_status(&peer, PeerStatus::Disconnected);
        }
        self.connected_peer = None;
        self.catalog.clear();
        self.writes_in_flight.clear();
        self.set_state(CentralState::Idle);
    }

    fn discovery_failed(&mut self, reason: DiscoveryFailure) {
        self.sequencer.abandon();
        self.bus.emit(SessionEvent::DiscoveryFailed { reason });
        self.set_state(CentralState::Connected);
    }

    fn accepts_discovery(&self, peer: &PeerHandle, expected: CentralState) -> bool {
        if self.state != expected || self.connected_peer.as_ref() != Some(peer) {
            debug!(
                "Ignoring discovery event from {} in state {}",
                peer, self.state
            );
            return false;
        }
        true
    }

    fn writable_characteristic(
        &self,
        characteristic: &CharacteristicUuid,
    ) -> Result<&CharacteristicRecord, SessionError> {
        let record = self.catalog.characteristic(characteristic).ok_or_else(|| {
            SessionError::NotReady(format!("characteristic {characteristic} not discovered"))
        })?;
        if !record.properties.write {
            return Err(SessionError::NotReady(format!(
                "characteristic {characteristic} is not writable"
            )));
        }
        Ok(record)
    }

    fn set_state(&mut self, next: CentralState) {
        if self.state == next {
            return;
        }
        debug!("Central state: {} -> {}", self.state, next);
        self.state = next;
        self.bus.emit(SessionEvent::ConnectionStateChanged {
            state: next,
            peer: self.target.clone(),
        });
    }

    fn set_peer_status(&mut self, peer: &PeerHandle, status: PeerStatus) {
        let changed = match self.peers.iter_mut().find(|p| &p.handle == peer) {
            Some(p) if p.status != status => {
                p.status = status;
                true
            }
            _ => false,
        };
        if changed {
            self.emit_peers();
        }
    }

    fn emit_peers(&self) {
        self.bus.emit(SessionEvent::PeerListChanged {
            peers: self.peers.clone(),
        });
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[CentralState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }
}
