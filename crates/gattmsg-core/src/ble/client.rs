//! BLE Client - 中心端驱动 (btleplug)
//!
//! 一个 tokio 任务独占 `CentralSession`，在同一个 `select!` 中处理:
//! 1. 用户命令（通过 `CentralHandle`）
//! 2. 适配器事件（设备发现、断开）
//! 3. 会话排队的 `CentralRequest`
//! 4. 派生任务的完成事件（连接、发现、写入、通知）
//!
//! 会话本身从不等待无线电，所有耗时操作都在派生任务里完成后回送。

use crate::central::{CentralOptions, CentralSession, CentralState, DiscoveredPeer};
use crate::error::SessionError;
use crate::events::{EventBus, RadioState, SessionEvent};
use crate::gatt::{Catalog, CharProperties, CharacteristicRecord};
use crate::ids::{CharacteristicUuid, PeerHandle, ServiceUuid, canonical_key};
use crate::link::{CentralLink, CentralRequest};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures_util::{Stream, StreamExt};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// BLE 客户端错误
#[derive(Debug, thiserror::Error)]
pub enum BleClientError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(PeerHandle),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Central driver has stopped")]
    DriverStopped,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

/// ATT 属性值的最大长度
const MAX_ATTRIBUTE_LEN: usize = 512;

/// 驱动任务当前状态的快照
#[derive(Debug, Clone, Serialize)]
pub struct CentralSnapshot {
    pub state: CentralState,
    pub radio: RadioState,
    pub peers: Vec<DiscoveredPeer>,
    pub connected_peer: Option<PeerHandle>,
    pub catalog: Catalog,
}

enum CentralCommand {
    StartScan(Reply),
    StopScan(Reply),
    Connect(PeerHandle, Reply),
    Disconnect(Reply),
    SendText(String, Reply),
    Snapshot(oneshot::Sender<CentralSnapshot>),
    Shutdown,
}

/// 派生任务回送给驱动循环的结果
enum Completion {
    Connected(PeerHandle),
    ConnectFailed(PeerHandle, String),
    ServicesDiscovered(PeerHandle, Result<Vec<ServiceUuid>, String>),
    CharacteristicsDiscovered(
        PeerHandle,
        ServiceUuid,
        Result<Vec<CharacteristicRecord>, String>,
    ),
    WriteCompleted(PeerHandle, CharacteristicUuid, Result<(), String>),
    ValueUpdated(PeerHandle, CharacteristicUuid, Vec<u8>),
    SubscribeFailed(PeerHandle, CharacteristicUuid, String),
    /// 扫描或断开失败，会话需要复位
    TransportError(String),
}

pub struct BleClient {
    adapter: Adapter,
}

impl BleClient {
    pub async fn new() -> Result<Self, BleClientError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BleClientError::NoAdapter)?;

        Ok(Self { adapter })
    }

    /// 启动驱动任务
    pub async fn start(self, options: CentralOptions) -> Result<CentralHandle, BleClientError> {
        let events = self.adapter.events().await?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let session = CentralSession::new(request_tx, options);
        let bus = session.bus().clone();

        let driver = CentralDriver {
            adapter: self.adapter,
            peripherals: HashMap::new(),
            notification_tasks: HashMap::new(),
            completion_tx,
        };

        let task = tokio::spawn(run_central(
            session,
            driver,
            command_rx,
            request_rx,
            completion_rx,
            events,
        ));

        Ok(CentralHandle {
            commands: command_tx,
            bus,
            task,
        })
    }
}

/// 驱动任务的句柄
pub struct CentralHandle {
    commands: mpsc::Sender<CentralCommand>,
    bus: EventBus,
    task: JoinHandle<()>,
}

impl CentralHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub async fn start_scan(&self) -> Result<(), BleClientError> {
        self.call(CentralCommand::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleClientError> {
        self.call(CentralCommand::StopScan).await
    }

    pub async fn connect(&self, peer: PeerHandle) -> Result<(), BleClientError> {
        self.call(|reply| CentralCommand::Connect(peer, reply)).await
    }

    pub async fn disconnect(&self) -> Result<(), BleClientError> {
        self.call(CentralCommand::Disconnect).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), BleClientError> {
        let text = text.into();
        self.call(|reply| CentralCommand::SendText(text, reply))
            .await
    }

    pub async fn snapshot(&self) -> Result<CentralSnapshot, BleClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CentralCommand::Snapshot(tx))
            .await
            .map_err(|_| BleClientError::DriverStopped)?;
        rx.await.map_err(|_| BleClientError::DriverStopped)
    }

    /// 断开连接并停止驱动任务
    pub async fn shutdown(self) {
        let _ = self.commands.send(CentralCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Central driver task ended abnormally: {}", e);
        }
    }

    async fn call(
        &self,
        command: impl FnOnce(Reply) -> CentralCommand,
    ) -> Result<(), BleClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| BleClientError::DriverStopped)?;
        rx.await.map_err(|_| BleClientError::DriverStopped)??;
        Ok(())
    }
}

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

async fn run_central(
    mut session: CentralSession<mpsc::UnboundedSender<CentralRequest>>,
    mut driver: CentralDriver,
    mut commands: mpsc::Receiver<CentralCommand>,
    mut requests: mpsc::UnboundedReceiver<CentralRequest>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    mut events: EventStream,
) {
    // btleplug 没有可移植的电源状态查询，拿到适配器即视为可用
    session.on_radio_state_changed(RadioState::PoweredOn);
    debug!("Central driver started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(CentralCommand::Shutdown) | None => break,
                Some(command) => handle_command(&mut session, command),
            },
            Some(request) = requests.recv() => driver.execute(request).await,
            Some(completion) = completions.recv() => apply_completion(&mut session, completion),
            event = events.next() => match event {
                Some(event) => driver.handle_adapter_event(&mut session, event).await,
                None => {
                    warn!("Adapter event stream closed");
                    session.on_radio_state_changed(RadioState::Unknown);
                    break;
                }
            },
        }
    }

    // 退出前断开仍在使用的连接
    if session.state() == CentralState::Scanning {
        let _ = driver.adapter.stop_scan().await;
    }
    if let Some(peer) = session.connected_peer().cloned() {
        driver.execute(CentralRequest::Disconnect(peer)).await;
    }
    debug!("Central driver stopped");
}

fn handle_command(
    session: &mut CentralSession<mpsc::UnboundedSender<CentralRequest>>,
    command: CentralCommand,
) {
    match command {
        CentralCommand::StartScan(reply) => {
            let _ = reply.send(session.start_scan());
        }
        CentralCommand::StopScan(reply) => {
            let _ = reply.send(session.stop_scan());
        }
        CentralCommand::Connect(peer, reply) => {
            let _ = reply.send(session.connect(&peer));
        }
        CentralCommand::Disconnect(reply) => {
            let _ = reply.send(session.disconnect());
        }
        CentralCommand::SendText(text, reply) => {
            let _ = reply.send(session.send_text(&text));
        }
        CentralCommand::Snapshot(reply) => {
            let _ = reply.send(CentralSnapshot {
                state: session.state(),
                radio: session.radio_state(),
                peers: session.peers().to_vec(),
                connected_peer: session.connected_peer().cloned(),
                catalog: session.catalog().clone(),
            });
        }
        CentralCommand::Shutdown => {}
    }
}

fn apply_completion<L: CentralLink>(session: &mut CentralSession<L>, completion: Completion) {
    match completion {
        Completion::Connected(peer) => session.on_connected(&peer),
        Completion::ConnectFailed(peer, e) => session.on_connect_failed(&peer, &e),
        Completion::ServicesDiscovered(peer, Ok(services)) => {
            session.on_services_discovered(&peer, services);
        }
        Completion::ServicesDiscovered(peer, Err(e)) => {
            session.on_service_discovery_error(&peer, &e);
        }
        Completion::CharacteristicsDiscovered(peer, service, result) => {
            session.on_characteristics_discovered(&peer, service, result);
        }
        Completion::WriteCompleted(peer, characteristic, result) => {
            session.on_write_completed(&peer, characteristic, result);
        }
        Completion::ValueUpdated(peer, characteristic, value) => {
            session.on_value_updated(&peer, characteristic, &value);
        }
        Completion::SubscribeFailed(peer, characteristic, e) => {
            session.on_subscribe_failed(&peer, characteristic, &e);
        }
        Completion::TransportError(message) => session.on_transport_error(message),
    }
}

struct CentralDriver {
    adapter: Adapter,
    peripherals: HashMap<PeerHandle, PlatformPeripheral>,
    notification_tasks: HashMap<PeerHandle, JoinHandle<()>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl CentralDriver {
    async fn execute(&mut self, request: CentralRequest) {
        trace!("Executing {:?}", request);
        match request {
            CentralRequest::Scan { filter } => {
                let filter = ScanFilter {
                    services: filter
                        .unwrap_or_default()
                        .into_iter()
                        .map(Uuid::from)
                        .collect(),
                };
                info!("Starting BLE scan");
                if let Err(e) = self.adapter.start_scan(filter).await {
                    error!("Failed to start scan: {}", e);
                    let _ = self
                        .completion_tx
                        .send(Completion::TransportError(format!("scan failed: {e}")));
                }
            }
            CentralRequest::StopScan => {
                debug!("Stopping BLE scan");
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            CentralRequest::Connect(peer) => self.connect(peer).await,
            CentralRequest::Disconnect(peer) => self.disconnect(&peer).await,
            CentralRequest::DiscoverServices(peer) => self.discover_services(peer),
            CentralRequest::DiscoverCharacteristics { peer, service } => {
                let result = self
                    .characteristics(&peer, service)
                    .map_err(|e| e.to_string());
                let _ = self
                    .completion_tx
                    .send(Completion::CharacteristicsDiscovered(peer, service, result));
            }
            CentralRequest::SubscribeNotify {
                peer,
                service,
                characteristic,
            } => self.subscribe(&peer, service, characteristic),
            CentralRequest::WriteCharacteristic {
                peer,
                service,
                characteristic,
                value,
            } => self.write(peer, service, characteristic, value),
        }
    }

    async fn connect(&mut self, peer: PeerHandle) {
        let peripheral = match self.find_device(&peer).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                let _ = self
                    .completion_tx
                    .send(Completion::ConnectFailed(peer, e.to_string()));
                return;
            }
        };
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let completion = match peripheral.connect().await {
                Ok(()) => Completion::Connected(peer),
                Err(e) => Completion::ConnectFailed(peer, e.to_string()),
            };
            let _ = tx.send(completion);
        });
    }

    /// 先查扫描记录，再按地址查适配器缓存的设备
    async fn find_device(
        &mut self,
        peer: &PeerHandle,
    ) -> Result<PlatformPeripheral, BleClientError> {
        if let Some(peripheral) = self.peripherals.get(peer) {
            return Ok(peripheral.clone());
        }

        let wanted = canonical_key(peer.as_str());
        for peripheral in self.adapter.peripherals().await? {
            if canonical_key(&peripheral.address().to_string()) == wanted {
                self.peripherals.insert(peer.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(BleClientError::DeviceNotFound(peer.clone()))
    }

    async fn disconnect(&mut self, peer: &PeerHandle) {
        if let Some(task) = self.notification_tasks.remove(peer) {
            task.abort();
        }
        let Some(peripheral) = self.peripherals.get(peer) else {
            let _ = self.completion_tx.send(Completion::TransportError(
                BleClientError::DeviceNotFound(peer.clone()).to_string(),
            ));
            return;
        };
        // 断开完成由适配器的 DeviceDisconnected 事件通知；失败时不会有该事件
        if let Err(e) = peripheral.disconnect().await {
            warn!("Failed to disconnect from {}: {}", peer, e);
            let _ = self.completion_tx.send(Completion::TransportError(format!(
                "disconnect from {peer} failed: {e}"
            )));
        }
    }

    fn discover_services(&mut self, peer: PeerHandle) {
        let Some(peripheral) = self.peripherals.get(&peer).cloned() else {
            let _ = self.completion_tx.send(Completion::ServicesDiscovered(
                peer.clone(),
                Err(BleClientError::DeviceNotFound(peer).to_string()),
            ));
            return;
        };

        // 先开始转发通知，避免订阅后丢失第一条
        let tx = self.completion_tx.clone();
        let notify_peer = peer.clone();
        let notify_peripheral = peripheral.clone();
        let task = tokio::spawn(async move {
            let mut stream = match notify_peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Notification stream unavailable for {}: {}", notify_peer, e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                let _ = tx.send(Completion::ValueUpdated(
                    notify_peer.clone(),
                    notification.uuid.into(),
                    notification.value,
                ));
            }
            trace!("Notification stream for {} ended", notify_peer);
        });
        if let Some(old) = self.notification_tasks.insert(peer.clone(), task) {
            old.abort();
        }

        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .iter()
                    .map(|service| ServiceUuid::from(service.uuid))
                    .collect()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Completion::ServicesDiscovered(peer, result));
        });
    }

    /// btleplug 在服务发现时已缓存全部特征，这里只做转换
    fn characteristics(
        &self,
        peer: &PeerHandle,
        service: ServiceUuid,
    ) -> Result<Vec<CharacteristicRecord>, BleClientError> {
        let peripheral = self
            .peripherals
            .get(peer)
            .ok_or_else(|| BleClientError::DeviceNotFound(peer.clone()))?;

        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| ServiceUuid::from(s.uuid) == service)
            .flat_map(|s| s.characteristics)
            .map(|c| {
                CharacteristicRecord::new(c.uuid.into(), service, properties_from(c.properties))
            })
            .collect())
    }

    fn find_characteristic(
        &self,
        peer: &PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
    ) -> Result<(PlatformPeripheral, Characteristic), BleClientError> {
        let peripheral = self
            .peripherals
            .get(peer)
            .ok_or_else(|| BleClientError::DeviceNotFound(peer.clone()))?;
        for s in peripheral.services() {
            if ServiceUuid::from(s.uuid) != service {
                continue;
            }
            for c in s.characteristics {
                if CharacteristicUuid::from(c.uuid) == characteristic {
                    return Ok((peripheral.clone(), c));
                }
            }
        }
        Err(BleClientError::CharacteristicNotFound(characteristic.uuid()))
    }

    fn subscribe(
        &self,
        peer: &PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
    ) {
        let tx = self.completion_tx.clone();
        let (peripheral, target) = match self.find_characteristic(peer, service, characteristic) {
            Ok(found) => found,
            Err(e) => {
                let _ = tx.send(Completion::SubscribeFailed(
                    peer.clone(),
                    characteristic,
                    e.to_string(),
                ));
                return;
            }
        };
        let peer = peer.clone();
        tokio::spawn(async move {
            match peripheral.subscribe(&target).await {
                Ok(()) => debug!("Subscribed to {}", target.uuid),
                Err(e) => {
                    let _ = tx.send(Completion::SubscribeFailed(
                        peer,
                        characteristic,
                        e.to_string(),
                    ));
                }
            }
        });
    }

    fn write(
        &self,
        peer: PeerHandle,
        service: ServiceUuid,
        characteristic: CharacteristicUuid,
        value: Vec<u8>,
    ) {
        let tx = self.completion_tx.clone();
        if value.len() > MAX_ATTRIBUTE_LEN {
            let _ = tx.send(Completion::WriteCompleted(
                peer,
                characteristic,
                Err(format!(
                    "value of {} bytes exceeds the {MAX_ATTRIBUTE_LEN}-byte attribute limit",
                    value.len()
                )),
            ));
            return;
        }
        let (peripheral, target) = match self.find_characteristic(&peer, service, characteristic) {
            Ok(found) => found,
            Err(e) => {
                let _ = tx.send(Completion::WriteCompleted(
                    peer,
                    characteristic,
                    Err(e.to_string()),
                ));
                return;
            }
        };
        tokio::spawn(async move {
            debug!("Writing {} bytes to {}", value.len(), characteristic);
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Completion::WriteCompleted(peer, characteristic, result));
        });
    }

    async fn handle_adapter_event(
        &mut self,
        session: &mut CentralSession<mpsc::UnboundedSender<CentralRequest>>,
        event: CentralEvent,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match self.peer_report(&id).await {
                    Ok(report) => session.on_peer_discovered(report),
                    Err(e) => trace!("Ignoring advertisement from {:?}: {}", id, e),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                // 同一设备可能以不同大小写的句柄登记过
                let peers: Vec<PeerHandle> = self
                    .peripherals
                    .iter()
                    .filter(|(_, p)| p.id() == id)
                    .map(|(handle, _)| handle.clone())
                    .collect();
                for peer in peers {
                    if let Some(task) = self.notification_tasks.remove(&peer) {
                        task.abort();
                    }
                    session.on_disconnected(&peer, None);
                }
            }
            _ => {}
        }
    }

    /// 读取设备属性并记录平台句柄
    async fn peer_report(&mut self, id: &PeripheralId) -> Result<DiscoveredPeer, BleClientError> {
        let peripheral = self.adapter.peripheral(id).await?;
        let handle = PeerHandle::new(peripheral.address().to_string());
        let mut report = DiscoveredPeer::new(handle.clone());

        if let Some(props) = peripheral.properties().await? {
            if let Some(name) = props.local_name {
                report = report.with_name(name);
            }
            if let Some(rssi) = props.rssi {
                report = report.with_rssi(rssi);
            }
            report = report.with_services(props.services.into_iter().map(Into::into).collect());
        }

        self.peripherals.insert(handle, peripheral);
        Ok(report)
    }
}

fn properties_from(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};

    fn peer() -> PeerHandle {
        PeerHandle::from("AA:BB:CC:DD:EE:FF")
    }

    fn powered_session() -> CentralSession<Vec<CentralRequest>> {
        let mut session = CentralSession::new(Vec::new(), CentralOptions::default());
        session.on_radio_state_changed(RadioState::PoweredOn);
        session
    }

    fn ready_session() -> CentralSession<Vec<CentralRequest>> {
        let mut session = powered_session();
        session.connect(&peer()).unwrap();
        apply_completion(&mut session, Completion::Connected(peer()));
        apply_completion(
            &mut session,
            Completion::ServicesDiscovered(peer(), Ok(vec![MESSAGE_SERVICE_UUID])),
        );
        apply_completion(
            &mut session,
            Completion::CharacteristicsDiscovered(
                peer(),
                MESSAGE_SERVICE_UUID,
                Ok(vec![CharacteristicRecord::new(
                    MESSAGE_CHAR_UUID,
                    MESSAGE_SERVICE_UUID,
                    CharProperties::MESSAGE,
                )]),
            ),
        );
        assert_eq!(session.state(), CentralState::Ready);
        session
    }

    #[test]
    fn test_scan_failure_resets_session() {
        let mut session = powered_session();
        let mut events = session.subscribe();
        session.start_scan().unwrap();

        apply_completion(
            &mut session,
            Completion::TransportError("scan failed: org.bluez.Error.InProgress".to_string()),
        );
        assert_eq!(session.state(), CentralState::Idle);
        let surfaced = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, SessionEvent::TransportError { .. }));
        assert!(surfaced);
    }

    #[test]
    fn test_disconnect_failure_resets_session() {
        let mut session = ready_session();
        session.disconnect().unwrap();
        assert_eq!(session.state(), CentralState::Disconnecting);

        apply_completion(
            &mut session,
            Completion::TransportError("disconnect failed".to_string()),
        );
        assert_eq!(session.state(), CentralState::Idle);
        assert!(session.connect(&peer()).is_ok());
    }

    #[test]
    fn test_subscribe_failure_surfaces_without_reset() {
        let mut session = ready_session();
        let mut events = session.subscribe();

        apply_completion(
            &mut session,
            Completion::SubscribeFailed(peer(), MESSAGE_CHAR_UUID, "not permitted".to_string()),
        );
        assert_eq!(session.state(), CentralState::Ready);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::TransportError { .. })
        ));
    }

    #[test]
    fn test_properties_from_flags() {
        let props =
            properties_from(CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY);
        assert_eq!(props, CharProperties::MESSAGE);

        // 仅支持无响应写入的特征不能用于带响应写入
        let props =
            properties_from(CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::INDICATE);
        assert!(!props.write);
        assert!(props.notify);
    }
}
