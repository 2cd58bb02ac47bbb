//! GATT Server - 外设端驱动 (bluer / BlueZ)
//!
//! 发布消息服务并广播。BlueZ 的读写回调不直接应答，而是把请求连同一个
//! oneshot 发送给驱动循环；`PeripheralSession` 决定状态码后，循环中的
//! `Respond` 请求再通过 oneshot 完成回调。未被应答的请求在回调侧返回
//! `ReqError::Failed`。
//!
//! # 功能
//!
//! - 消息特征支持 read + write + notify
//! - 跟踪 notify 会话，按需推送新值
//! - 监听适配器电源状态

use log::{debug, error, info, trace, warn};

use crate::error::{AttStatus, SessionError};
use crate::events::{EventBus, RadioState, SessionEvent};
use crate::gatt::GattProfile;
use crate::ids::{PeerHandle, RequestId};
use crate::link::{PeripheralLink, PeripheralRequest};
use crate::peripheral::{
    PendingRequest, PeripheralOptions, PeripheralSession, PeripheralState, ResponderOutcome,
};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty,
    adv::{Advertisement, AdvertisementHandle},
    gatt::local::{
        Application, ApplicationHandle, Characteristic, CharacteristicNotifier,
        CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead,
        CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
    },
};
use futures_util::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// notify 会话存活检查间隔
const NOTIFIER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type Reply = oneshot::Sender<Result<(), SessionError>>;

/// 驱动任务当前状态的快照
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralSnapshot {
    pub state: PeripheralState,
    pub radio: RadioState,
    pub subscribers: usize,
    pub value: Vec<u8>,
}

enum ServerCommand {
    StartAdvertising(Reply),
    StopAdvertising(Reply),
    Publish(String, Reply),
    Snapshot(oneshot::Sender<PeripheralSnapshot>),
    Shutdown,
}

/// BlueZ 回调发给驱动循环的事件
enum ServerEvent {
    Request(PendingRequest, PendingReply),
    NotifySession(CharacteristicNotifier),
}

enum PendingReply {
    Read(oneshot::Sender<Result<Vec<u8>, ReqError>>),
    Write(oneshot::Sender<Result<(), ReqError>>),
}

/// 等待会话应答的 BlueZ 请求；每个请求最多应答一次
#[derive(Default)]
struct PendingReplies {
    replies: HashMap<RequestId, PendingReply>,
}

impl PendingReplies {
    /// 交给会话处理；被忽略的请求立即丢弃 oneshot，回调侧返回 Failed
    fn dispatch<L: PeripheralLink>(
        &mut self,
        peripheral: &mut PeripheralSession<L>,
        request: &PendingRequest,
        reply: PendingReply,
    ) {
        let outcome = match reply {
            PendingReply::Read(_) => peripheral.on_read_request(request),
            // BlueZ 逐个投递写请求，按单元素批次处理
            PendingReply::Write(_) => {
                peripheral.on_write_request_batch(std::slice::from_ref(request))
            }
        };
        if outcome == ResponderOutcome::Ignored {
            debug!("Request {} ignored, failing it", request.id);
            return;
        }
        self.replies.insert(request.id, reply);
    }

    /// 完成等待中的回调；未知或已应答的请求返回 `false`
    fn respond(
        &mut self,
        request: RequestId,
        status: AttStatus,
        payload: Option<Vec<u8>>,
    ) -> bool {
        let Some(pending) = self.replies.remove(&request) else {
            warn!("Response for unknown request {}", request);
            return false;
        };
        let delivered = match pending {
            PendingReply::Read(reply) => reply
                .send(if status.is_success() {
                    Ok(payload.unwrap_or_default())
                } else {
                    Err(req_error(status))
                })
                .is_ok(),
            PendingReply::Write(reply) => reply
                .send(if status.is_success() {
                    Ok(())
                } else {
                    Err(req_error(status))
                })
                .is_ok(),
        };
        if !delivered {
            debug!("Request {} was cancelled before the response", request);
        }
        true
    }

    fn clear(&mut self) {
        for (id, _) in self.replies.drain() {
            trace!("Dropping pending request {}", id);
        }
    }

    fn len(&self) -> usize {
        self.replies.len()
    }
}

/// GATT Server
pub struct GattServer {
    session: bluer::Session,
    adapter: Adapter,
}

impl GattServer {
    /// 连接 BlueZ 并打开默认适配器
    pub async fn new() -> anyhow::Result<Self> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;

        debug!("Getting default adapter...");
        let adapter = session.default_adapter().await?;
        debug!("Using adapter: {}", adapter.name());

        Ok(Self { session, adapter })
    }

    /// 启动驱动任务
    pub async fn start(self, options: PeripheralOptions) -> anyhow::Result<GattServerHandle> {
        if !self.adapter.is_powered().await? {
            debug!("Powering on adapter: {}", self.adapter.name());
            if let Err(e) = self.adapter.set_powered(true).await {
                warn!("Failed to power on adapter: {}", e);
            }
        }
        let powered = self.adapter.is_powered().await?;
        let adapter_events = self.adapter.events().await?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut peripheral = PeripheralSession::new(request_tx, options);
        peripheral.on_radio_state_changed(radio_state(powered));
        let bus = peripheral.bus().clone();

        let driver = ServerDriver {
            _session: self.session,
            adapter: self.adapter,
            event_tx,
            next_request_id: Arc::new(AtomicU64::new(1)),
            pending: PendingReplies::default(),
            notifiers: Vec::new(),
            next_notify_session: 1,
            app_handle: None,
            adv_handle: None,
        };

        let task = tokio::spawn(run_server(
            peripheral,
            driver,
            command_rx,
            request_rx,
            event_rx,
            Box::pin(adapter_events),
        ));

        Ok(GattServerHandle {
            commands: command_tx,
            bus,
            task,
        })
    }
}

/// 驱动任务的句柄；调用 `shutdown` 后服务和广播随之注销
pub struct GattServerHandle {
    commands: mpsc::Sender<ServerCommand>,
    bus: EventBus,
    task: JoinHandle<()>,
}

impl GattServerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub async fn start_advertising(&self) -> anyhow::Result<()> {
        self.call(ServerCommand::StartAdvertising).await
    }

    pub async fn stop_advertising(&self) -> anyhow::Result<()> {
        self.call(ServerCommand::StopAdvertising).await
    }

    /// 更新消息特征并通知订阅者
    pub async fn publish(&self, text: impl Into<String>) -> anyhow::Result<()> {
        let text = text.into();
        self.call(|reply| ServerCommand::Publish(text, reply)).await
    }

    pub async fn snapshot(&self) -> anyhow::Result<PeripheralSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::Snapshot(tx))
            .await
            .map_err(|_| anyhow::anyhow!("GATT server has stopped"))?;
        Ok(rx.await?)
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(ServerCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("GATT server task ended abnormally: {}", e);
        }
    }

    async fn call(&self, command: impl FnOnce(Reply) -> ServerCommand) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| anyhow::anyhow!("GATT server has stopped"))?;
        rx.await??;
        Ok(())
    }
}

type AdapterEvents = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

async fn run_server(
    mut peripheral: PeripheralSession<mpsc::UnboundedSender<PeripheralRequest>>,
    mut driver: ServerDriver,
    mut commands: mpsc::Receiver<ServerCommand>,
    mut requests: mpsc::UnboundedReceiver<PeripheralRequest>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut adapter_events: AdapterEvents,
) {
    let mut check = tokio::time::interval(NOTIFIER_CHECK_INTERVAL);
    debug!("GATT server driver started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCommand::Shutdown) | None => break,
                Some(command) => handle_command(&mut peripheral, command),
            },
            Some(request) = requests.recv() => {
                driver.execute(&mut peripheral, request).await;
            }
            Some(event) = events.recv() => driver.handle_event(&mut peripheral, event),
            Some(event) = adapter_events.next() => {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    if !powered {
                        driver.release();
                    }
                    peripheral.on_radio_state_changed(radio_state(powered));
                }
            }
            _ = check.tick() => {
                for central in driver.prune_notifiers() {
                    peripheral.on_central_unsubscribed(&central);
                }
            }
        }
    }

    driver.release();
    debug!("GATT server driver stopped");
}

fn handle_command(
    peripheral: &mut PeripheralSession<mpsc::UnboundedSender<PeripheralRequest>>,
    command: ServerCommand,
) {
    match command {
        ServerCommand::StartAdvertising(reply) => {
            let _ = reply.send(peripheral.start_advertising());
        }
        ServerCommand::StopAdvertising(reply) => {
            let _ = reply.send(peripheral.stop_advertising());
        }
        ServerCommand::Publish(text, reply) => {
            let _ = reply.send(peripheral.publish(&text));
        }
        ServerCommand::Snapshot(reply) => {
            let _ = reply.send(PeripheralSnapshot {
                state: peripheral.state(),
                radio: peripheral.radio_state(),
                subscribers: peripheral.subscriber_count(),
                value: peripheral.current_value().to_vec(),
            });
        }
        ServerCommand::Shutdown => {}
    }
}

fn radio_state(powered: bool) -> RadioState {
    if powered {
        RadioState::PoweredOn
    } else {
        RadioState::PoweredOff
    }
}

fn req_error(status: AttStatus) -> ReqError {
    match status {
        AttStatus::InvalidOffset => ReqError::InvalidOffset,
        AttStatus::Success | AttStatus::Failure => ReqError::Failed,
    }
}

struct ServerDriver {
    _session: bluer::Session,
    adapter: Adapter,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    next_request_id: Arc<AtomicU64>,
    pending: PendingReplies,
    notifiers: Vec<(PeerHandle, CharacteristicNotifier)>,
    next_notify_session: u64,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
}

impl ServerDriver {
    async fn execute(
        &mut self,
        peripheral: &mut PeripheralSession<mpsc::UnboundedSender<PeripheralRequest>>,
        request: PeripheralRequest,
    ) {
        match request {
            PeripheralRequest::PublishService(profile) => {
                let app = self.application(profile);
                debug!(
                    "Registering GATT application with service_uuid={}",
                    profile.service
                );
                match self.adapter.serve_gatt_application(app).await {
                    Ok(handle) => {
                        self.app_handle = Some(handle);
                        peripheral.on_service_published(Ok(()));
                    }
                    Err(e) => peripheral.on_service_published(Err(e.to_string())),
                }
            }
            PeripheralRequest::StartAdvertising {
                services,
                local_name,
            } => {
                let adv = Advertisement {
                    advertisement_type: bluer::adv::Type::Peripheral,
                    service_uuids: services.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
                    local_name: Some(local_name.clone()),
                    discoverable: Some(true),
                    ..Default::default()
                };
                debug!("Starting BLE advertisement: local_name={}", local_name);
                match self.adapter.advertise(adv).await {
                    Ok(handle) => {
                        self.adv_handle = Some(handle);
                        peripheral.on_advertising_started(Ok(()));
                    }
                    Err(e) => peripheral.on_advertising_started(Err(e.to_string())),
                }
            }
            PeripheralRequest::StopAdvertising => {
                // 丢弃句柄即注销广播
                if self.adv_handle.take().is_some() {
                    debug!("BLE advertisement stopped");
                }
            }
            PeripheralRequest::Respond {
                request,
                status,
                payload,
            } => {
                self.pending.respond(request, status, payload);
            }
            PeripheralRequest::NotifyValue {
                characteristic,
                value,
            } => {
                trace!(
                    "Notifying {} session(s) on {}",
                    self.notifiers.len(),
                    characteristic
                );
                for (central, notifier) in &mut self.notifiers {
                    if let Err(e) = notifier.notify(value.clone()).await {
                        warn!("Failed to notify {}: {}", central, e);
                    }
                }
            }
        }
    }

    fn handle_event(
        &mut self,
        peripheral: &mut PeripheralSession<mpsc::UnboundedSender<PeripheralRequest>>,
        event: ServerEvent,
    ) {
        match event {
            ServerEvent::Request(request, reply) => {
                self.pending.dispatch(peripheral, &request, reply);
                trace!("{} request(s) awaiting a response", self.pending.len());
            }
            ServerEvent::NotifySession(notifier) => {
                let central =
                    PeerHandle::new(format!("notify-session-{}", self.next_notify_session));
                self.next_notify_session += 1;
                info!("Notification session started ({})", central);
                self.notifiers.push((central.clone(), notifier));
                peripheral.on_central_subscribed(central);
            }
        }
    }

    /// 移除已停止的 notify 会话，返回对应的中心设备
    fn prune_notifiers(&mut self) -> Vec<PeerHandle> {
        let mut stopped = Vec::new();
        self.notifiers.retain(|(central, notifier)| {
            if notifier.is_stopped() {
                stopped.push(central.clone());
                false
            } else {
                true
            }
        });
        stopped
    }

    /// 注销服务和广播；电源关闭后 BlueZ 不再保留它们
    fn release(&mut self) {
        self.adv_handle = None;
        self.app_handle = None;
        self.notifiers.clear();
        self.pending.clear();
    }

    fn application(&self, profile: GattProfile) -> Application {
        let read_tx = self.event_tx.clone();
        let read_ids = self.next_request_id.clone();
        let read_target = profile.message;
        let read = CharacteristicRead {
            read: true,
            fun: Box::new(move |req| {
                let tx = read_tx.clone();
                let id = RequestId(read_ids.fetch_add(1, Ordering::Relaxed));
                let request = PendingRequest::read(id, read_target, usize::from(req.offset))
                    .from_central(PeerHandle::new(req.device_address.to_string()));
                async move {
                    let (reply, rx) = oneshot::channel();
                    let event = ServerEvent::Request(request, PendingReply::Read(reply));
                    if tx.send(event).is_err() {
                        return Err(ReqError::Failed);
                    }
                    rx.await.unwrap_or(Err(ReqError::Failed))
                }
                .boxed()
            }),
            ..Default::default()
        };

        let write_tx = self.event_tx.clone();
        let write_ids = self.next_request_id.clone();
        let write_target = profile.message;
        let write = CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |data, req| {
                let tx = write_tx.clone();
                let id = RequestId(write_ids.fetch_add(1, Ordering::Relaxed));
                let request = PendingRequest::write(id, write_target, usize::from(req.offset), data)
                    .from_central(PeerHandle::new(req.device_address.to_string()));
                async move {
                    let (reply, rx) = oneshot::channel();
                    let event = ServerEvent::Request(request, PendingReply::Write(reply));
                    if tx.send(event).is_err() {
                        return Err(ReqError::Failed);
                    }
                    rx.await.unwrap_or(Err(ReqError::Failed))
                }
                .boxed()
            })),
            ..Default::default()
        };

        let notify_tx = self.event_tx.clone();
        let notify = CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let tx = notify_tx.clone();
                async move {
                    if tx.send(ServerEvent::NotifySession(notifier)).is_err() {
                        error!("GATT server is gone, dropping notification session");
                    }
                }
                .boxed()
            })),
            ..Default::default()
        };

        Application {
            services: vec![Service {
                uuid: profile.service.uuid(),
                primary: true,
                characteristics: vec![Characteristic {
                    uuid: profile.message.uuid(),
                    read: Some(read),
                    write: Some(write),
                    notify: Some(notify),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::MESSAGE_CHAR_UUID;
    use crate::ids::CharacteristicUuid;
    use tokio::sync::oneshot::error::TryRecvError;

    fn peripheral(initial: &[u8]) -> PeripheralSession<Vec<PeripheralRequest>> {
        PeripheralSession::new(
            Vec::new(),
            PeripheralOptions {
                initial_value: initial.to_vec(),
                ..Default::default()
            },
        )
    }

    /// 执行会话排队的应答，返回成功完成的数量
    fn answer(
        pending: &mut PendingReplies,
        peripheral: &mut PeripheralSession<Vec<PeripheralRequest>>,
    ) -> usize {
        let mut answered = 0;
        for request in std::mem::take(peripheral.link_mut()) {
            if let PeripheralRequest::Respond {
                request,
                status,
                payload,
            } = request
            {
                if pending.respond(request, status, payload) {
                    answered += 1;
                }
            }
        }
        answered
    }

    #[test]
    fn test_read_reply_success() {
        let mut session = peripheral(b"hello");
        let mut pending = PendingReplies::default();
        let (tx, mut rx) = oneshot::channel();

        let request = PendingRequest::read(RequestId(1), MESSAGE_CHAR_UUID, 1);
        pending.dispatch(&mut session, &request, PendingReply::Read(tx));
        assert_eq!(pending.len(), 1);
        assert_eq!(answer(&mut pending, &mut session), 1);

        assert!(matches!(rx.try_recv(), Ok(Ok(value)) if value == b"ello"));
        assert_eq!(pending.len(), 0);
        // 同一请求不会被应答第二次
        assert!(!pending.respond(RequestId(1), AttStatus::Success, None));
    }

    #[test]
    fn test_write_reply_success() {
        let mut session = peripheral(b"");
        let mut pending = PendingReplies::default();
        let (tx, mut rx) = oneshot::channel();

        let request = PendingRequest::write(RequestId(2), MESSAGE_CHAR_UUID, 0, b"hi".to_vec());
        pending.dispatch(&mut session, &request, PendingReply::Write(tx));
        assert_eq!(answer(&mut pending, &mut session), 1);

        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert_eq!(session.current_value(), b"hi");
    }

    #[test]
    fn test_invalid_offset_reply() {
        let mut session = peripheral(b"abc");
        let mut pending = PendingReplies::default();
        let (read_tx, mut read_rx) = oneshot::channel();
        let (write_tx, mut write_rx) = oneshot::channel();

        let read = PendingRequest::read(RequestId(3), MESSAGE_CHAR_UUID, 4);
        pending.dispatch(&mut session, &read, PendingReply::Read(read_tx));
        let write = PendingRequest::write(RequestId(4), MESSAGE_CHAR_UUID, 9, b"x".to_vec());
        pending.dispatch(&mut session, &write, PendingReply::Write(write_tx));
        assert_eq!(answer(&mut pending, &mut session), 2);

        assert!(matches!(read_rx.try_recv(), Ok(Err(ReqError::InvalidOffset))));
        assert!(matches!(write_rx.try_recv(), Ok(Err(ReqError::InvalidOffset))));
        assert_eq!(session.current_value(), b"abc");
    }

    #[test]
    fn test_ignored_request_is_dropped() {
        let mut session = peripheral(b"abc");
        let mut pending = PendingReplies::default();
        let (tx, mut rx) = oneshot::channel();
        let other = CharacteristicUuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

        let request = PendingRequest::read(RequestId(5), other, 0);
        pending.dispatch(&mut session, &request, PendingReply::Read(tx));

        // 回调侧收到 Closed，映射为 ReqError::Failed
        assert_eq!(pending.len(), 0);
        assert!(session.link().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn test_unknown_request_id() {
        let mut pending = PendingReplies::default();
        assert!(!pending.respond(RequestId(42), AttStatus::Success, Some(vec![1])));
    }

    #[test]
    fn test_clear_fails_outstanding_requests() {
        let mut session = peripheral(b"abc");
        let mut pending = PendingReplies::default();
        let (tx, mut rx) = oneshot::channel();

        let request = PendingRequest::read(RequestId(6), MESSAGE_CHAR_UUID, 0);
        pending.dispatch(&mut session, &request, PendingReply::Read(tx));
        pending.clear();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert_eq!(answer(&mut pending, &mut session), 0);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            req_error(AttStatus::InvalidOffset),
            ReqError::InvalidOffset
        ));
        assert!(matches!(req_error(AttStatus::Failure), ReqError::Failed));
    }

    #[test]
    fn test_radio_state() {
        assert_eq!(radio_state(true), RadioState::PoweredOn);
        assert_eq!(radio_state(false), RadioState::PoweredOff);
    }
}
