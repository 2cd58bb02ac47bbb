//! 外设端会话
//!
//! 管理服务发布和广播的生命周期，把入站 ATT 请求交给 `RequestResponder`，
//! 并把写入的消息解码后广播给订阅者。

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::codec::MessageCodec;
use crate::error::SessionError;
use crate::events::{EventBus, RadioState, SessionEvent};
use crate::gatt::GattProfile;
use crate::ids::PeerHandle;
use crate::link::PeripheralLink;
use crate::peripheral::responder::{PendingRequest, RequestResponder, ResponderOutcome};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PeripheralState {
    #[default]
    Idle,
    /// 已请求广播，等待平台确认
    Starting,
    Advertising,
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 外设端选项
#[derive(Debug, Clone)]
pub struct PeripheralOptions {
    pub profile: GattProfile,
    /// 广播中的设备名称
    pub local_name: String,
    /// 消息特征的初始值
    pub initial_value: Vec<u8>,
}

impl Default for PeripheralOptions {
    fn default() -> Self {
        Self {
            profile: GattProfile::default(),
            local_name: "gattmsg".to_string(),
            initial_value: Vec::new(),
        }
    }
}

pub struct PeripheralSession<L: PeripheralLink> {
    link: L,
    options: PeripheralOptions,
    state: PeripheralState,
    radio: RadioState,
    service_published: bool,
    responder: RequestResponder,
    subscribers: BTreeSet<PeerHandle>,
    bus: EventBus,
}

impl<L: PeripheralLink> PeripheralSession<L> {
    pub fn new(link: L, options: PeripheralOptions) -> Self {
        let responder =
            RequestResponder::new(options.profile.message, options.initial_value.clone());
        Self {
            link,
            options,
            state: PeripheralState::Idle,
            radio: RadioState::Unknown,
            service_published: false,
            responder,
            subscribers: BTreeSet::new(),
            bus: EventBus::new(),
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    pub fn current_value(&self) -> &[u8] {
        self.responder.value()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
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

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ------------------------------------------------------------------
    // 用户操作
    // ------------------------------------------------------------------

    /// 发布服务（仅首次）并开始广播
    pub fn start_advertising(&mut self) -> Result<(), SessionError> {
        if !self.radio.is_powered_on() {
            warn!("Cannot advertise, radio state is {:?}", self.radio);
            return Err(SessionError::RadioNotReady);
        }
        if self.state != PeripheralState::Idle {
            return Err(SessionError::AlreadyAdvertising);
        }

        if !self.service_published {
            debug!("Publishing service {}", self.options.profile.service);
            self.link.request_publish_service(self.options.profile);
            self.service_published = true;
        }
        self.link.request_start_advertising(
            vec![self.options.profile.service],
            &self.options.local_name,
        );
        self.set_state(PeripheralState::Starting);
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), SessionError> {
        if self.state == PeripheralState::Idle {
            return Err(SessionError::InvalidState {
                operation: "stop_advertising",
                state: self.state.to_string(),
            });
        }
        self.link.request_stop_advertising();
        self.set_state(PeripheralState::Idle);
        Ok(())
    }

    /// 更新消息特征的值，并通知已订阅的中心设备
    pub fn publish(&mut self, text: &str) -> Result<(), SessionError> {
        let payload = MessageCodec::encode(text)?;
        self.responder.set_value(payload.clone());
        if self.subscribers.is_empty() {
            debug!("Value updated, no subscribers to notify");
        } else {
            debug!(
                "Notifying {} subscriber(s) ({} bytes)",
                self.subscribers.len(),
                payload.len()
            );
            self.link
                .request_notify_value(self.options.profile.message, payload);
        }
        Ok(())
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

        if !state.is_powered_on() {
            // 断电后平台会丢弃已注册的服务
            self.service_published = false;
            self.subscribers.clear();
            if self.state != PeripheralState::Idle {
                self.bus.emit(SessionEvent::TransportError {
                    message: format!("radio is {state:?}"),
                });
                self.set_state(PeripheralState::Idle);
            }
        }
    }

    pub fn on_service_published(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => info!("Service {} published", self.options.profile.service),
            Err(e) => {
                error!("Failed to publish service: {}", e);
                self.service_published = false;
                self.bus.emit(SessionEvent::TransportError {
                    message: format!("publish service failed: {e}"),
                });
            }
        }
    }

    pub fn on_advertising_started(&mut self, result: Result<(), String>) {
        if self.state != PeripheralState::Starting {
            debug!("Ignoring advertising result in state {}", self.state);
            return;
        }
        match result {
            Ok(()) => {
                info!("Advertising as '{}'", self.options.local_name);
                self.set_state(PeripheralState::Advertising);
            }
            Err(e) => {
                error!("Failed to start advertising: {}", e);
                self.bus.emit(SessionEvent::TransportError {
                    message: format!("advertising failed: {e}"),
                });
                self.set_state(PeripheralState::Idle);
            }
        }
    }

    pub fn on_read_request(&mut self, request: &PendingRequest) -> ResponderOutcome {
        self.responder.handle_read(request, &mut self.link)
    }

    pub fn on_write_request_batch(&mut self, requests: &[PendingRequest]) -> ResponderOutcome {
        let outcome = self.responder.handle_write_batch(requests, &mut self.link);
        if let ResponderOutcome::Accepted {
            central, payload, ..
        } = &outcome
        {
            match MessageCodec::decode(payload) {
                Some(text) => {
                    info!("Message received ({} bytes)", payload.len());
                    self.bus.emit(SessionEvent::MessageReceived {
                        from: central.clone(),
                        text,
                    });
                }
                None => debug!("Inbound write was not valid text, not dispatched"),
            }
        }
        outcome
    }

    pub fn on_central_subscribed(&mut self, central: PeerHandle) {
        info!("Central {} subscribed", central);
        if self.subscribers.insert(central) {
            self.emit_subscribers();
        }
    }

    pub fn on_central_unsubscribed(&mut self, central: &PeerHandle) {
        info!("Central {} unsubscribed", central);
        if self.subscribers.remove(central) {
            self.emit_subscribers();
        }
    }

    fn emit_subscribers(&self) {
        self.bus.emit(SessionEvent::SubscribersChanged {
            count: self.subscribers.len(),
        });
    }

    fn set_state(&mut self, next: PeripheralState) {
        if self.state == next {
            return;
        }
        debug!("Peripheral state: {} -> {}", self.state, next);
        self.state = next;
        self.bus
            .emit(SessionEvent::AdvertisingStateChanged { state: next });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttStatus;
    use crate::gatt::{MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};
    use crate::ids::RequestId;
    use crate::link::PeripheralRequest;

    fn powered_session() -> PeripheralSession<Vec<PeripheralRequest>> {
        let mut session = PeripheralSession::new(Vec::new(), PeripheralOptions::default());
        session.on_radio_state_changed(RadioState::PoweredOn);
        session
    }

    #[test]
    fn test_advertise_requires_radio() {
        let mut session = PeripheralSession::new(Vec::new(), PeripheralOptions::default());
        assert_eq!(session.start_advertising(), Err(SessionError::RadioNotReady));
        assert!(session.link().is_empty());
    }

    #[test]
    fn test_publish_service_once() {
        let mut session = powered_session();
        session.start_advertising().unwrap();
        session.on_service_published(Ok(()));
        session.on_advertising_started(Ok(()));
        assert_eq!(session.state(), PeripheralState::Advertising);
        assert_eq!(
            session.start_advertising(),
            Err(SessionError::AlreadyAdvertising)
        );

        session.stop_advertising().unwrap();
        session.start_advertising().unwrap();

        let publishes = session
            .link()
            .iter()
            .filter(|r| matches!(r, PeripheralRequest::PublishService(_)))
            .count();
        assert_eq!(publishes, 1);
        assert_eq!(
            session.link()[1],
            PeripheralRequest::StartAdvertising {
                services: vec![MESSAGE_SERVICE_UUID],
                local_name: "gattmsg".to_string()
            }
        );
    }

    #[test]
    fn test_advertising_failure_returns_idle() {
        let mut session = powered_session();
        session.start_advertising().unwrap();
        session.on_advertising_started(Err("busy".to_string()));
        assert_eq!(session.state(), PeripheralState::Idle);
    }

    #[test]
    fn test_publish_notifies_subscribers() {
        let mut session = powered_session();
        session.publish("quiet").unwrap();
        assert!(session.link().is_empty());
        assert_eq!(session.current_value(), b"quiet");

        session.on_central_subscribed(PeerHandle::from("central-1"));
        session.publish("loud").unwrap();
        assert_eq!(
            session.link(),
            &vec![PeripheralRequest::NotifyValue {
                characteristic: MESSAGE_CHAR_UUID,
                value: b"loud".to_vec()
            }]
        );
    }

    #[test]
    fn test_write_then_read() {
        let mut session = powered_session();
        session.on_write_request_batch(&[PendingRequest::write(
            RequestId(1),
            MESSAGE_CHAR_UUID,
            0,
            b"written".to_vec(),
        )]);
        session.on_read_request(&PendingRequest::read(RequestId(2), MESSAGE_CHAR_UUID, 0));

        assert_eq!(
            session.link().last(),
            Some(&PeripheralRequest::Respond {
                request: RequestId(2),
                status: AttStatus::Success,
                payload: Some(b"written".to_vec())
            })
        );
    }

    #[test]
    fn test_invalid_utf8_write_not_dispatched() {
        let mut session = powered_session();
        let mut events = session.subscribe();
        let outcome = session.on_write_request_batch(&[PendingRequest::write(
            RequestId(1),
            MESSAGE_CHAR_UUID,
            0,
            vec![0xff],
        )]);
        // 写入本身仍然成功
        assert!(matches!(outcome, ResponderOutcome::Accepted { .. }));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_radio_loss_stops_advertising() {
        let mut session = powered_session();
        session.start_advertising().unwrap();
        session.on_advertising_started(Ok(()));
        session.on_central_subscribed(PeerHandle::from("central-1"));

        session.on_radio_state_changed(RadioState::PoweredOff);
        assert_eq!(session.state(), PeripheralState::Idle);
        assert_eq!(session.subscriber_count(), 0);

        // 重新上电后需要重新发布服务
        session.on_radio_state_changed(RadioState::PoweredOn);
        session.link_mut().clear();
        session.start_advertising().unwrap();
        assert!(matches!(
            session.link()[0],
            PeripheralRequest::PublishService(_)
        ));
    }
}
