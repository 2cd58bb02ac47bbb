//! 会话事件总线
//!
//! 会话通过 `EventBus` 向上层（CLI/UI）广播通知。投递是 fire-and-forget 的：
//! 没有订阅者或订阅者落后时事件直接丢弃，不影响协议状态。

use crate::central::{CentralState, DiscoveredPeer};
use crate::error::SessionError;
use crate::gatt::Catalog;
use crate::ids::{CharacteristicUuid, PeerHandle};
use crate::peripheral::PeripheralState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// 事件通道容量
const EVENT_CAPACITY: usize = 64;

/// 蓝牙适配器电源状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    #[default]
    Unknown,
    PoweredOff,
    PoweredOn,
    Unsupported,
}

impl RadioState {
    pub fn is_powered_on(self) -> bool {
        self == RadioState::PoweredOn
    }
}

/// 发现失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DiscoveryFailure {
    NoServices,
    Transport(String),
}

/// 推送给订阅者的会话事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    RadioStateChanged {
        state: RadioState,
    },
    PeerListChanged {
        peers: Vec<DiscoveredPeer>,
    },
    ConnectionStateChanged {
        state: CentralState,
        peer: Option<PeerHandle>,
    },
    DiscoveryComplete {
        catalog: Catalog,
    },
    DiscoveryFailed {
        reason: DiscoveryFailure,
    },
    MessageReceived {
        from: Option<PeerHandle>,
        text: String,
    },
    WriteCompleted {
        characteristic: CharacteristicUuid,
        result: Result<(), SessionError>,
    },
    TransportError {
        message: String,
    },
    AdvertisingStateChanged {
        state: PeripheralState,
    },
    SubscribersChanged {
        count: usize,
    },
}

/// 会话持有的订阅者列表
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // 没有订阅者时 send 返回 Err，属正常情况
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
