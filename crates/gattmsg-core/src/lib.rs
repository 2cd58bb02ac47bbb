//! gattmsg Core Library
//!
//! 基于 BLE GATT 的点对点文本消息：一端作为外设发布消息服务，另一端作为
//! 中心扫描、连接、发现特征并写入消息。
//!
//! # 模块
//!
//! - **central**: 中心端会话状态机和特征发现序列器
//! - **peripheral**: 外设端会话和 ATT 请求应答
//! - **gatt**: 发现结果目录 (Catalog) 和消息服务的 UUID
//! - **codec**: 消息文本编解码
//! - **link**: 会话向平台 BLE 栈发出的请求
//! - **events**: 推送给上层的会话事件
//! - **ble**: btleplug / bluer 平台驱动
//! - **config** / **logging**: 设置持久化和日志级别
//!
//! 会话是同步的，不依赖任何平台 API，可以直接用 `Vec<Request>` 作为
//! 协作者驱动和测试。
//!
//! # 使用示例
//!
//! ## 中心端
//!
//! ```ignore
//! use gattmsg_core::{BleClient, CentralOptions, SessionEvent};
//!
//! let central = BleClient::new().await?.start(CentralOptions::default()).await?;
//! let mut events = central.subscribe();
//! central.start_scan().await?;
//!
//! // 收到 PeerListChanged 后选择设备连接
//! central.connect(peer).await?;
//!
//! // DiscoveryComplete 之后即可发送
//! central.send_text("hello").await?;
//! ```
//!
//! ## 外设端
//!
//! ```ignore
//! use gattmsg_core::{GattServer, PeripheralOptions};
//!
//! let server = GattServer::new().await?.start(PeripheralOptions::default()).await?;
//! server.start_advertising().await?;
//! server.publish("hi there").await?;
//! ```

pub mod ble;
pub mod central;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod gatt;
pub mod ids;
pub mod link;
pub mod logging;
pub mod peripheral;

// BLE driver re-exports
pub use ble::{
    BleClient, BleClientError, CentralHandle, CentralSnapshot, GattServer, GattServerHandle,
    PeripheralSnapshot,
};

// Session re-exports
pub use central::{
    CentralOptions, CentralSession, CentralState, DiscoveredPeer, DiscoverySequencer,
    DiscoveryStep, PeerStatus,
};
pub use peripheral::{
    AttOperation, PendingRequest, PeripheralOptions, PeripheralSession, PeripheralState,
    RequestResponder, ResponderOutcome,
};

pub use codec::MessageCodec;
pub use config::AppSettings;
pub use error::{AttStatus, SessionError};
pub use events::{DiscoveryFailure, EventBus, RadioState, SessionEvent};
pub use gatt::{
    Catalog, CatalogEntry, CharProperties, CharProperty, CharacteristicRecord, GattProfile,
    MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID, ServiceRecord,
};
pub use ids::{CharacteristicUuid, PeerHandle, RequestId, ServiceUuid};
pub use link::{CentralLink, CentralRequest, PeripheralLink, PeripheralRequest};
pub use logging::LogLevel;
