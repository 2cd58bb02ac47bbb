//! GATT 定义
//!
//! 消息服务的 UUID 常量、特征属性和服务布局 (`GattProfile`)。
//! UUID 必须与已部署的对端完全一致。

pub mod catalog;

pub use catalog::{Catalog, CatalogEntry, CharacteristicRecord, ServiceRecord};

use crate::ids::{CharacteristicUuid, ServiceUuid};
use serde::{Deserialize, Serialize};

pub const MESSAGE_SERVICE_UUID: ServiceUuid =
    ServiceUuid::from_u128(0x4F84FA41_4170_4CA4_9F86_57A0F0936879);
pub const MESSAGE_CHAR_UUID: CharacteristicUuid =
    CharacteristicUuid::from_u128(0x83930ED9_F3EF_4863_B105_CEC5927990C3);

/// 单个特征属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharProperty {
    Read,
    Write,
    Notify,
}

/// 特征属性集合 {read, write, notify}
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl CharProperties {
    /// 外设暴露的消息特征: read + write + notify
    pub const MESSAGE: Self = Self {
        read: true,
        write: true,
        notify: true,
    };

    pub fn contains(&self, property: CharProperty) -> bool {
        match property {
            CharProperty::Read => self.read,
            CharProperty::Write => self.write,
            CharProperty::Notify => self.notify,
        }
    }
}

/// 一个服务 + 一个消息特征的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    pub service: ServiceUuid,
    pub message: CharacteristicUuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: MESSAGE_SERVICE_UUID,
            message: MESSAGE_CHAR_UUID,
        }
    }
}
