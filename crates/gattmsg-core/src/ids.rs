//! 标识符类型
//!
//! 对端设备、服务、特征和 ATT 请求的不透明标识。UUID 的比较和作为 Catalog
//! 键使用时都以小写规范字符串为准，避免大小写不同导致重复。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 远端 BLE 设备的不透明句柄
///
/// 驱动层使用蓝牙地址字符串构造；核心只比较相等性，不解析内容。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 将任意 UUID 字符串规范化为 Catalog 键
pub fn canonical_key(uuid: &str) -> String {
    uuid.trim().to_ascii_lowercase()
}

macro_rules! gatt_uuid {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub const fn from_u128(value: u128) -> Self {
                Self(Uuid::from_u128(value))
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }

            /// 小写、带连字符的规范形式
            pub fn canonical(&self) -> String {
                self.0.hyphenated().to_string()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }
    };
}

gatt_uuid!(
    /// GATT 服务 UUID
    ServiceUuid
);

gatt_uuid!(
    /// GATT 特征 UUID
    CharacteristicUuid
);

/// 外设侧 ATT 请求 ID，由驱动层分配，每个请求最多应答一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
