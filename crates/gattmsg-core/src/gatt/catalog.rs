//! GATT Catalog
//!
//! 发现过程中逐步建立的 UUID -> 服务/特征记录映射。
//!
//! - 键为小写规范 UUID 字符串，查找不区分大小写
//! - upsert 幂等：同一 UUID 重复插入会覆盖，不会产生重复条目

use crate::gatt::CharProperties;
use crate::ids::{CharacteristicUuid, ServiceUuid, canonical_key};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// 已发现的服务
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub uuid: ServiceUuid,
    pub characteristics: BTreeSet<CharacteristicUuid>,
}

impl ServiceRecord {
    pub fn new(uuid: ServiceUuid) -> Self {
        Self {
            uuid,
            characteristics: BTreeSet::new(),
        }
    }
}

/// 已发现的特征
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicRecord {
    pub uuid: CharacteristicUuid,
    /// 所属服务
    pub service: ServiceUuid,
    pub properties: CharProperties,
    pub cached_value: Option<Vec<u8>>,
}

impl CharacteristicRecord {
    pub fn new(uuid: CharacteristicUuid, service: ServiceUuid, properties: CharProperties) -> Self {
        Self {
            uuid,
            service,
            properties,
            cached_value: None,
        }
    }
}

/// `Catalog::lookup` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEntry<'a> {
    Service(&'a ServiceRecord),
    Characteristic(&'a CharacteristicRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Catalog {
    services: BTreeMap<String, ServiceRecord>,
    characteristics: BTreeMap<String, CharacteristicRecord>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_service(&mut self, record: ServiceRecord) {
        self.services.insert(record.uuid.canonical(), record);
    }

    pub fn upsert_characteristic(&mut self, record: CharacteristicRecord) {
        self.characteristics.insert(record.uuid.canonical(), record);
    }

    /// 按 UUID 字符串查找（不区分大小写），服务优先
    pub fn lookup(&self, uuid: &str) -> Option<CatalogEntry<'_>> {
        let key = canonical_key(uuid);
        if let Some(service) = self.services.get(&key) {
            return Some(CatalogEntry::Service(service));
        }
        self.characteristics
            .get(&key)
            .map(CatalogEntry::Characteristic)
    }

    pub fn service(&self, uuid: &ServiceUuid) -> Option<&ServiceRecord> {
        self.services.get(&uuid.canonical())
    }

    pub fn characteristic(&self, uuid: &CharacteristicUuid) -> Option<&CharacteristicRecord> {
        self.characteristics.get(&uuid.canonical())
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &CharacteristicRecord> {
        self.characteristics.values()
    }

    /// 更新缓存值；特征未知时返回 false
    pub(crate) fn set_cached_value(&mut self, uuid: &CharacteristicUuid, value: Vec<u8>) -> bool {
        match self.characteristics.get_mut(&uuid.canonical()) {
            Some(record) => {
                record.cached_value = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.characteristics.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.characteristics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len() + self.characteristics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};

    fn message_char(properties: CharProperties) -> CharacteristicRecord {
        CharacteristicRecord::new(MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID, properties)
    }

    #[test]
    fn test_upsert_is_last_write_wins() {
        let mut catalog = Catalog::new();
        catalog.upsert_characteristic(message_char(CharProperties::default()));
        catalog.upsert_characteristic(message_char(CharProperties {
            read: true,
            ..Default::default()
        }));
        let last = message_char(CharProperties::MESSAGE);
        catalog.upsert_characteristic(last.clone());

        assert_eq!(catalog.characteristics().count(), 1);
        assert_eq!(catalog.characteristic(&MESSAGE_CHAR_UUID), Some(&last));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut catalog = Catalog::new();
        catalog.upsert_service(ServiceRecord::new(MESSAGE_SERVICE_UUID));
        catalog.upsert_characteristic(message_char(CharProperties::MESSAGE));

        assert!(matches!(
            catalog.lookup("4F84FA41-4170-4CA4-9F86-57A0F0936879"),
            Some(CatalogEntry::Service(_))
        ));
        assert!(matches!(
            catalog.lookup("83930ed9-f3ef-4863-b105-cec5927990c3"),
            Some(CatalogEntry::Characteristic(_))
        ));
        assert!(catalog.lookup("0000180f-0000-1000-8000-00805f9b34fb").is_none());
    }

    #[test]
    fn test_cached_value_and_clear() {
        let mut catalog = Catalog::new();
        assert!(!catalog.set_cached_value(&MESSAGE_CHAR_UUID, b"x".to_vec()));

        catalog.upsert_characteristic(message_char(CharProperties::MESSAGE));
        assert!(catalog.set_cached_value(&MESSAGE_CHAR_UUID, b"hello".to_vec()));
        assert_eq!(
            catalog
                .characteristic(&MESSAGE_CHAR_UUID)
                .and_then(|c| c.cached_value.as_deref()),
            Some(&b"hello"[..])
        );

        catalog.clear();
        assert!(catalog.is_empty());
        assert_eq!(catalog.len(), 0);
    }
}
