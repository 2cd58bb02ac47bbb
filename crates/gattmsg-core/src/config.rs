//! 应用配置和持久化
//!
//! 设备名称、GATT UUID、扫描参数等设置的存储和读取。

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::gatt::{GattProfile, MESSAGE_CHAR_UUID, MESSAGE_SERVICE_UUID};
use crate::ids::{CharacteristicUuid, ServiceUuid};
use crate::logging::LogLevel;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 设备名称（外设端广播时使用）
    pub device_name: String,
    pub service_uuid: ServiceUuid,
    pub message_uuid: CharacteristicUuid,
    /// 扫描超时（秒）
    pub scan_timeout_secs: u64,
    /// 只扫描广播了消息服务的设备
    pub filter_scan_by_service: bool,
    /// 忽略没有名称的设备
    pub require_peer_name: bool,
    /// 消息特征的初始值
    pub initial_value: String,
    pub log_level: LogLevel,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            service_uuid: MESSAGE_SERVICE_UUID,
            message_uuid: MESSAGE_CHAR_UUID,
            scan_timeout_secs: 10,
            filter_scan_by_service: false,
            require_peer_name: true,
            initial_value: String::new(),
            log_level: LogLevel::Info,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattmsg");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path();
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn profile(&self) -> GattProfile {
        GattProfile {
            service: self.service_uuid,
            message: self.message_uuid,
        }
    }

    /// 扫描过滤；关闭时扫描所有设备
    pub fn scan_filter(&self) -> Option<Vec<ServiceUuid>> {
        self.filter_scan_by_service.then(|| vec![self.service_uuid])
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "gattmsg".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.profile(), GattProfile::default());
        assert_eq!(settings.scan_timeout_secs, 10);
        assert!(settings.require_peer_name);
        // 默认扫描所有设备
        assert_eq!(settings.scan_filter(), None);
    }

    #[test]
    fn test_scan_filter() {
        let settings = AppSettings {
            filter_scan_by_service: true,
            ..Default::default()
        };
        assert_eq!(settings.scan_filter(), Some(vec![MESSAGE_SERVICE_UUID]));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: AppSettings = toml::from_str(
            r#"
            device_name = "desk"
            message_uuid = "00002A19-0000-1000-8000-00805F9B34FB"
            "#,
        )
        .unwrap();
        assert_eq!(settings.device_name, "desk");
        assert_eq!(
            settings.message_uuid.canonical(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(settings.service_uuid, MESSAGE_SERVICE_UUID);
        assert_eq!(settings.log_level, LogLevel::Info);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("gattmsg-test-{}", uuid::Uuid::new_v4()))
            .join("settings.toml");
        let settings = AppSettings {
            device_name: "bench".to_string(),
            scan_timeout_secs: 3,
            log_level: LogLevel::Debug,
            ..Default::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(AppSettings::load_from(&path), settings);

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let path = std::env::temp_dir().join(format!("gattmsg-bad-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "scan_timeout_secs = \"soon\"").unwrap();
        assert_eq!(AppSettings::load_from(&path).scan_timeout_secs, 10);
        let _ = fs::remove_file(&path);
    }
}
