//! 平台 BLE 驱动
//!
//! - **client**: 中心端，基于 btleplug
//! - **server**: 外设端，基于 bluer (BlueZ D-Bus)
//!
//! 两个驱动都只负责把平台 API 翻译成会话的请求和事件，协议逻辑全部在
//! `central` / `peripheral` 会话中。

pub mod client;
pub mod server;

pub use client::{BleClient, BleClientError, CentralHandle, CentralSnapshot};
pub use server::{GattServer, GattServerHandle, PeripheralSnapshot};
