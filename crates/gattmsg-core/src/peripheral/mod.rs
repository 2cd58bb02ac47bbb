//! 外设端 (peripheral) 角色
//!
//! - **responder**: 针对消息特征应答 ATT 读/写请求
//! - **session**: 服务发布、广播和订阅管理

pub mod responder;
pub mod session;

pub use responder::{AttOperation, PendingRequest, RequestResponder, ResponderOutcome};
pub use session::{PeripheralOptions, PeripheralSession, PeripheralState};
