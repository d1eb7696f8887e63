//! 定位业务逻辑层
//!
//! 在 device-link 之上实现位置设置 / 恢复的多策略调度，并以 `LocationService`
//! 对 UI 暴露统一的操作接口。

mod dispatcher;
mod service;
mod session;
mod strategy;
mod types;

#[cfg(test)]
mod test_support;

pub use dispatcher::{AttemptFailure, DispatchError, LocationDispatcher, SessionSummary};
pub use service::LocationService;
pub use session::{has_error_pattern, SettleCheck, SettleEvent, SettleVerdict, SpoofSession};
pub use strategy::{AttemptSource, CommandStrategy, LocationAction};
pub use types::{
    DaemonCheck, DeviceStatus, ResetLocationResponse, SetLocationResponse, StartDaemonResponse,
    StartTunnelResponse, TunnelStatus,
};

pub use device_link::{DeviceIdentity, LinkConfig, LinkContext, TunnelEndpoint};
