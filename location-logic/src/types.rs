//! 对外响应类型
//!
//! 字段名使用 camelCase，与 UI 层约定一致。

use device_link::{DeviceIdentity, TunnelEndpoint};
use serde::Serialize;

/// 设备状态
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    /// 未连接时为空字符串
    pub name: String,
    pub os_version: String,
    pub connection_kind: String,
    pub developer_mode_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceStatus {
    pub fn connected(device: &DeviceIdentity) -> Self {
        Self {
            connected: true,
            name: device.display_name.clone(),
            os_version: device.os_version.clone(),
            connection_kind: device.connection_kind.clone(),
            // 列表里没有这个字段，能列出来就认为已开启
            developer_mode_enabled: true,
            error: None,
        }
    }

    pub fn disconnected(error: Option<String>) -> Self {
        Self {
            connected: false,
            name: String::new(),
            os_version: String::new(),
            connection_kind: String::new(),
            developer_mode_enabled: false,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetLocationResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResetLocationResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartTunnelResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartTunnelResponse {
    pub fn established(endpoint: TunnelEndpoint) -> Self {
        Self {
            ok: true,
            host: Some(endpoint.host),
            port: Some(endpoint.port),
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            ok: false,
            host: None,
            port: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl From<Option<TunnelEndpoint>> for TunnelStatus {
    fn from(endpoint: Option<TunnelEndpoint>) -> Self {
        match endpoint {
            Some(endpoint) => Self {
                active: true,
                host: Some(endpoint.host),
                port: Some(endpoint.port),
            },
            None => Self {
                active: false,
                host: None,
                port: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonCheck {
    pub needs_credential: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartDaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
