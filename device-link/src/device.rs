//! 设备查询
//!
//! 调用 `usbmux list` 获取已连接设备，归一化字段名，并缓存第一台设备的 UDID。

use crate::error::LinkError;
use crate::runner::CommandRunner;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ID_KEYS: &[&str] = &["UniqueDeviceID", "Identifier", "SerialNumber", "udid"];
const NAME_KEYS: &[&str] = &["DeviceName", "Name", "ProductType"];
const OS_KEYS: &[&str] = &["ProductVersion", "iOSVersion", "OSVersion"];
const CONNECTION_KEYS: &[&str] = &["ConnectionType", "connection_type"];

/// 设备身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// UDID（解析失败时为空）
    pub id: String,
    pub display_name: String,
    pub os_version: String,
    pub connection_kind: String,
}

impl DeviceIdentity {
    /// 输出无法解析时的占位设备
    pub fn unknown() -> Self {
        Self {
            id: String::new(),
            display_name: "iOS Device".to_string(),
            os_version: String::new(),
            connection_kind: "USB".to_string(),
        }
    }

    fn from_json(entry: &Value) -> Self {
        Self {
            id: first_string(entry, ID_KEYS).unwrap_or_default(),
            display_name: first_string(entry, NAME_KEYS)
                .unwrap_or_else(|| "iOS Device".to_string()),
            os_version: first_string(entry, OS_KEYS).unwrap_or_default(),
            connection_kind: first_string(entry, CONNECTION_KEYS)
                .unwrap_or_else(|| "USB".to_string()),
        }
    }
}

fn first_string(entry: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| entry.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// 解析列表输出，数组或单个对象都接受；非 JSON 返回 None
pub fn parse_device_listing(output: &str) -> Option<Vec<DeviceIdentity>> {
    let value: Value = serde_json::from_str(output).ok()?;
    match value {
        Value::Array(entries) => Some(entries.iter().map(DeviceIdentity::from_json).collect()),
        Value::Object(_) => Some(vec![DeviceIdentity::from_json(&value)]),
        _ => None,
    }
}

/// 设备查询器
pub struct DeviceLocator {
    runner: CommandRunner,
    cached_id: RwLock<Option<String>>,
}

impl DeviceLocator {
    pub fn new(runner: CommandRunner) -> Self {
        Self {
            runner,
            cached_id: RwLock::new(None),
        }
    }

    /// 列出已连接设备并刷新 UDID 缓存
    pub async fn list_devices(&self) -> Result<Vec<DeviceIdentity>, LinkError> {
        let devices = self.query().await?;

        // 固定取第一台，不在多设备之间做选择
        let first_id = devices
            .first()
            .map(|d| d.id.clone())
            .filter(|id| !id.is_empty());
        match &first_id {
            Some(id) => debug!("[DeviceLocator] Cached identifier {}", id),
            None => debug!("[DeviceLocator] No usable identifier, cache cleared"),
        }
        *self.cached_id.write().await = first_id;

        Ok(devices)
    }

    /// 缓存的 UDID（不触发查询）
    pub async fn cached_identifier(&self) -> Option<String> {
        self.cached_id.read().await.clone()
    }

    async fn query(&self) -> Result<Vec<DeviceIdentity>, LinkError> {
        let json_args = to_args(&["usbmux", "list", "--no-color", "-o", "json"]);
        let plain_args = to_args(&["usbmux", "list"]);

        if let Ok(output) = self.runner.run(&json_args).await {
            if let Some(devices) = parse_device_listing(&output) {
                return Ok(devices);
            }
        }

        // JSON 输出失败或无法解析，换普通输出
        let output = match self.runner.run(&plain_args).await {
            Ok(output) => output,
            Err(e @ LinkError::ToolNotInstalled { .. }) => return Err(e),
            Err(e) => {
                warn!("[DeviceLocator] Listing failed: {}", e);
                return Err(LinkError::DeviceQueryFailed(e.to_string()));
            }
        };

        if let Some(devices) = parse_device_listing(&output) {
            return Ok(devices);
        }
        if output.is_empty() {
            return Ok(Vec::new());
        }

        info!("[DeviceLocator] Unparseable listing, assuming one device: {}", output);
        Ok(vec![DeviceIdentity::unknown()])
    }
}

fn to_args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
