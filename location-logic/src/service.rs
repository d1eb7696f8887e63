//! 定位服务
//!
//! UI 层的全部操作入口。所有操作都不返回 Err，失败折叠进响应的 `error` 字段。

use crate::dispatcher::LocationDispatcher;
use crate::types::{
    DaemonCheck, DeviceStatus, ResetLocationResponse, SetLocationResponse, StartDaemonResponse,
    StartTunnelResponse, TunnelStatus,
};
use anyhow::Result;
use device_link::{DeviceIdentity, LinkConfig, LinkContext};
use std::sync::Arc;
use tracing::{info, warn};

/// 定位服务
pub struct LocationService {
    link: Arc<LinkContext>,
    dispatcher: LocationDispatcher,
}

impl LocationService {
    /// 创建服务
    pub fn new(config: LinkConfig) -> Result<Self> {
        let link = Arc::new(LinkContext::new(config)?);
        Ok(Self::with_context(link))
    }

    /// 使用已有的链路上下文创建服务
    pub fn with_context(link: Arc<LinkContext>) -> Self {
        Self {
            dispatcher: LocationDispatcher::new(Arc::clone(&link)),
            link,
        }
    }

    pub fn link(&self) -> &Arc<LinkContext> {
        &self.link
    }

    // ==================== 设备 ====================

    /// 设备状态（先探测工具是否安装）
    pub async fn get_device_status(&self) -> DeviceStatus {
        let runner = self.link.runner.clone();
        match tokio::task::spawn_blocking(move || runner.probe_installed()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[LocationService] {}", e);
                return DeviceStatus::disconnected(Some(e.to_string()));
            }
            Err(e) => return DeviceStatus::disconnected(Some(e.to_string())),
        }

        match self.link.devices.list_devices().await {
            Ok(devices) => match devices.first() {
                Some(device) => DeviceStatus::connected(device),
                None => DeviceStatus::disconnected(None),
            },
            Err(e) => {
                warn!("[LocationService] Device query failed: {}", e);
                DeviceStatus::disconnected(Some(e.to_string()))
            }
        }
    }

    /// 设备列表；查询失败时返回空列表
    pub async fn list_devices(&self) -> Vec<DeviceIdentity> {
        self.link.devices.list_devices().await.unwrap_or_else(|e| {
            warn!("[LocationService] Device query failed: {}", e);
            Vec::new()
        })
    }

    // ==================== 位置 ====================

    pub async fn set_location(&self, lat: f64, lng: f64) -> SetLocationResponse {
        match self.dispatcher.set_location(lat, lng).await {
            Ok(source) => SetLocationResponse {
                ok: true,
                method: Some(source.to_string()),
                error: None,
            },
            Err(e) => SetLocationResponse {
                ok: false,
                method: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn reset_location(&self) -> ResetLocationResponse {
        match self.dispatcher.reset_location().await {
            Ok(()) => ResetLocationResponse {
                ok: true,
                error: None,
            },
            Err(e) => ResetLocationResponse {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    // ==================== 隧道 ====================

    pub async fn start_tunnel(&self) -> StartTunnelResponse {
        match self.link.tunnels.start().await {
            Ok(endpoint) => StartTunnelResponse::established(endpoint),
            Err(e) => StartTunnelResponse::failed(e.to_string()),
        }
    }

    pub async fn tunnel_status(&self) -> TunnelStatus {
        TunnelStatus::from(self.link.tunnels.current().await)
    }

    // ==================== tunneld ====================

    /// daemon 没在运行时需要用户提供密码
    pub async fn check_daemon(&self) -> DaemonCheck {
        DaemonCheck {
            needs_credential: !self.link.daemon.is_running().await,
        }
    }

    pub async fn start_daemon(&self, secret: &str) -> StartDaemonResponse {
        match self.link.daemon.start_with_credential(secret).await {
            Ok(start) => StartDaemonResponse {
                ok: true,
                already_running: Some(start.already_running),
                error: None,
            },
            Err(e) => StartDaemonResponse {
                ok: false,
                already_running: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// 关闭：结束会话、隧道进程和自己启动的 daemon
    pub async fn shutdown(&self) {
        info!("[LocationService] Shutting down...");
        self.dispatcher.end_session().await;
        self.link.shutdown().await;
        info!("[LocationService] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{free_port, serve_json, test_context};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const LISTING: &str = r#"case "$*" in
  "--help") exit 0;;
  "usbmux list --no-color -o json") echo '[{"UniqueDeviceID":"ABC123","DeviceName":"iPhone","ProductVersion":"17.5"}]';;
  *) echo 'ERROR unexpected' >&2; exit 1;;
esac
"#;

    #[tokio::test]
    async fn test_device_status_connected() {
        let dir = TempDir::new().unwrap();
        let service = LocationService::with_context(test_context(
            dir.path(),
            LISTING,
            free_port().await,
        ));

        let status = service.get_device_status().await;
        assert!(status.connected);
        assert_eq!(status.name, "iPhone");
        assert_eq!(status.os_version, "17.5");
        assert_eq!(status.connection_kind, "USB");
        assert!(status.developer_mode_enabled);
        assert_eq!(
            service.link().devices.cached_identifier().await.as_deref(),
            Some("ABC123")
        );
    }

    #[tokio::test]
    async fn test_device_status_empty_listing() {
        let dir = TempDir::new().unwrap();
        let script = "case \"$*\" in\n  \"--help\") exit 0;;\n  *) echo '[]';;\nesac\n";
        let service = LocationService::with_context(test_context(
            dir.path(),
            script,
            free_port().await,
        ));

        let status = service.get_device_status().await;
        assert!(!status.connected);
        assert_eq!(status.name, "");
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_device_status_tool_missing() {
        let config = LinkConfig {
            tool: device_link::ToolConfig {
                program: "geoghost-definitely-missing-tool".to_string(),
                prefix_args: Vec::new(),
                extra_paths: Vec::new(),
            },
            ..Default::default()
        };
        let service = LocationService::new(config).unwrap();

        let status = service.get_device_status().await;
        assert!(!status.connected);
        assert!(status.error.unwrap().contains("pip3 install pymobiledevice3"));
        assert!(service.list_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_and_reset_responses() {
        let dir = TempDir::new().unwrap();
        let script = r#"case "$*" in
  *start-tunnel*) exit 1;;
  "developer dvt simulate-location set -- 37.7749 -122.4194") exit 0;;
  "developer dvt simulate-location clear") exit 0;;
  *) echo 'ERROR unexpected' >&2; exit 1;;
esac
"#;
        let service = LocationService::with_context(test_context(
            dir.path(),
            script,
            free_port().await,
        ));

        let set = service.set_location(37.7749, -122.4194).await;
        assert_eq!(
            set,
            SetLocationResponse {
                ok: true,
                method: Some("legacy".to_string()),
                error: None,
            }
        );

        let reset = service.reset_location().await;
        assert!(reset.ok);
    }

    #[tokio::test]
    async fn test_set_failure_is_folded() {
        let dir = TempDir::new().unwrap();
        let service = LocationService::with_context(test_context(
            dir.path(),
            "echo 'ERROR no device' >&2\nexit 1\n",
            free_port().await,
        ));

        let set = service.set_location(1.0, 2.0).await;
        assert!(!set.ok);
        assert!(set.method.is_none());
        assert!(set.error.unwrap().contains("legacy"));
    }

    #[tokio::test]
    async fn test_tunnel_start_and_status() {
        let dir = TempDir::new().unwrap();
        let script = r#"case "$*" in
  *start-tunnel*) echo 'RSD Address: fd00::9'; echo 'RSD Port: 9999'; exec sleep 30;;
  *) exit 1;;
esac
"#;
        let service = LocationService::with_context(test_context(
            dir.path(),
            script,
            free_port().await,
        ));

        assert!(!service.tunnel_status().await.active);
        let started = service.start_tunnel().await;
        assert!(started.ok);
        assert_eq!(started.host.as_deref(), Some("fd00::9"));
        assert_eq!(started.port, Some(9999));

        let status = service.tunnel_status().await;
        assert!(status.active);
        assert_eq!(status.port, Some(9999));

        service.shutdown().await;
        assert!(!service.tunnel_status().await.active);
    }

    #[tokio::test]
    async fn test_check_daemon() {
        let dir = TempDir::new().unwrap();
        let service = LocationService::with_context(test_context(
            dir.path(),
            "exit 0\n",
            free_port().await,
        ));
        assert!(service.check_daemon().await.needs_credential);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_json(listener, "{}".to_string()));
        let service = LocationService::with_context(test_context(dir.path(), "exit 0\n", port));
        assert!(!service.check_daemon().await.needs_credential);

        let started = service.start_daemon("unused").await;
        assert_eq!(
            started,
            StartDaemonResponse {
                ok: true,
                already_running: Some(true),
                error: None,
            }
        );
    }
}
