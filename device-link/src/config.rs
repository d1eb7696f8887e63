//! 链路配置
//!
//! 默认值从环境变量读取（GEOGHOST_TOOL / GEOGHOST_TUNNELD_PORT），
//! CLI 参数可以覆盖。

use std::path::PathBuf;
use std::time::Duration;

/// tunneld 默认监听端口
pub const DEFAULT_DAEMON_PORT: u16 = 49151;

/// 外部工具配置
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// 可执行文件名或路径
    pub program: String,
    /// 位于子命令之前的固定参数（如 `python3 -m pymobiledevice3` 中的 `-m pymobiledevice3`）
    pub prefix_args: Vec<String>,
    /// 追加到 PATH 之后的搜索目录
    pub extra_paths: Vec<PathBuf>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: std::env::var("GEOGHOST_TOOL")
                .unwrap_or_else(|_| "pymobiledevice3".to_string()),
            prefix_args: Vec::new(),
            extra_paths: default_extra_paths(),
        }
    }
}

/// 常见的安装位置（Homebrew、pip --user、python.org 安装包）
pub fn default_extra_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        paths.push(home.join(".local/bin"));
        for minor in ["3.11", "3.12", "3.13"] {
            paths.push(home.join(format!("Library/Python/{}/bin", minor)));
        }
    }
    paths
}

/// 提权配置
#[derive(Debug, Clone)]
pub struct ElevationConfig {
    /// 提权程序
    pub program: String,
    /// 启动 daemon 时放在工具路径之前的参数
    pub start_args: Vec<String>,
    /// 提权终止参数，后接 pid；为空时只做普通终止
    pub kill_args: Vec<String>,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            program: "sudo".to_string(),
            start_args: vec!["-S".to_string(), "-p".to_string(), String::new()],
            kill_args: vec!["-n".to_string(), "kill".to_string(), "-TERM".to_string()],
        }
    }
}

/// 各阶段超时
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// 普通命令
    pub command: Duration,
    /// `--tunnel <udid>` 形式的命令（实测更慢）
    pub targeted_command: Duration,
    /// 工具是否安装的探测
    pub capability_probe: Duration,
    /// 每种隧道协议的建立时限
    pub tunnel_variant: Duration,
    /// daemon 启动时限
    pub daemon_start: Duration,
    /// daemon 就绪轮询间隔
    pub daemon_poll: Duration,
    /// 健康检查 / 发现请求
    pub health_probe: Duration,
    /// spoof 会话的稳定观察窗口
    pub settle: Duration,
    /// 发送终止信号后等待退出的时间
    pub terminate_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(15),
            targeted_command: Duration::from_secs(20),
            capability_probe: Duration::from_secs(5),
            tunnel_variant: Duration::from_secs(10),
            daemon_start: Duration::from_secs(15),
            daemon_poll: Duration::from_secs(1),
            health_probe: Duration::from_millis(1500),
            settle: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(3),
        }
    }
}

/// 链路总配置
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub tool: ToolConfig,
    pub elevation: ElevationConfig,
    /// tunneld 状态端点端口（仅监听 127.0.0.1）
    pub daemon_port: u16,
    pub timeouts: Timeouts,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let daemon_port = std::env::var("GEOGHOST_TUNNELD_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_DAEMON_PORT);

        Self {
            tool: ToolConfig::default(),
            elevation: ElevationConfig::default(),
            daemon_port,
            timeouts: Timeouts::default(),
        }
    }
}

impl LinkConfig {
    /// tunneld 状态端点 URL
    pub fn daemon_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.daemon_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_default() {
        let t = Timeouts::default();
        assert_eq!(t.command, Duration::from_secs(15));
        assert_eq!(t.targeted_command, Duration::from_secs(20));
        assert_eq!(t.tunnel_variant, Duration::from_secs(10));
        assert_eq!(t.daemon_start, Duration::from_secs(15));
        assert_eq!(t.settle, Duration::from_secs(3));
    }

    #[test]
    fn test_daemon_url() {
        let config = LinkConfig {
            daemon_port: 50000,
            ..Default::default()
        };
        assert_eq!(config.daemon_url(), "http://127.0.0.1:50000/");
    }

    #[test]
    fn test_extra_paths_include_homebrew() {
        let paths = default_extra_paths();
        assert!(paths.contains(&PathBuf::from("/opt/homebrew/bin")));
        assert!(paths.contains(&PathBuf::from("/usr/local/bin")));
    }
}
