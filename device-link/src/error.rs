//! 设备链路错误定义

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{tool} not installed. Run: pip3 install pymobiledevice3")]
    ToolNotInstalled { tool: String },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {secs}s: {command}")]
    CommandTimedOut { command: String, secs: u64 },

    #[error("Spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Device query failed: {0}")]
    DeviceQueryFailed(String),

    #[error("Tunnel establish failed: {0}")]
    TunnelEstablishFailed(String),

    #[error("Incorrect password")]
    CredentialRejected,

    #[error("Tunnel daemon did not become ready within {0}s")]
    DaemonStartTimeout(u64),

    #[error("Tunnel daemon exited: {0}")]
    DaemonExited(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LinkError {
    /// 是否属于工具未安装（此类错误不应重试）
    pub fn is_tool_missing(&self) -> bool {
        matches!(self, LinkError::ToolNotInstalled { .. })
    }
}
