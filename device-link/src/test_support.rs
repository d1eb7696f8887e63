//! 测试辅助：假工具脚本和假 tunneld 状态端点
//!
//! 供本 crate 和下游 crate 的测试使用（`test-support` feature）。

use crate::config::{LinkConfig, Timeouts, ToolConfig};
use crate::runner::CommandRunner;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// 用 `/bin/sh <script>` 模拟外部工具
pub fn fake_tool(dir: &Path, body: &str) -> ToolConfig {
    let script = dir.join("fake-tool.sh");
    std::fs::write(&script, body).unwrap();
    ToolConfig {
        program: "/bin/sh".to_string(),
        prefix_args: vec![script.to_string_lossy().to_string()],
        extra_paths: Vec::new(),
    }
}

pub fn runner_for(tool: ToolConfig) -> CommandRunner {
    let config = LinkConfig {
        tool,
        timeouts: Timeouts {
            command: Duration::from_secs(5),
            ..Default::default()
        },
        ..Default::default()
    };
    CommandRunner::new(Arc::new(config))
}

/// 在临时端口上返回固定 JSON 的最小 HTTP 服务
pub async fn serve_json(listener: TcpListener, body: String) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let body = body.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
    }
}

pub fn test_http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// 取一个当前空闲的端口
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
