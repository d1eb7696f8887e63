//! 测试辅助：链路上下文

use device_link::test_support::fake_tool;
use device_link::{ElevationConfig, LinkConfig, LinkContext, Timeouts};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) use device_link::test_support::{free_port, serve_json};

/// 以 `/bin/sh <script>` 作为外部工具的链路上下文，稳定窗口缩短到 300ms
pub(crate) fn test_context(dir: &Path, script: &str, daemon_port: u16) -> Arc<LinkContext> {
    let config = LinkConfig {
        tool: fake_tool(dir, script),
        elevation: ElevationConfig {
            program: "/bin/sh".to_string(),
            start_args: Vec::new(),
            kill_args: Vec::new(),
        },
        daemon_port,
        timeouts: Timeouts {
            command: Duration::from_secs(5),
            targeted_command: Duration::from_secs(5),
            tunnel_variant: Duration::from_secs(1),
            health_probe: Duration::from_millis(300),
            settle: Duration::from_millis(300),
            terminate_grace: Duration::from_secs(1),
            ..Default::default()
        },
    };
    Arc::new(LinkContext::new(config).unwrap())
}
