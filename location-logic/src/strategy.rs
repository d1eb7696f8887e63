//! 位置命令的调用方式

use device_link::TunnelEndpoint;
use std::fmt;

/// 位置操作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationAction {
    Set { lat: f64, lng: f64 },
    Clear,
}

impl LocationAction {
    fn verb(&self) -> &'static str {
        match self {
            LocationAction::Set { .. } => "set",
            LocationAction::Clear => "clear",
        }
    }
}

/// 调用外部工具的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStrategy {
    /// 不带隧道参数（`developer dvt simulate-location`）
    Plain,
    /// 旧版服务（`developer simulate-location`）
    LegacyService,
    /// 指定 RSD 端点
    Rsd(TunnelEndpoint),
    /// 按 UDID 通过 tunneld 定位
    Targeted(String),
}

impl CommandStrategy {
    /// 生成完整参数
    pub fn args(&self, action: LocationAction) -> Vec<String> {
        let mut args: Vec<String> = match self {
            CommandStrategy::LegacyService => vec!["developer".into(), "simulate-location".into()],
            _ => vec![
                "developer".into(),
                "dvt".into(),
                "simulate-location".into(),
            ],
        };
        args.push(action.verb().to_string());

        match self {
            CommandStrategy::Rsd(endpoint) => {
                args.push("--rsd".into());
                args.push(endpoint.host.clone());
                args.push(endpoint.port.to_string());
            }
            CommandStrategy::Targeted(id) => {
                args.push("--tunnel".into());
                args.push(id.clone());
            }
            CommandStrategy::Plain | CommandStrategy::LegacyService => {}
        }

        if let LocationAction::Set { lat, lng } = action {
            // 负数坐标前需要 `--`
            args.push("--".into());
            args.push(lat.to_string());
            args.push(lng.to_string());
        }
        args
    }

    /// 进程在观察窗口内正常退出是否算成功
    ///
    /// 只有不带隧道的调用方式本身就是短命令。
    pub fn clean_exit_is_success(&self) -> bool {
        matches!(self, CommandStrategy::Plain | CommandStrategy::LegacyService)
    }
}

/// 一次尝试的来源，对外作为 `method` 返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptSource {
    CachedTunnel,
    DiscoveredTunnel,
    DeviceTunnel,
    NewTunnel,
    Legacy,
}

impl AttemptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptSource::CachedTunnel => "cached-tunnel",
            AttemptSource::DiscoveredTunnel => "discovered-tunnel",
            AttemptSource::DeviceTunnel => "device-tunnel",
            AttemptSource::NewTunnel => "new-tunnel",
            AttemptSource::Legacy => "legacy",
        }
    }
}

impl fmt::Display for AttemptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(strategy: CommandStrategy, action: LocationAction) -> String {
        strategy.args(action).join(" ")
    }

    #[test]
    fn test_set_argument_shapes() {
        let set = LocationAction::Set {
            lat: 37.7749,
            lng: -122.4194,
        };
        assert_eq!(
            joined(CommandStrategy::Plain, set),
            "developer dvt simulate-location set -- 37.7749 -122.4194"
        );
        assert_eq!(
            joined(CommandStrategy::LegacyService, set),
            "developer simulate-location set -- 37.7749 -122.4194"
        );
        assert_eq!(
            joined(
                CommandStrategy::Rsd(TunnelEndpoint::new("fd00::1", 61234)),
                set
            ),
            "developer dvt simulate-location set --rsd fd00::1 61234 -- 37.7749 -122.4194"
        );
        assert_eq!(
            joined(CommandStrategy::Targeted("00008110-001A".into()), set),
            "developer dvt simulate-location set --tunnel 00008110-001A -- 37.7749 -122.4194"
        );
    }

    #[test]
    fn test_clear_has_no_coordinates() {
        assert_eq!(
            joined(CommandStrategy::Plain, LocationAction::Clear),
            "developer dvt simulate-location clear"
        );
        assert_eq!(
            joined(
                CommandStrategy::Rsd(TunnelEndpoint::new("fd00::1", 1)),
                LocationAction::Clear
            ),
            "developer dvt simulate-location clear --rsd fd00::1 1"
        );
    }

    #[test]
    fn test_clean_exit_only_for_legacy() {
        assert!(CommandStrategy::Plain.clean_exit_is_success());
        assert!(CommandStrategy::LegacyService.clean_exit_is_success());
        assert!(!CommandStrategy::Targeted("x".into()).clean_exit_is_success());
        assert!(!CommandStrategy::Rsd(TunnelEndpoint::new("h", 1)).clean_exit_is_success());
    }
}
