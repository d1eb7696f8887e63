//! 隧道发现
//!
//! 查询 tunneld 的本地状态端点，找出当前设备已经建立好的隧道。
//! 有歧义时宁可返回空也不猜，避免把位置发到别的设备上。

use crate::device::DeviceLocator;
use crate::tunnel::TunnelEndpoint;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ADDRESS_KEYS: &[&str] = &["tunnel-address", "address", "host", "rsd-address"];
const PORT_KEYS: &[&str] = &["tunnel-port", "port", "rsd-port"];
const NAME_KEYS: &[&str] = &["name", "device-name", "deviceName", "DeviceName"];
const IDENTIFIER_KEYS: &[&str] = &["udid", "identifier", "UniqueDeviceID", "serial"];

/// 名称里出现这些词的一般不是手机
const NON_PHONE_KEYWORDS: &[&str] = &[
    "macbook",
    "imac",
    "mac mini",
    "mac-mini",
    "mac studio",
    "mac pro",
    "laptop",
    "desktop",
    "apple tv",
    "appletv",
    "watch",
    "homepod",
    "airpods",
    "accessory",
    "vision pro",
];

/// 名称是否像非手机设备
pub fn looks_like_non_phone(name: &str) -> bool {
    let lower = name.to_lowercase();
    NON_PHONE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// 归一化后的隧道条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCandidate {
    pub key: String,
    pub address: String,
    pub port: u16,
    pub name: Option<String>,
}

impl TunnelCandidate {
    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint::new(self.address.clone(), self.port)
    }
}

fn string_field(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| entry.get(*k))
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

fn port_field(entry: &Map<String, Value>) -> Option<u16> {
    PORT_KEYS
        .iter()
        .filter_map(|k| entry.get(*k))
        .find_map(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        })
}

fn candidate_from(key: Option<&str>, entry: &Value) -> Option<TunnelCandidate> {
    let entry = entry.as_object()?;
    let address = string_field(entry, ADDRESS_KEYS)?;
    let port = port_field(entry)?;
    let key = string_field(entry, IDENTIFIER_KEYS)
        .or_else(|| key.map(str::to_string))
        .unwrap_or_default();
    Some(TunnelCandidate {
        key,
        address,
        port,
        name: string_field(entry, NAME_KEYS),
    })
}

/// 把两种响应形状（数组 / 以 UDID 为 key 的对象）统一成列表
pub fn normalize_tunnels(body: &Value) -> Vec<TunnelCandidate> {
    match body {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|e| candidate_from(None, e))
            .collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(key, value)| match value {
                Value::Array(entries) => entries
                    .iter()
                    .filter_map(|e| candidate_from(Some(key.as_str()), e))
                    .collect::<Vec<_>>(),
                other => candidate_from(Some(key.as_str()), other).into_iter().collect(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// 匹配策略：先精确匹配 UDID，再用名称启发式；剩下的不是恰好一个时不选
pub fn select_candidate<'a>(
    candidates: &'a [TunnelCandidate],
    identifier: Option<&str>,
) -> Option<&'a TunnelCandidate> {
    if let Some(id) = identifier {
        if let Some(exact) = candidates.iter().find(|c| c.key.eq_ignore_ascii_case(id)) {
            return Some(exact);
        }
    }

    let remaining: Vec<&TunnelCandidate> = candidates
        .iter()
        .filter(|c| !c.name.as_deref().map(looks_like_non_phone).unwrap_or(false))
        .collect();

    match remaining.as_slice() {
        [only] => Some(*only),
        _ => {
            debug!(
                "[TunnelDiscovery] {} candidates remain, refusing to guess",
                remaining.len()
            );
            None
        }
    }
}

/// 隧道发现
pub struct TunnelDiscovery {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    devices: Arc<DeviceLocator>,
}

impl TunnelDiscovery {
    pub fn new(
        http: reqwest::Client,
        url: String,
        timeout: Duration,
        devices: Arc<DeviceLocator>,
    ) -> Self {
        Self {
            http,
            url,
            timeout,
            devices,
        }
    }

    /// 查找当前设备的已建立隧道；任何失败都视为没有
    pub async fn discover(&self) -> Option<TunnelEndpoint> {
        let identifier = self.devices.cached_identifier().await;

        let body = match self.fetch().await {
            Ok(body) => body,
            Err(e) => {
                debug!("[TunnelDiscovery] Status query failed: {}", e);
                return None;
            }
        };

        let candidates = normalize_tunnels(&body);
        debug!(
            "[TunnelDiscovery] {} tunnel(s) reported, cached identifier {:?}",
            candidates.len(),
            identifier
        );
        let chosen = select_candidate(&candidates, identifier.as_deref())?;
        debug!(
            "[TunnelDiscovery] Selected {} ({:?}) at {}:{}",
            chosen.key, chosen.name, chosen.address, chosen.port
        );
        Some(chosen.endpoint())
    }

    async fn fetch(&self) -> Result<Value, reqwest::Error> {
        self.http
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_tool, free_port, runner_for, serve_json, test_http};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn candidate(key: &str, address: &str, port: u16, name: Option<&str>) -> TunnelCandidate {
        TunnelCandidate {
            key: key.to_string(),
            address: address.to_string(),
            port,
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_non_phone_classifier() {
        assert!(looks_like_non_phone("Jane's MacBook Pro"));
        assert!(looks_like_non_phone("Living Room Apple TV"));
        assert!(looks_like_non_phone("Apple Watch Ultra"));
        assert!(!looks_like_non_phone("iPhone 15 Pro"));
        assert!(!looks_like_non_phone("iPad Air"));
    }

    #[test]
    fn test_normalize_keyed_object() {
        let body = json!({
            "00008110-001A": [
                {"tunnel-address": "fd00::1", "tunnel-port": 50001, "interface": "utun4"}
            ],
            "00008120-002B": {"address": "fd00::2", "port": "50002", "name": "MacBook Air"}
        });
        let mut list = normalize_tunnels(&body);
        list.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            list,
            vec![
                candidate("00008110-001A", "fd00::1", 50001, None),
                candidate("00008120-002B", "fd00::2", 50002, Some("MacBook Air")),
            ]
        );
    }

    #[test]
    fn test_normalize_array_skips_incomplete_entries() {
        let body = json!([
            {"udid": "AAA", "host": "fd00::3", "rsd-port": 50003, "deviceName": "iPhone"},
            {"udid": "BBB", "host": "fd00::4"},
            "garbage"
        ]);
        assert_eq!(
            normalize_tunnels(&body),
            vec![candidate("AAA", "fd00::3", 50003, Some("iPhone"))]
        );
        assert!(normalize_tunnels(&json!("nope")).is_empty());
    }

    #[test]
    fn test_select_exact_identifier() {
        let list = vec![
            candidate("AAA", "fd00::1", 1, Some("iPhone A")),
            candidate("BBB", "fd00::2", 2, Some("iPhone B")),
        ];
        assert_eq!(select_candidate(&list, Some("bbb")), Some(&list[1]));
    }

    #[test]
    fn test_select_two_candidates_without_identifier() {
        let list = vec![
            candidate("AAA", "fd00::1", 1, Some("iPhone A")),
            candidate("BBB", "fd00::2", 2, Some("iPhone B")),
        ];
        assert_eq!(select_candidate(&list, None), None);
    }

    #[test]
    fn test_select_heuristic_filters_non_phones() {
        let list = vec![
            candidate("MAC", "fd00::1", 1, Some("Studio MacBook")),
            candidate("PHONE", "fd00::2", 2, Some("iPhone")),
        ];
        assert_eq!(select_candidate(&list, None), Some(&list[1]));
        // 缓存的 UDID 不匹配时同样走启发式
        assert_eq!(select_candidate(&list, Some("OTHER")), Some(&list[1]));
    }

    #[test]
    fn test_select_multiple_tunnels_is_ambiguous() {
        let list = vec![
            candidate("AAA", "fd00::1", 1, None),
            candidate("AAA", "fd00::5", 5, None),
        ];
        assert_eq!(select_candidate(&list, None), None);
    }

    #[test]
    fn test_select_never_picks_other_device_tunnels() {
        // 缓存的是 AAA，剩下的两条都属于 BBB
        let list = vec![
            candidate("BBB", "fd00::1", 1, Some("iPhone B")),
            candidate("BBB", "fd00::2", 2, Some("iPhone B")),
        ];
        assert_eq!(select_candidate(&list, Some("AAA")), None);
        assert_eq!(
            select_candidate(&list, Some("BBB")),
            Some(&list[0])
        );
    }

    #[test]
    fn test_select_nothing_left() {
        let list = vec![candidate("MAC", "fd00::1", 1, Some("MacBook Pro"))];
        assert_eq!(select_candidate(&list, None), None);
        assert_eq!(select_candidate(&[], None), None);
    }

    fn discovery(dir: &std::path::Path, port: u16) -> TunnelDiscovery {
        let devices = Arc::new(DeviceLocator::new(runner_for(fake_tool(
            dir,
            r#"echo '[{"UniqueDeviceID":"AAA","DeviceName":"iPhone"}]'"#,
        ))));
        TunnelDiscovery::new(
            test_http(),
            format!("http://127.0.0.1:{}/", port),
            Duration::from_millis(500),
            devices,
        )
    }

    #[tokio::test]
    async fn test_discover_with_cached_identifier() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = json!({
            "AAA": [{"tunnel-address": "fd00::a", "tunnel-port": 51000}],
            "BBB": [{"tunnel-address": "fd00::b", "tunnel-port": 52000}]
        });
        tokio::spawn(serve_json(listener, body.to_string()));

        let disco = discovery(dir.path(), port);
        // 未查询设备前没有 UDID，两个候选 → 不猜
        assert_eq!(disco.discover().await, None);

        disco.devices.list_devices().await.unwrap();
        assert_eq!(
            disco.discover().await,
            Some(TunnelEndpoint::new("fd00::a", 51000))
        );
    }

    #[tokio::test]
    async fn test_discover_without_daemon() {
        let dir = TempDir::new().unwrap();
        let disco = discovery(dir.path(), free_port().await);
        assert_eq!(disco.discover().await, None);
    }

    #[tokio::test]
    async fn test_discover_unparseable_body() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_json(listener, "not json".to_string()));

        let disco = discovery(dir.path(), port);
        assert_eq!(disco.discover().await, None);
    }
}
