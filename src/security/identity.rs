//! 传输层元数据与身份真实性校验

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 公网入口会设置的转发头（按优先级）
pub const FORWARDING_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

/// 客户端传输元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMeta {
    /// 套接字对端地址
    pub peer_addr: Option<IpAddr>,
    /// 请求头（key 统一小写）
    #[serde(default, deserialize_with = "lowercase_keys")]
    pub headers: HashMap<String, String>,
}

fn lowercase_keys<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect())
}

/// 地址来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    /// 来自转发头
    Forwarded(&'static str),
    /// 来自套接字
    Peer,
}

/// 解析出的客户端地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedAddress {
    /// 原始文本
    pub raw: String,
    /// 解析结果（无法解析为 None）
    pub ip: Option<IpAddr>,
    pub source: AddressSource,
}

/// 身份校验结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityVerdict {
    /// 无可用元数据，跳过校验
    Unknown,
    /// 校验通过
    Genuine,
    /// 疑似伪造
    Spoofed { claimed: String, header: &'static str },
}

impl ClientMeta {
    pub fn new(peer_addr: Option<IpAddr>) -> Self {
        Self {
            peer_addr,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// 按名称读取请求头，忽略大小写
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .or_else(|| {
                // 直接写入 headers 的 key 可能未规范化
                self.headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(|v| v.as_str())
    }

    /// 解析客户端声称的地址：优先转发头（X-Forwarded-For 取第一个），否则对端地址
    pub fn claimed_address(&self) -> Option<ClaimedAddress> {
        for header in FORWARDING_HEADERS {
            if let Some(value) = self.header(header) {
                let first = value.split(',').next().unwrap_or("").trim();
                if first.is_empty() {
                    continue;
                }
                return Some(ClaimedAddress {
                    raw: first.to_string(),
                    ip: first.parse().ok(),
                    source: AddressSource::Forwarded(header),
                });
            }
        }

        self.peer_addr.map(|ip| ClaimedAddress {
            raw: ip.to_string(),
            ip: Some(ip),
            source: AddressSource::Peer,
        })
    }

    /// 用于限流的客户端标识
    pub fn client_identity(&self) -> String {
        self.claimed_address()
            .map(|c| c.raw)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// 身份真实性校验
    ///
    /// 经公网转发头声称自己是私有/保留地址的请求视为伪造；
    /// 转发头中无法解析的地址同样视为伪造。
    pub fn verify(&self) -> IdentityVerdict {
        match self.claimed_address() {
            None => IdentityVerdict::Unknown,
            Some(ClaimedAddress {
                source: AddressSource::Peer,
                ..
            }) => IdentityVerdict::Genuine,
            Some(ClaimedAddress {
                raw,
                ip,
                source: AddressSource::Forwarded(header),
            }) => match ip {
                Some(ip) if !is_private_or_reserved(&ip) => IdentityVerdict::Genuine,
                _ => IdentityVerdict::Spoofed {
                    claimed: raw,
                    header,
                },
            },
        }
    }
}

/// 是否为私有或保留地址段
pub fn is_private_or_reserved(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(&mapped);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || a == 0
        // 100.64.0.0/10 运营商级 NAT
        || (a == 100 && (64..128).contains(&b))
        // 198.18.0.0/15 基准测试
        || (a == 198 && (b == 18 || b == 19))
        || a >= 240
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 唯一本地地址
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 链路本地
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 文档
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}
