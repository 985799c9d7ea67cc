//! 自描述密文信封
//!
//! v2：`v2:<salt>:<iv>:<tag>:<timestamp>:<ciphertext>`（全部十六进制）
//! 旧格式：`<iv>:<tag>:<ciphertext>`，直接由主密钥加密，仅用于解密历史数据

use std::fmt;

use crate::error::{CryptoFailure, GuardError, Result};

pub const V2_TAG: &str = "v2";
pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// 旧格式兼容 12 字节与 16 字节 IV
pub const LEGACY_IV_LENS: [usize; 2] = [12, 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Envelope {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    /// 加密时间（毫秒时间戳），决定操作密钥所在的时间桶
    pub timestamp_ms: u64,
    pub ciphertext: Vec<u8>,
}

impl V2Envelope {
    /// 关联数据：格式标记 + 时间戳 + 上下文
    pub fn associated_data(timestamp_ms: u64, context: &str) -> Vec<u8> {
        format!("{}|{:x}|{}", V2_TAG, timestamp_ms, context).into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEnvelope {
    pub iv: Vec<u8>,
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    V2(V2Envelope),
    Legacy(LegacyEnvelope),
}

fn malformed() -> GuardError {
    GuardError::Crypto(CryptoFailure::MalformedEnvelope)
}

fn decode(field: &str) -> Result<Vec<u8>> {
    hex::decode(field).map_err(|_| malformed())
}

fn decode_fixed<const N: usize>(field: &str) -> Result<[u8; N]> {
    decode(field)?.try_into().map_err(|_| malformed())
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        match parts.as_slice() {
            [version, salt, iv, tag, timestamp, ciphertext] if *version == V2_TAG => {
                let timestamp_ms = u64::from_str_radix(timestamp, 16).map_err(|_| malformed())?;
                Ok(Envelope::V2(V2Envelope {
                    salt: decode_fixed(salt)?,
                    iv: decode_fixed(iv)?,
                    tag: decode_fixed(tag)?,
                    timestamp_ms,
                    ciphertext: decode(ciphertext)?,
                }))
            }
            [iv, tag, ciphertext] => {
                let iv = decode(iv)?;
                if !LEGACY_IV_LENS.contains(&iv.len()) {
                    return Err(malformed());
                }
                Ok(Envelope::Legacy(LegacyEnvelope {
                    iv,
                    tag: decode_fixed(tag)?,
                    ciphertext: decode(ciphertext)?,
                }))
            }
            _ => Err(malformed()),
        }
    }

    /// 粗略判断字符串是否像信封（不校验内容）
    pub fn looks_like(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Envelope::Legacy(_))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::V2(e) => write!(
                f,
                "{}:{}:{}:{}:{:x}:{}",
                V2_TAG,
                hex::encode(e.salt),
                hex::encode(e.iv),
                hex::encode(e.tag),
                e.timestamp_ms,
                hex::encode(&e.ciphertext)
            ),
            Envelope::Legacy(e) => write!(
                f,
                "{}:{}:{}",
                hex::encode(&e.iv),
                hex::encode(e.tag),
                hex::encode(&e.ciphertext)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_layout() {
        let envelope = Envelope::V2(V2Envelope {
            salt: [1; SALT_LEN],
            iv: [2; IV_LEN],
            tag: [3; TAG_LEN],
            timestamp_ms: 0x18c_0000_0000,
            ciphertext: vec![0xab, 0xcd],
        });
        let text = envelope.to_string();
        let fields: Vec<&str> = text.split(':').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], "v2");
        assert_eq!(fields[1].len(), SALT_LEN * 2);
        assert_eq!(fields[4], "18c00000000");
        assert_eq!(fields[5], "abcd");
        assert_eq!(Envelope::parse(&text).unwrap(), envelope);
    }

    #[test]
    fn test_legacy_iv_lengths() {
        let tag = "00".repeat(TAG_LEN);
        for len in LEGACY_IV_LENS {
            let raw = format!("{}:{}:beef", "11".repeat(len), tag);
            assert!(Envelope::parse(&raw).unwrap().is_legacy());
        }
        let raw = format!("{}:{}:beef", "11".repeat(8), tag);
        assert!(Envelope::parse(&raw).is_err());
    }

    #[test]
    fn test_malformed() {
        for raw in ["", "plain text", "v2:zz:00:00:0:00", "a:b", "v3:1:2:3:4:5"] {
            assert!(
                matches!(
                    Envelope::parse(raw),
                    Err(GuardError::Crypto(CryptoFailure::MalformedEnvelope))
                ),
                "{:?}",
                raw
            );
        }
    }
}
