/// 密钥管理
///
/// - 主密钥：启动时由外部高熵密钥经 PBKDF2-HMAC-SHA256 派生一次，不直接用于 v2 数据加密
/// - 操作密钥：SHA-256(主密钥, 上下文, 时间桶)，带使用次数与存活时间上限的缓存
/// - 消息密钥：HKDF-SHA256(操作密钥, 随机盐)，每条消息一把
///
/// 缓存失效只会导致重新派生，任何操作密钥都可以从信封中的时间戳与上下文还原。
use hkdf::Hkdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoFailure, GuardError, Result};
use crate::infra::metrics;

pub const KEY_LEN: usize = 32;
/// PBKDF2 最少迭代次数
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;
/// 主密钥原始材料的最短长度
pub const MIN_SECRET_LEN: usize = 32;

const HKDF_INFO: &[u8] = b"leadguard/field/v2";

pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// 密钥派生与缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// PBKDF2 盐（部署级别固定值）
    pub kdf_salt: String,
    pub pbkdf2_iterations: u32,
    /// 时间桶长度（毫秒）
    pub bucket_ms: u64,
    /// 单把操作密钥的最大使用次数
    pub max_key_uses: u64,
    /// 操作密钥缓存的最长存活时间（毫秒）
    pub max_key_age_ms: u64,
    /// 后台轮换间隔（秒）
    pub rotation_interval_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            kdf_salt: "leadguard-master-key".to_string(),
            pbkdf2_iterations: 100_000,
            bucket_ms: 24 * 60 * 60 * 1000,
            max_key_uses: 10_000,
            max_key_age_ms: 60 * 60 * 1000,
            rotation_interval_secs: 60 * 60,
        }
    }
}

impl KeyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(GuardError::Configuration(format!(
                "encryption.pbkdf2_iterations must be at least {}",
                MIN_PBKDF2_ITERATIONS
            )));
        }
        if self.kdf_salt.is_empty() {
            return Err(GuardError::Configuration(
                "encryption.kdf_salt must not be empty".to_string(),
            ));
        }
        if self.bucket_ms == 0 || self.max_key_uses == 0 || self.max_key_age_ms == 0 {
            return Err(GuardError::Configuration(
                "encryption bucket_ms, max_key_uses and max_key_age_ms must be positive"
                    .to_string(),
            ));
        }
        if self.rotation_interval_secs == 0 {
            return Err(GuardError::Configuration(
                "encryption.rotation_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct CachedKey {
    key: KeyBytes,
    created_at_ms: i64,
    usage_count: u64,
}

/// 密钥管理器
pub struct KeyManager {
    master: KeyBytes,
    config: KeyConfig,
    cache: Mutex<HashMap<(String, u64), CachedKey>>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("config", &self.config)
            .field("cached_keys", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// 从外部密钥派生主密钥
    pub fn new(secret: &str, config: KeyConfig) -> Result<Self> {
        config.validate()?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(GuardError::Configuration(format!(
                "master secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let mut master = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            secret.as_bytes(),
            config.kdf_salt.as_bytes(),
            config.pbkdf2_iterations,
            &mut master[..],
        );
        info!(
            "🔐 主密钥已派生 (PBKDF2 迭代 {} 次)",
            config.pbkdf2_iterations
        );

        Ok(Self {
            master,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// 旧格式数据直接使用主密钥
    pub(crate) fn master_key(&self) -> &[u8; KEY_LEN] {
        &self.master
    }

    pub fn bucket_of(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms / self.config.bucket_ms
    }

    /// 取（必要时派生）操作密钥
    pub fn operational_key(&self, context: &str, timestamp_ms: u64, now_ms: i64) -> KeyBytes {
        let bucket = self.bucket_of(timestamp_ms);
        let mut cache = self.cache.lock();
        let cache_key = (context.to_string(), bucket);

        if let Some(entry) = cache.get_mut(&cache_key) {
            let age = now_ms - entry.created_at_ms;
            if entry.usage_count < self.config.max_key_uses
                && age < self.config.max_key_age_ms as i64
            {
                entry.usage_count += 1;
                return entry.key.clone();
            }
            debug!(
                context = context,
                bucket = bucket,
                uses = entry.usage_count,
                "操作密钥达到使用上限或存活上限，重新派生"
            );
        }

        let key = self.derive_operational(context, bucket);
        // 覆盖旧条目时旧密钥随 Zeroizing 一起清零
        cache.insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                created_at_ms: now_ms,
                usage_count: 1,
            },
        );
        key
    }

    fn derive_operational(&self, context: &str, bucket: u64) -> KeyBytes {
        let mut hasher = Sha256::new();
        hasher.update(&self.master[..]);
        hasher.update([0u8]);
        hasher.update(context.as_bytes());
        hasher.update([0u8]);
        hasher.update(bucket.to_be_bytes());
        let digest = hasher.finalize();

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        key
    }

    /// 每条消息独立的加密密钥
    pub fn message_key(&self, operational: &[u8; KEY_LEN], salt: &[u8]) -> Result<KeyBytes> {
        let hk = Hkdf::<Sha256>::new(Some(salt), operational);
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(HKDF_INFO, &mut okm[..])
            .map_err(|_| GuardError::Crypto(CryptoFailure::KeyDerivation))?;
        Ok(okm)
    }

    /// 轮换：清零并清空操作密钥缓存，返回清除的条目数
    pub fn rotate(&self) -> usize {
        let mut cache = self.cache.lock();
        let evicted = cache.len();
        for entry in cache.values_mut() {
            entry.key.zeroize();
        }
        cache.clear();
        drop(cache);

        metrics::record_key_rotation();
        info!("🔄 操作密钥缓存已轮换，清除 {} 把", evicted);
        evicted
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.lock().len()
    }
}
