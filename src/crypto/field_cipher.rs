/// 字段级加密
///
/// 对姓名、联系方式、问题描述等短文本做 AES-256-GCM 加密，输出自描述信封。
/// 上下文（如 `lead.name`）参与操作密钥派生与关联数据，跨上下文解密必然失败。
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Nonce, Tag};
use rand::RngCore;
use tracing::debug;

use super::envelope::{Envelope, LegacyEnvelope, V2Envelope, IV_LEN, SALT_LEN, TAG_LEN};
use super::key_manager::{KeyConfig, KeyManager, KEY_LEN};
use crate::error::{CryptoFailure, GuardError, Result};
use crate::infra::metrics;

/// 旧数据使用的 16 字节 IV 变体
type Aes256Gcm16 = AesGcm<Aes256, U16>;

fn crypto_error(stage: CryptoFailure) -> GuardError {
    metrics::record_crypto_failure(match stage {
        CryptoFailure::Encrypt | CryptoFailure::KeyDerivation => "encrypt",
        CryptoFailure::Decrypt | CryptoFailure::MalformedEnvelope => "decrypt",
    });
    GuardError::Crypto(stage)
}

/// 字段加密器
#[derive(Debug)]
pub struct FieldCipher {
    keys: KeyManager,
}

impl FieldCipher {
    pub fn new(secret: &str, config: KeyConfig) -> Result<Self> {
        Ok(Self {
            keys: KeyManager::new(secret, config)?,
        })
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    /// 加密；空字符串原样返回
    pub fn encrypt(&self, plaintext: &str, context: &str) -> Result<String> {
        self.encrypt_at(plaintext, context, chrono::Utc::now().timestamp_millis())
    }

    pub fn encrypt_at(&self, plaintext: &str, context: &str, now_ms: i64) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let timestamp_ms = now_ms.max(0) as u64;
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let operational = self.keys.operational_key(context, timestamp_ms, now_ms);
        let message_key = self.keys.message_key(&operational, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&message_key[..])
            .map_err(|_| crypto_error(CryptoFailure::KeyDerivation))?;

        let aad = V2Envelope::associated_data(timestamp_ms, context);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), &aad, &mut buffer)
            .map_err(|_| crypto_error(CryptoFailure::Encrypt))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);

        Ok(Envelope::V2(V2Envelope {
            salt,
            iv,
            tag: tag_bytes,
            timestamp_ms,
            ciphertext: buffer,
        })
        .to_string())
    }

    /// 解密；空字符串原样返回
    pub fn decrypt(&self, envelope: &str, context: &str) -> Result<String> {
        if envelope.is_empty() {
            return Ok(String::new());
        }

        let envelope = Envelope::parse(envelope).map_err(|e| {
            debug!(context = context, "无法解析的密文信封");
            metrics::record_crypto_failure("decrypt");
            e
        })?;
        let plaintext = match envelope {
            Envelope::V2(e) => self.decrypt_v2(e, context)?,
            Envelope::Legacy(e) => self.decrypt_legacy(e)?,
        };

        String::from_utf8(plaintext).map_err(|_| crypto_error(CryptoFailure::Decrypt))
    }

    /// 把旧格式信封重新加密为 v2；已是 v2 的原样返回
    pub fn upgrade(&self, envelope: &str, context: &str) -> Result<String> {
        if envelope.is_empty() || !Envelope::parse(envelope)?.is_legacy() {
            return Ok(envelope.to_string());
        }
        let plaintext = self.decrypt(envelope, context)?;
        self.encrypt(&plaintext, context)
    }

    /// 轮换操作密钥缓存
    pub fn rotate_keys(&self) -> usize {
        self.keys.rotate()
    }

    fn decrypt_v2(&self, e: V2Envelope, context: &str) -> Result<Vec<u8>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let operational = self.keys.operational_key(context, e.timestamp_ms, now_ms);
        let message_key = self.keys.message_key(&operational, &e.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&message_key[..])
            .map_err(|_| crypto_error(CryptoFailure::KeyDerivation))?;

        let aad = V2Envelope::associated_data(e.timestamp_ms, context);
        let mut buffer = e.ciphertext;
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&e.iv),
                &aad,
                &mut buffer,
                Tag::from_slice(&e.tag),
            )
            .map_err(|_| crypto_error(CryptoFailure::Decrypt))?;
        Ok(buffer)
    }

    /// 旧格式：主密钥直接解密，无关联数据
    fn decrypt_legacy(&self, e: LegacyEnvelope) -> Result<Vec<u8>> {
        let master: &[u8; KEY_LEN] = self.keys.master_key();
        let mut buffer = e.ciphertext;
        let tag = Tag::from_slice(&e.tag);

        let outcome = match e.iv.len() {
            IV_LEN => Aes256Gcm::new_from_slice(master)
                .map_err(|_| crypto_error(CryptoFailure::KeyDerivation))?
                .decrypt_in_place_detached(Nonce::from_slice(&e.iv), b"", &mut buffer, tag),
            16 => Aes256Gcm16::new_from_slice(master)
                .map_err(|_| crypto_error(CryptoFailure::KeyDerivation))?
                .decrypt_in_place_detached(
                    aes_gcm::aead::generic_array::GenericArray::from_slice(&e.iv),
                    b"",
                    &mut buffer,
                    tag,
                ),
            _ => return Err(crypto_error(CryptoFailure::MalformedEnvelope)),
        };
        outcome.map_err(|_| crypto_error(CryptoFailure::Decrypt))?;
        Ok(buffer)
    }

    /// 使用主密钥生成旧格式信封（仅测试用）
    #[cfg(test)]
    pub(crate) fn encrypt_legacy(&self, plaintext: &str, iv_len: usize) -> String {
        let master = self.keys.master_key();
        let mut iv = vec![0u8; iv_len];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = if iv_len == IV_LEN {
            Aes256Gcm::new_from_slice(master)
                .unwrap()
                .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
                .unwrap()
        } else {
            Aes256Gcm16::new_from_slice(master)
                .unwrap()
                .encrypt_in_place_detached(
                    aes_gcm::aead::generic_array::GenericArray::from_slice(&iv),
                    b"",
                    &mut buffer,
                )
                .unwrap()
        };
        format!("{}:{}:{}", hex::encode(&iv), hex::encode(tag), hex::encode(&buffer))
    }
}
