//! 敏感字段加密
//!
//! - `envelope`: 自描述密文信封（v2 与旧格式）
//! - `key_manager`: 主密钥 / 操作密钥 / 消息密钥派生与轮换
//! - `field_cipher`: 对外的加解密接口

pub mod envelope;
pub mod field_cipher;
pub mod key_manager;

pub use envelope::Envelope;
pub use field_cipher::FieldCipher;
pub use key_manager::{KeyConfig, KeyManager};
