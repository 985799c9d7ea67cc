use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::FieldCipher;
use crate::error::Result;

/// 各字段的加密上下文
pub const CONTEXT_NAME: &str = "lead.name";
pub const CONTEXT_CONTACT: &str = "lead.contact";
pub const CONTEXT_PROBLEM: &str = "lead.problem";

/// 线索（明文，仅在内存中存在）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: Uuid,
    pub session_id: String,
    /// 姓名
    pub name: String,
    /// 联系方式（邮箱 / 电话）
    pub contact: String,
    /// 问题描述
    pub problem_description: String,
    /// 线索评分（由外部评分逻辑给出）
    pub qualification_score: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl LeadRecord {
    pub fn new(session_id: &str, name: &str, contact: &str, problem_description: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            contact: contact.to_string(),
            problem_description: problem_description.to_string(),
            qualification_score: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.qualification_score = Some(score.min(100));
        self
    }

    /// 加密敏感字段，得到可落盘的记录
    pub fn seal(&self, cipher: &FieldCipher) -> Result<SealedLead> {
        Ok(SealedLead {
            id: self.id,
            session_id: self.session_id.clone(),
            name: cipher.encrypt(&self.name, CONTEXT_NAME)?,
            contact: cipher.encrypt(&self.contact, CONTEXT_CONTACT)?,
            problem_description: cipher.encrypt(&self.problem_description, CONTEXT_PROBLEM)?,
            qualification_score: self.qualification_score,
            created_at: self.created_at,
        })
    }
}

/// 线索（敏感字段为密文信封）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedLead {
    pub id: Uuid,
    pub session_id: String,
    pub name: String,
    pub contact: String,
    pub problem_description: String,
    pub qualification_score: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl SealedLead {
    /// 解密敏感字段
    pub fn open(&self, cipher: &FieldCipher) -> Result<LeadRecord> {
        Ok(LeadRecord {
            id: self.id,
            session_id: self.session_id.clone(),
            name: cipher.decrypt(&self.name, CONTEXT_NAME)?,
            contact: cipher.decrypt(&self.contact, CONTEXT_CONTACT)?,
            problem_description: cipher.decrypt(&self.problem_description, CONTEXT_PROBLEM)?,
            qualification_score: self.qualification_score,
            created_at: self.created_at,
        })
    }

    /// 把旧格式字段升级为 v2，返回是否有改动
    pub fn upgrade(&mut self, cipher: &FieldCipher) -> Result<bool> {
        let name = cipher.upgrade(&self.name, CONTEXT_NAME)?;
        let contact = cipher.upgrade(&self.contact, CONTEXT_CONTACT)?;
        let problem = cipher.upgrade(&self.problem_description, CONTEXT_PROBLEM)?;
        let changed =
            name != self.name || contact != self.contact || problem != self.problem_description;
        self.name = name;
        self.contact = contact;
        self.problem_description = problem;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_manager::{KeyConfig, MIN_PBKDF2_ITERATIONS};

    fn cipher() -> FieldCipher {
        let config = KeyConfig {
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            ..KeyConfig::default()
        };
        FieldCipher::new("lead-model-test-secret-0123456789abcdef", config).unwrap()
    }

    #[test]
    fn test_seal_open() {
        let cipher = cipher();
        let lead = LeadRecord::new("s1", "Grace Hopper", "grace@example.com", "")
            .with_score(180);
        assert_eq!(lead.qualification_score, Some(100));

        let sealed = lead.seal(&cipher).unwrap();
        assert!(sealed.name.starts_with("v2:"));
        assert!(!sealed.contact.contains("grace"));
        assert_eq!(sealed.problem_description, "");
        assert_eq!(sealed.open(&cipher).unwrap(), lead);
    }

    #[test]
    fn test_fields_not_interchangeable() {
        let cipher = cipher();
        let mut sealed = LeadRecord::new("s1", "Alan", "alan@example.com", "payroll")
            .seal(&cipher)
            .unwrap();
        std::mem::swap(&mut sealed.name, &mut sealed.contact);
        assert!(sealed.open(&cipher).is_err());
    }

    #[test]
    fn test_upgrade_noop_for_v2() {
        let cipher = cipher();
        let mut sealed = LeadRecord::new("s1", "A", "B", "C").seal(&cipher).unwrap();
        assert!(!sealed.upgrade(&cipher).unwrap());
    }
}
