use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::security::ban::BanStore;
use crate::security::pipeline::{CheckContext, SecurityCheck};
use crate::security::result::SecurityResult;

pub const PRIORITY: u32 = 10;

/// 封禁检查：会话仍在封禁期内则直接拒绝
pub struct BanCheck {
    bans: Arc<BanStore>,
}

impl BanCheck {
    pub fn new(bans: Arc<BanStore>) -> Self {
        Self { bans }
    }
}

#[async_trait]
impl SecurityCheck for BanCheck {
    fn name(&self) -> &'static str {
        "ban_check"
    }

    fn priority(&self) -> u32 {
        PRIORITY
    }

    async fn evaluate(&self, ctx: &CheckContext, _prior: &[SecurityResult]) -> Result<SecurityResult> {
        match self.bans.active_ban(&ctx.session_id, ctx.received_at) {
            Some(record) => Ok(SecurityResult::banned("session_banned")
                .with_metadata("expiresAt", record.expires_at.to_rfc3339())),
            None => Ok(SecurityResult::clean()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ban::BanRecord;
    use crate::security::identity::ClientMeta;
    use crate::security::result::SecurityLevel;
    use std::time::Duration;

    #[tokio::test]
    async fn test_banned_session_rejected_until_expiry() {
        let bans = Arc::new(BanStore::in_memory());
        let ctx = CheckContext::new("s1", "hi", ClientMeta::default());
        bans.ban(BanRecord::new("s1", "troll", Duration::from_secs(60), ctx.received_at));

        let check = BanCheck::new(bans.clone());
        let result = check.evaluate(&ctx, &[]).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.level, SecurityLevel::Banned);

        let later = ctx.clone().at(ctx.received_at + chrono::Duration::seconds(61));
        assert!(check.evaluate(&later, &[]).await.unwrap().allowed);
    }
}
