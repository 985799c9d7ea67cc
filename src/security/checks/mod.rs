//! 内置安全检查
//!
//! | 检查 | 优先级 | 说明 |
//! |------|--------|------|
//! | `ban_check` | 10 | 会话是否处于封禁期 |
//! | `troll_check` | 20 | 捣乱行为特征（只报告事实，不发警告） |
//! | `content_check` | 30 | 外部分类器给出的内容风险 |
//! | `rate_limit_check` | 40 | 信任分自适应限流 |

pub mod ban_check;
pub mod content_check;
pub mod rate_limit_check;
pub mod troll_check;

pub use ban_check::BanCheck;
pub use content_check::ContentCheck;
pub use rate_limit_check::RateLimitCheck;
pub use troll_check::{TrollCheck, TrollConfig};
