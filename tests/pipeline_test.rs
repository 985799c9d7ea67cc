use async_trait::async_trait;
use leadguard::error::{GuardError, Result};
use leadguard::security::{
    CheckContext, ClientMeta, PatternClassifier, SecurityAction, SecurityCheck, SecurityConfig,
    SecurityLevel, SecurityPipeline, SecurityResult, SecurityService,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 可配置结果的测试检查，记录被调用次数
struct ScriptedCheck {
    name: &'static str,
    priority: u32,
    verdict: fn() -> Result<SecurityResult>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedCheck {
    fn new(name: &'static str, priority: u32, verdict: fn() -> Result<SecurityResult>) -> Self {
        Self {
            name,
            priority,
            verdict,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SecurityCheck for ScriptedCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn evaluate(&self, _ctx: &CheckContext, _prior: &[SecurityResult]) -> Result<SecurityResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.verdict)()
    }
}

fn ctx() -> CheckContext {
    CheckContext::new("s1", "hello", ClientMeta::default())
}

#[tokio::test]
async fn test_first_denial_short_circuits() {
    let pipeline = SecurityPipeline::new();
    let clean = Arc::new(ScriptedCheck::new("clean", 10, || Ok(SecurityResult::clean())));
    let deny = Arc::new(ScriptedCheck::new("deny", 20, || {
        Ok(SecurityResult::blocked(SecurityLevel::Troll, 0.9, "nope"))
    }));
    let later = Arc::new(ScriptedCheck::new("later", 30, || Ok(SecurityResult::clean())));

    pipeline.register(later.clone());
    pipeline.register(deny.clone());
    pipeline.register(clean.clone());
    assert_eq!(pipeline.check_names(), vec!["clean", "deny", "later"]);

    let result = pipeline.execute(&ctx()).await;
    assert!(!result.allowed);
    assert_eq!(result.metadata["blockedBy"], "deny");
    assert_eq!(clean.calls.load(Ordering::SeqCst), 1);
    assert_eq!(deny.calls.load(Ordering::SeqCst), 1);
    assert_eq!(later.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_erroring_check_fails_closed() {
    let pipeline = SecurityPipeline::new();
    pipeline.register(Arc::new(ScriptedCheck::new("broken", 10, || {
        Err(GuardError::check_failure("broken", "backend unavailable"))
    })));

    let result = pipeline.execute(&ctx()).await;
    assert!(!result.allowed);
    assert_eq!(result.level, SecurityLevel::Banned);
    assert_eq!(result.reason.as_deref(), Some("check_failed: broken"));
}

#[tokio::test]
async fn test_warnings_merged_when_all_allow() {
    let pipeline = SecurityPipeline::new();
    pipeline.register(Arc::new(ScriptedCheck::new("a", 10, || {
        Ok(SecurityResult::flagged(SecurityLevel::Suspicious, 0.3, SecurityAction::None))
    })));
    pipeline.register(Arc::new(ScriptedCheck::new("b", 20, || {
        Ok(SecurityResult::flagged(SecurityLevel::Troll, 0.7, SecurityAction::Warning))
    })));
    pipeline.register(Arc::new(ScriptedCheck::new("c", 30, || Ok(SecurityResult::clean()))));

    let result = pipeline.execute(&ctx()).await;
    assert!(result.allowed);
    assert_eq!(result.level, SecurityLevel::Troll);
    assert_eq!(result.action, SecurityAction::Warning);
    assert_eq!(result.metadata["checks"], serde_json::json!(["a", "b", "c"]));
}

#[test]
fn test_custom_check_runs_before_builtins() {
    let service = SecurityService::new(
        SecurityConfig::default(),
        Arc::new(PatternClassifier::with_defaults().unwrap()),
    )
    .unwrap();
    let gate = Arc::new(ScriptedCheck::new("maintenance_gate", 1, || {
        Ok(SecurityResult::blocked(SecurityLevel::Suspicious, 0.5, "maintenance"))
    }));
    service.pipeline().register(gate.clone());
    assert_eq!(service.pipeline().check_names()[0], "maintenance_gate");

    let result = tokio_test::block_on(service.check_security(
        "s1",
        "hello",
        ClientMeta::new(Some("203.0.113.1".parse().unwrap())),
    ));
    assert!(!result.allowed);
    assert_eq!(result.metadata["blockedBy"], "maintenance_gate");
    // 限流检查没有执行，不会留下记录
    assert_eq!(service.stats().tracked_identities, 0);

    assert!(service.pipeline().unregister("maintenance_gate"));
    let result = tokio_test::block_on(service.check_security(
        "s1",
        "hello",
        ClientMeta::new(Some("203.0.113.1".parse().unwrap())),
    ));
    assert!(result.allowed);
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
}
