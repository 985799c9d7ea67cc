//! 键值存储抽象
//!
//! 所有组件的状态（警告记录、信任记录、封禁记录）都通过 `KeyedStore` 注入，
//! 默认实现是进程内的 `MemoryStore`（DashMap 分片锁，按 key 加锁）。
//! 多实例部署时可以替换为共享存储实现，业务逻辑无需改动。

use dashmap::DashMap;

/// 清理决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    /// 保留（可能已被原地修改）
    Keep,
    /// 删除
    Remove,
}

/// 一次清理的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// 检查过的 key 数
    pub scanned: usize,
    /// 删除的 key 数
    pub removed: usize,
}

/// 键值存储接口（Get / Set / Delete / Sweep）
///
/// `update_or_insert` 与 `sweep_key` 必须在单个 key 的锁内完成读-改-写，
/// 否则并发请求会破坏计数器和信任分。
pub trait KeyedStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// 读取快照
    fn get(&self, key: &str) -> Option<V>;

    /// 写入（覆盖）
    fn set(&self, key: &str, value: V);

    /// 删除，返回旧值
    fn delete(&self, key: &str) -> Option<V>;

    /// 当前所有 key 的快照
    fn keys(&self) -> Vec<String>;

    /// 条目数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在 key 锁内执行读-改-写，不存在时先用 `init` 创建
    fn update_or_insert<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R;

    /// 在 key 锁内修改已存在的条目
    fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R>;

    /// 在 key 锁内修改并决定是否删除，key 不存在时返回 None
    fn sweep_key(&self, key: &str, f: impl FnOnce(&mut V) -> SweepDecision)
        -> Option<SweepDecision>;

    /// 全量清理：先取 key 快照，再逐个加锁处理，不会长时间持有任何锁
    fn sweep(&self, mut f: impl FnMut(&mut V) -> SweepDecision) -> SweepStats {
        let mut stats = SweepStats::default();
        for key in self.keys() {
            match self.sweep_key(&key, &mut f) {
                Some(SweepDecision::Remove) => {
                    stats.scanned += 1;
                    stats.removed += 1;
                }
                Some(SweepDecision::Keep) => stats.scanned += 1,
                None => {}
            }
        }
        stats
    }
}

/// 进程内存储（DashMap）
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: DashMap<String, V>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> KeyedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn update_or_insert<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(init);
        f(entry.value_mut())
    }

    fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.entries.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    fn sweep_key(
        &self,
        key: &str,
        f: impl FnOnce(&mut V) -> SweepDecision,
    ) -> Option<SweepDecision> {
        let mut decision = None;
        let removed = self.entries.remove_if_mut(key, |_, value| {
            let d = f(value);
            decision = Some(d);
            d == SweepDecision::Remove
        });
        if removed.is_some() {
            Some(SweepDecision::Remove)
        } else {
            decision
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_or_insert_is_read_modify_write() {
        let store: MemoryStore<u32> = MemoryStore::new();
        for _ in 0..5 {
            store.update_or_insert("k", || 0, |v| *v += 1);
        }
        assert_eq!(store.get("k"), Some(5));
        assert_eq!(store.update("missing", |v| *v), None);
    }

    #[test]
    fn test_sweep_removes_and_mutates() {
        let store: MemoryStore<u32> = MemoryStore::new();
        store.set("a", 1);
        store.set("b", 10);
        store.set("c", 3);

        let stats = store.sweep(|v| {
            if *v >= 10 {
                SweepDecision::Remove
            } else {
                *v += 1;
                SweepDecision::Keep
            }
        });

        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.removed, 1);
        assert_eq!(store.get("a"), Some(2));
        assert_eq!(store.get("b"), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_counts() {
        use std::sync::Arc;

        let store: Arc<MemoryStore<u64>> = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update_or_insert("counter", || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("counter"), Some(8000));
    }
}
