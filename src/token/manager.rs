use crate::config::Config;
use crate::grok::model::ModelService;
use crate::grok::usage::QuotaUpstream;
use crate::token::store::TokenStorage;
use crate::token::types::{POOL_BASIC, POOL_SUPER, QUOTA_UNLIMITED, TokenPool, TokenRecord, TokenStatus};
use crate::util::id;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
// tokio 时钟在测试里可暂停/推进，陈旧度判断统一用它。
use tokio::time::Instant;

const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);
const STORAGE_LOCK_NAME: &str = "tokens";

/// token 管理器：持有全部配额池，负责预占生命周期、失败/用量记账与周期性
/// 从存储 reload。
///
/// select+预占标记在同一写锁临界区内完成，保证并发预占不会复选同一 token；
/// 锁内只做 O(1) 内存操作，绝不跨网络调用持锁。
pub struct TokenManager {
    cfg: Config,
    storage: Arc<dyn TokenStorage>,
    quota: Arc<dyn QuotaUpstream>,
    inner: RwLock<Inner>,
    save_pending: AtomicBool,
}

struct Inner {
    pools: HashMap<String, TokenPool>,
    last_reload: Option<Instant>,
}

impl TokenManager {
    pub fn new(cfg: Config, storage: Arc<dyn TokenStorage>, quota: Arc<dyn QuotaUpstream>) -> Self {
        let mut pools = HashMap::new();
        for name in [POOL_BASIC, POOL_SUPER] {
            pools.insert(name.to_string(), TokenPool::new(name));
        }
        Self {
            cfg,
            storage,
            quota,
            inner: RwLock::new(Inner {
                pools,
                last_reload: None,
            }),
            save_pending: AtomicBool::new(false),
        }
    }

    /// 从存储重建全部池。存量记录的运行时字段（预占、最近使用时间）对仍然
    /// 存在的 token 保留；存储中消失的 token 随之移除。
    pub async fn reload(&self) -> anyhow::Result<()> {
        let loaded = self.storage.load_tokens().await?;

        let mut inner = self.inner.write().await;
        let mut pools: HashMap<String, TokenPool> = HashMap::new();
        for name in [POOL_BASIC, POOL_SUPER] {
            pools.insert(name.to_string(), TokenPool::new(name));
        }

        for (pool_name, records) in loaded {
            let pool = pools
                .entry(pool_name.clone())
                .or_insert_with(|| TokenPool::new(&pool_name));
            let previous = inner.pools.get(&pool_name);
            for mut record in records {
                if let Some(old) = previous.and_then(|p| {
                    p.list().iter().find(|r| r.token == record.token)
                }) {
                    record.inflight_until = old.inflight_until;
                    record.inflight_reservation_id = old.inflight_reservation_id.clone();
                    record.last_used = record.last_used.max(old.last_used);
                }
                pool.add(record);
            }
        }

        inner.pools = pools;
        inner.last_reload = Some(Instant::now());
        Ok(())
    }

    /// 距上次 reload 未超过 ttl 时跳过，限制高请求速率下对存储的压力。
    /// reload 失败只记日志，继续使用现有池。
    pub async fn reload_if_stale(&self) {
        let ttl = Duration::from_secs(self.cfg.token_reload_ttl_secs);
        {
            let inner = self.inner.read().await;
            if let Some(at) = inner.last_reload
                && at.elapsed() < ttl
            {
                return;
            }
        }
        if let Err(e) = self.reload().await {
            tracing::warn!("token 池 reload 失败，沿用现有数据: {e:#}");
        }
    }

    /// 为模型选择并预占一个 token，返回 (token, reservation_id)。
    /// 无可用记录返回 None。
    pub async fn reserve_token_for_model(
        &self,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Option<(String, String)> {
        let pool_name = ModelService::pool_for(model);
        let now = Utc::now().timestamp();

        let mut inner = self.inner.write().await;
        let pool = inner.pools.get_mut(pool_name)?;
        let record = pool.select_mut(exclude, now)?;

        let reservation_id = id::reservation_id();
        record.inflight_until = now + self.cfg.reservation_ttl_secs;
        record.inflight_reservation_id = Some(reservation_id.clone());
        record.last_used = now;
        Some((record.token.clone(), reservation_id))
    }

    /// 释放预占。仅当记录中保存的 reservation_id 与入参一致时生效，
    /// 重复释放与陈旧 id 均为安全 no-op。
    ///
    /// 同一 token 字符串可能同时挂在多个池（super 账号兼跑 basic 模型），
    /// 必须扫完所有副本，直到命中持有该预占 id 的那一份。
    pub async fn release_token_reservation(&self, token: &str, reservation_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        for pool in inner.pools.values_mut() {
            if let Some(record) = pool.get_mut(token)
                && record.inflight_reservation_id.as_deref() == Some(reservation_id)
            {
                record.inflight_until = 0;
                record.inflight_reservation_id = None;
                return true;
            }
        }
        false
    }

    /// 记录一次上游失败并按状态码分类降级。任何输入都不会报错。
    pub async fn record_fail(self: &Arc<Self>, token: &str, status_code: u16, reason: &str) {
        let now = Utc::now().timestamp();
        {
            let mut inner = self.inner.write().await;
            // 失败归属于凭证本身，作用于该 token 在所有池中的副本。
            for pool in inner.pools.values_mut() {
                let Some(record) = pool.get_mut(token) else {
                    continue;
                };
                record.fail_count += 1;
                match status_code {
                    // 认证失效：终态，等待外部 reload 重新引入。
                    401 | 403 => record.status = TokenStatus::Expired,
                    // 限流：冷却一段时间后可重新被选中。
                    429 => {
                        record.status = TokenStatus::Cooling;
                        record.cooling_until = now + self.cfg.token_cooldown_secs;
                    }
                    // 未知/5xx：保持可用，fail_count 供外部告警参考。
                    _ => {}
                }
            }
        }
        tracing::warn!(
            token = token_brief(token),
            status = status_code,
            "记录 token 失败: {reason}"
        );
        self.schedule_save();
    }

    /// 用量记账。
    ///
    /// 同步快路径：立即扣减本地额度并返回，不等待任何网络 I/O；
    /// 异步慢路径：派生后台任务向上游查询权威剩余额度并覆盖本地估算，
    /// 慢路径失败只记日志，不影响调用方。
    ///
    /// 返回 false 表示 token 不存在。
    pub async fn sync_usage(
        self: &Arc<Self>,
        token: &str,
        model: &str,
        consume_on_fail: bool,
        is_usage: bool,
    ) -> bool {
        // 记账只落在本次请求实际消耗的那个池的副本上，
        // 避免同一 token 挂在多个池时误改其他池的额度。
        let pool_name = ModelService::pool_for(model);
        let is_heavy = pool_name == POOL_SUPER;
        let found = {
            let mut inner = self.inner.write().await;
            let mut found = false;
            if let Some(record) = inner
                .pools
                .get_mut(pool_name)
                .and_then(|pool| pool.get_mut(token))
            {
                found = true;
                if consume_on_fail {
                    let quota = if is_heavy {
                        &mut record.heavy_quota
                    } else {
                        &mut record.quota
                    };
                    if *quota > 0 {
                        *quota -= 1;
                    }
                }
                if is_usage {
                    record.use_count += 1;
                }
            }
            found
        };
        if !found {
            return false;
        }

        self.schedule_save();

        if is_usage {
            // 后台任务独立于请求生命周期：请求被取消也不中断配额校正。
            let mgr = Arc::clone(self);
            let token = token.to_string();
            let rate_limit_model = ModelService::rate_limit_model_for(model).to_string();
            tokio::spawn(async move {
                match mgr.quota.remaining(&token, &rate_limit_model).await {
                    Ok(Some(remaining)) => {
                        mgr.apply_remote_quota(&token, pool_name, remaining).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(token = token_brief(&token), "后台配额同步失败: {e}");
                    }
                }
            });
        }
        true
    }

    async fn apply_remote_quota(self: &Arc<Self>, token: &str, pool_name: &str, remaining: i64) {
        {
            let mut inner = self.inner.write().await;
            if let Some(record) = inner
                .pools
                .get_mut(pool_name)
                .and_then(|pool| pool.get_mut(token))
            {
                let quota = if pool_name == POOL_SUPER {
                    &mut record.heavy_quota
                } else {
                    &mut record.quota
                };
                if *quota != QUOTA_UNLIMITED {
                    *quota = remaining.max(0);
                }
            }
        }
        self.schedule_save();
    }

    /// 所有池的只读快照（统计/管理视图）。
    pub async fn pools_snapshot(&self) -> HashMap<String, Vec<TokenRecord>> {
        let inner = self.inner.read().await;
        inner
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.list().to_vec()))
            .collect()
    }

    /// 去抖的最佳努力落盘：短窗口内的多次变更合并为一次保存。
    fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            mgr.save_pending.store(false, Ordering::SeqCst);
            let snapshot = mgr.pools_snapshot().await;
            let _guard = mgr.storage.acquire_lock(STORAGE_LOCK_NAME).await;
            if let Err(e) = mgr.storage.save_tokens(&snapshot).await {
                tracing::warn!("保存 token 池失败: {e:#}");
            }
        });
    }
}

fn token_brief(token: &str) -> String {
    let head: String = token.chars().take(10).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;
    use tokio::sync::OwnedMutexGuard;

    struct MemoryStorage {
        pools: StdMutex<HashMap<String, Vec<TokenRecord>>>,
        lock: Arc<tokio::sync::Mutex<()>>,
    }

    impl MemoryStorage {
        fn new(pools: HashMap<String, Vec<TokenRecord>>) -> Self {
            Self {
                pools: StdMutex::new(pools),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            }
        }

        fn seeded(tokens: &[(&str, i64)]) -> Self {
            let records = tokens
                .iter()
                .map(|(t, q)| TokenRecord::new(*t).with_quota(*q))
                .collect();
            let mut pools = HashMap::new();
            pools.insert(POOL_BASIC.to_string(), records);
            Self::new(pools)
        }
    }

    #[async_trait]
    impl TokenStorage for MemoryStorage {
        async fn load_tokens(&self) -> anyhow::Result<HashMap<String, Vec<TokenRecord>>> {
            Ok(self.pools.lock().unwrap().clone())
        }

        async fn save_tokens(
            &self,
            pools: &HashMap<String, Vec<TokenRecord>>,
        ) -> anyhow::Result<()> {
            *self.pools.lock().unwrap() = pools.clone();
            Ok(())
        }

        async fn acquire_lock(&self, _name: &str) -> OwnedMutexGuard<()> {
            self.lock.clone().lock_owned().await
        }
    }

    #[derive(Default)]
    struct FakeQuota {
        remaining: Option<i64>,
        gate: Option<Arc<Notify>>,
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl QuotaUpstream for FakeQuota {
        async fn remaining(&self, token: &str, _model: &str) -> Result<Option<i64>, AppError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.calls.lock().unwrap().push(token.to_string());
            Ok(self.remaining)
        }
    }

    fn manager_with(
        storage: MemoryStorage,
        quota: Arc<FakeQuota>,
    ) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(
            Config::default(),
            Arc::new(storage),
            quota,
        ))
    }

    async fn basic_record(mgr: &TokenManager, token: &str) -> TokenRecord {
        mgr.pools_snapshot().await[POOL_BASIC]
            .iter()
            .find(|r| r.token == token)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn reserve_avoids_duplicate_until_release() {
        let mgr = manager_with(
            MemoryStorage::seeded(&[("tok-a", 100), ("tok-b", 80)]),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        let (tok1, rid1) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();
        let (tok2, rid2) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();

        assert_eq!(tok1, "tok-a");
        assert_eq!(tok2, "tok-b");
        assert_ne!(rid1, rid2);

        let rec = basic_record(&mgr, "tok-a").await;
        assert!(rec.inflight_until > 0);
        assert_eq!(rec.inflight_reservation_id.as_deref(), Some(rid1.as_str()));

        // 两个 token 均被预占时无可用记录。
        assert!(
            mgr.reserve_token_for_model("grok-3", &HashSet::new())
                .await
                .is_none()
        );

        assert!(mgr.release_token_reservation("tok-a", &rid1).await);
        let rec = basic_record(&mgr, "tok-a").await;
        assert_eq!(rec.inflight_until, 0);
        assert!(rec.inflight_reservation_id.is_none());

        // 释放后可立即再次选中；重复释放是安全 no-op。
        let (tok3, _) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(tok3, "tok-a");
        assert!(!mgr.release_token_reservation("tok-a", &rid1).await);
    }

    #[tokio::test]
    async fn stale_reservation_id_does_not_release() {
        let mgr = manager_with(
            MemoryStorage::seeded(&[("tok-a", 10)]),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        let (_, rid) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();
        assert!(!mgr.release_token_reservation("tok-a", "resv-stale").await);
        assert!(basic_record(&mgr, "tok-a").await.inflight_until > 0);
        assert!(mgr.release_token_reservation("tok-a", &rid).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_usage_consumes_locally_before_remote_sync() {
        let gate = Arc::new(Notify::new());
        let quota = Arc::new(FakeQuota {
            remaining: Some(7),
            gate: Some(gate.clone()),
            calls: StdMutex::new(Vec::new()),
        });
        let mgr = manager_with(MemoryStorage::seeded(&[("tok-1", 10)]), quota.clone());
        mgr.reload().await.unwrap();

        // 即使远端同步被阻塞，快路径也应立即返回并完成本地扣减。
        let ok = tokio::time::timeout(
            Duration::from_millis(50),
            mgr.sync_usage("tok-1", "grok-3", true, true),
        )
        .await
        .unwrap();
        assert!(ok);

        let rec = basic_record(&mgr, "tok-1").await;
        assert_eq!(rec.quota, 9);
        assert_eq!(rec.use_count, 1);

        // 远端返回后，本地估算被权威值覆盖。
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rec = basic_record(&mgr, "tok-1").await;
        assert_eq!(rec.quota, 7);
        assert_eq!(rec.use_count, 1);
        assert_eq!(quota.calls.lock().unwrap().as_slice(), ["tok-1"]);
    }

    #[tokio::test]
    async fn sync_usage_skips_decrement_without_consume() {
        let mgr = manager_with(
            MemoryStorage::seeded(&[("tok-1", 10)]),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        assert!(mgr.sync_usage("tok-1", "grok-3", false, false).await);
        let rec = basic_record(&mgr, "tok-1").await;
        assert_eq!(rec.quota, 10);
        assert_eq!(rec.use_count, 0);

        assert!(!mgr.sync_usage("tok-missing", "grok-3", true, true).await);
    }

    #[tokio::test]
    async fn record_fail_demotes_by_status_class() {
        let mgr = manager_with(
            MemoryStorage::seeded(&[("tok-auth", 10), ("tok-rate", 10), ("tok-5xx", 10)]),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        mgr.record_fail("tok-auth", 401, "unauthorized").await;
        mgr.record_fail("tok-rate", 429, "rate limited").await;
        mgr.record_fail("tok-5xx", 500, "server error").await;

        let auth = basic_record(&mgr, "tok-auth").await;
        assert_eq!(auth.status, TokenStatus::Expired);
        assert_eq!(auth.fail_count, 1);

        let rate = basic_record(&mgr, "tok-rate").await;
        assert_eq!(rate.status, TokenStatus::Cooling);
        assert!(rate.cooling_until > Utc::now().timestamp());

        let five = basic_record(&mgr, "tok-5xx").await;
        assert_eq!(five.status, TokenStatus::Active);
        assert_eq!(five.fail_count, 1);

        // 降级后只剩未知失败的记录可选。
        let (tok, _) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(tok, "tok-5xx");
    }

    #[tokio::test]
    async fn reload_preserves_inflight_for_surviving_tokens() {
        let storage = MemoryStorage::seeded(&[("tok-a", 10), ("tok-b", 10)]);
        let mgr = manager_with(storage, Arc::new(FakeQuota::default()));
        mgr.reload().await.unwrap();

        let (_, rid) = mgr
            .reserve_token_for_model("grok-3", &HashSet::new())
            .await
            .unwrap();

        mgr.reload().await.unwrap();
        let rec = basic_record(&mgr, "tok-a").await;
        assert_eq!(rec.inflight_reservation_id.as_deref(), Some(rid.as_str()));
        assert!(rec.inflight_until > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_if_stale_skips_within_ttl() {
        let storage = MemoryStorage::seeded(&[("tok-a", 10)]);
        let mgr = manager_with(storage, Arc::new(FakeQuota::default()));
        mgr.reload().await.unwrap();

        // 存储中清空；ttl 内不应触发 refetch。
        mgr.storage
            .save_tokens(&HashMap::new())
            .await
            .unwrap();
        mgr.reload_if_stale().await;
        assert!(!mgr.pools_snapshot().await[POOL_BASIC].is_empty());

        tokio::time::advance(Duration::from_secs(
            mgr.cfg.token_reload_ttl_secs + 1,
        ))
        .await;
        mgr.reload_if_stale().await;
        assert!(mgr.pools_snapshot().await[POOL_BASIC].is_empty());
    }

    /// 同一 token 同时挂在两个池（super 账号兼跑 basic 模型）。
    fn dual_pool_storage(token: &str, quota: i64, heavy_quota: i64) -> MemoryStorage {
        let mut record = TokenRecord::new(token).with_quota(quota);
        record.heavy_quota = heavy_quota;

        let mut pools = HashMap::new();
        pools.insert(POOL_BASIC.to_string(), vec![record.clone()]);
        pools.insert(POOL_SUPER.to_string(), vec![record]);
        MemoryStorage::new(pools)
    }

    async fn record_in(mgr: &TokenManager, pool: &str, token: &str) -> TokenRecord {
        mgr.pools_snapshot().await[pool]
            .iter()
            .find(|r| r.token == token)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn dual_pool_token_releases_the_reserved_copy() {
        let mgr = manager_with(
            dual_pool_storage("tok-dual", 10, 10),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        let (token, rid) = mgr
            .reserve_token_for_model("grok-4-heavy", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(token, "tok-dual");

        // 释放必须命中 super 池里持有该预占 id 的副本，不被 basic 副本挡住。
        assert!(mgr.release_token_reservation("tok-dual", &rid).await);
        let rec = record_in(&mgr, POOL_SUPER, "tok-dual").await;
        assert_eq!(rec.inflight_until, 0);
        assert!(rec.inflight_reservation_id.is_none());

        // 释放后可立即再次预占。
        assert!(
            mgr.reserve_token_for_model("grok-4-heavy", &HashSet::new())
                .await
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dual_pool_usage_charges_only_the_model_pool_copy() {
        let mgr = manager_with(
            dual_pool_storage("tok-dual", 10, 5),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        assert!(mgr.sync_usage("tok-dual", "grok-4-heavy", true, true).await);

        let heavy = record_in(&mgr, POOL_SUPER, "tok-dual").await;
        assert_eq!(heavy.heavy_quota, 4);
        assert_eq!(heavy.use_count, 1);

        // basic 副本不属于这次消耗，保持原样。
        let basic = record_in(&mgr, POOL_BASIC, "tok-dual").await;
        assert_eq!(basic.quota, 10);
        assert_eq!(basic.heavy_quota, 5);
        assert_eq!(basic.use_count, 0);
    }

    #[tokio::test]
    async fn dual_pool_auth_failure_expires_every_copy() {
        let mgr = manager_with(
            dual_pool_storage("tok-dual", 10, 10),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        mgr.record_fail("tok-dual", 401, "unauthorized").await;

        for pool in [POOL_BASIC, POOL_SUPER] {
            let rec = record_in(&mgr, pool, "tok-dual").await;
            assert_eq!(rec.status, TokenStatus::Expired);
            assert_eq!(rec.fail_count, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_double_book() {
        let mgr = manager_with(
            MemoryStorage::seeded(&[("tok-1", 10), ("tok-2", 10), ("tok-3", 10), ("tok-4", 10)]),
            Arc::new(FakeQuota::default()),
        );
        mgr.reload().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.reserve_token_for_model("grok-3", &HashSet::new()).await
            }));
        }

        let mut granted = Vec::new();
        for h in handles {
            if let Some((token, _)) = h.await.unwrap() {
                granted.push(token);
            }
        }

        // 四个 token 恰好各发出一次，其余尝试拿不到预占。
        let unique: HashSet<String> = granted.iter().cloned().collect();
        assert_eq!(unique.len(), granted.len());
        assert_eq!(granted.len(), 4);
    }
}
