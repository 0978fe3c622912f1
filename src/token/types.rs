use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const POOL_BASIC: &str = "ssoBasic";
pub const POOL_SUPER: &str = "ssoSuper";

/// -1 表示无限额度。
pub const QUOTA_UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    /// 可被选择。
    Active,
    /// 瞬时失败（限流类），冷却到期前不可选择。
    Cooling,
    /// 认证失败，等待外部 reload 重新引入。
    Expired,
    /// 人工停用。
    Disabled,
}

impl Default for TokenStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// 单个 SSO 凭证在池中的完整状态。
///
/// `inflight_*` 为运行时字段：`inflight_until > now` 表示该 token 正被一次
/// 请求独占，选择时必须跳过。持久化时不落盘。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    #[serde(default)]
    pub status: TokenStatus,
    #[serde(default = "default_quota")]
    pub quota: i64,
    #[serde(default = "default_quota")]
    pub heavy_quota: i64,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    /// 最近一次被选中的时间（unix 秒），驱动 LRU 轮转。
    #[serde(default)]
    pub last_used: i64,
    /// Cooling 状态的解除时间（unix 秒）。
    #[serde(default)]
    pub cooling_until: i64,
    #[serde(skip)]
    pub inflight_until: i64,
    #[serde(skip)]
    pub inflight_reservation_id: Option<String>,
    #[serde(default)]
    pub note: String,
}

fn default_quota() -> i64 {
    QUOTA_UNLIMITED
}

impl TokenRecord {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            status: TokenStatus::Active,
            quota: QUOTA_UNLIMITED,
            heavy_quota: QUOTA_UNLIMITED,
            use_count: 0,
            fail_count: 0,
            last_used: 0,
            cooling_until: 0,
            inflight_until: 0,
            inflight_reservation_id: None,
            note: String::new(),
        }
    }

    pub fn with_quota(mut self, quota: i64) -> Self {
        self.quota = quota;
        self
    }

    /// 指定池维度下的剩余额度（super 池看 heavy_quota）。
    pub fn remaining_for(&self, pool_name: &str) -> i64 {
        if pool_name == POOL_SUPER {
            self.heavy_quota
        } else {
            self.quota
        }
    }

    fn eligible(&self, pool_name: &str, exclude: &HashSet<String>, now: i64) -> bool {
        if exclude.contains(&self.token) {
            return false;
        }
        match self.status {
            TokenStatus::Active => {}
            TokenStatus::Cooling => {
                if self.cooling_until > now {
                    return false;
                }
            }
            TokenStatus::Expired | TokenStatus::Disabled => return false,
        }
        if self.inflight_until > now {
            return false;
        }
        let remaining = self.remaining_for(pool_name);
        remaining == QUOTA_UNLIMITED || remaining > 0
    }
}

/// 同一凭证等级的有序 token 集合。按 token 字符串去重，保留插入顺序。
#[derive(Debug, Clone, Default)]
pub struct TokenPool {
    name: String,
    records: Vec<TokenRecord>,
}

impl TokenPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
        }
    }

    /// 插入或按 token 原位替换。
    pub fn add(&mut self, record: TokenRecord) {
        if let Some(existing) = self.records.iter_mut().find(|r| r.token == record.token) {
            *existing = record;
        } else {
            self.records.push(record);
        }
    }

    pub fn list(&self) -> &[TokenRecord] {
        &self.records
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut TokenRecord> {
        self.records.iter_mut().find(|r| r.token == token)
    }

    /// 选出下一个可用 token。
    ///
    /// 选择策略（确定性）：在全部合格记录中取 `last_used` 最小者，相同则按
    /// 插入顺序取最早者，即按最久未使用轮转。
    ///
    /// 调用方必须在池级互斥区内完成 select 与预占标记，保证不被并发复选。
    pub fn select_mut(
        &mut self,
        exclude: &HashSet<String>,
        now: i64,
    ) -> Option<&mut TokenRecord> {
        let mut best: Option<(usize, i64)> = None;
        for (idx, r) in self.records.iter().enumerate() {
            if !r.eligible(&self.name, exclude, now) {
                continue;
            }
            match best {
                Some((_, last_used)) if r.last_used >= last_used => {}
                _ => best = Some((idx, r.last_used)),
            }
        }
        let (idx, _) = best?;
        let record = &mut self.records[idx];
        // 冷却到期的记录在被重新选中时恢复 Active。
        if record.status == TokenStatus::Cooling {
            record.status = TokenStatus::Active;
            record.cooling_until = 0;
        }
        Some(record)
    }
}
