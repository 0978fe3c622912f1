//! 上游配额协作方：查询 token 的权威剩余额度，带共享熔断冷却。

use crate::config::Config;
use crate::error::AppError;
use crate::grok::headers::build_grok_headers;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const LIMITS_API: &str = "https://grok.com/rest/rate-limits";
const USAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait QuotaUpstream: Send + Sync {
    /// 返回权威剩余额度；`Ok(None)` 表示处于熔断冷却期，本次跳过远端查询。
    async fn remaining(&self, token: &str, model: &str) -> Result<Option<i64>, AppError>;
}

/// 进程级熔断状态：404 类稳定失败后的一段时间内抑制所有远端配额查询。
///
/// 显式对象、启动时构造一次并共享，而不是模块级全局变量。
#[derive(Debug, Default)]
pub struct SyncCooldown {
    until: Mutex<Option<Instant>>,
}

impl SyncCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前剩余冷却时长；未处于冷却期返回 None。
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until.lock().ok()?.as_ref().copied()?;
        let now = Instant::now();
        if until > now { Some(until - now) } else { None }
    }

    /// 以 ttl 进入冷却；只延长、不缩短已有窗口。ttl 为 0 不生效。
    pub fn arm(&self, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let new_until = Instant::now() + ttl;
        if let Ok(mut until) = self.until.lock()
            && until.is_none_or(|u| new_until > u)
        {
            *until = Some(new_until);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.remaining().is_some()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitsRequest<'a> {
    request_kind: &'static str,
    model_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct LimitsResponse {
    #[serde(rename = "remainingTokens", default)]
    remaining_tokens: Option<i64>,
}

pub struct UsageService {
    client: reqwest::Client,
    cfg: Config,
    semaphore: Semaphore,
    cooldown: SyncCooldown,
}

impl UsageService {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(USAGE_TIMEOUT);
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim()).context("解析代理地址失败")?);
        }
        Ok(Self {
            client: builder.build().context("构建 HTTP 客户端失败")?,
            cfg: cfg.clone(),
            semaphore: Semaphore::new(cfg.usage_max_concurrent),
            cooldown: SyncCooldown::new(),
        })
    }

    fn arm_cooldown_for_status(&self, status: u16) {
        // 仅对稳定失败（404 类）熔断，避免重复打点与日志洪泛。
        if status != 404 {
            return;
        }
        let ttl = Duration::from_secs(self.cfg.usage_sync_backoff_secs);
        if !ttl.is_zero() {
            self.cooldown.arm(ttl);
            tracing::warn!(
                "配额远端同步熔断 {}s（上游返回 404）",
                self.cfg.usage_sync_backoff_secs
            );
        }
    }
}

#[async_trait]
impl QuotaUpstream for UsageService {
    async fn remaining(&self, token: &str, model: &str) -> Result<Option<i64>, AppError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        if let Some(rem) = self.cooldown.remaining() {
            tracing::debug!("配额同步冷却中，跳过远端查询（剩余 {}s）", rem.as_secs());
            return Ok(None);
        }

        let resp = self
            .client
            .post(LIMITS_API)
            .headers(build_grok_headers(&self.cfg, token))
            .json(&LimitsRequest {
                request_kind: "DEFAULT",
                model_name: model,
            })
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 200 {
            let data: LimitsResponse = resp
                .json()
                .await
                .map_err(|e| AppError::Network(e.to_string()))?;
            let remaining = data.remaining_tokens.unwrap_or(0);
            tracing::info!("配额查询: 剩余 {remaining}");
            return Ok(Some(remaining));
        }

        self.arm_cooldown_for_status(status);
        Err(AppError::upstream(status, "配额查询失败"))
    }
}
