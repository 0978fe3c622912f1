use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8698;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_ASSET_URL: &str = "https://assets.grok.com";

/// 全部运行配置。启动时解析一次，之后按值传给各组件构造函数。
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_key: String,
    pub proxy: String,
    pub timeout_ms: u64,
    pub cf_clearance: String,

    /// 换 token 重试预算（不含首次尝试）。
    pub retry_max_attempts: usize,
    /// 预占的独占时长：超时后预占自动失效，避免泄漏导致 token 永久不可选。
    pub reservation_ttl_secs: i64,
    /// token 池距上次 reload 的最大陈旧时长。
    pub token_reload_ttl_secs: u64,
    /// 429 类失败后的冷却时长。
    pub token_cooldown_secs: i64,

    /// 远端用量查询熔断时长（404 触发）。
    pub usage_sync_backoff_secs: u64,
    /// 远端用量查询并发上限。
    pub usage_max_concurrent: usize,

    /// 生成图片的引用地址前缀。
    pub asset_url: String,
    /// url | markdown
    pub image_format: String,
    /// separate | merge
    pub thinking_mode: String,
    /// 请求未显式指定 stream 时的默认值。
    pub stream_default: bool,
    /// 上游临时会话开关（不落上游历史）。
    pub temporary_chat: bool,

    pub data_dir: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "CF_CLEARANCE")]
    cf_clearance: Option<String>,

    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<usize>,
    #[serde(alias = "RESERVATION_TTL_SECS")]
    reservation_ttl_secs: Option<i64>,
    #[serde(alias = "TOKEN_RELOAD_TTL_SECS")]
    token_reload_ttl_secs: Option<u64>,
    #[serde(alias = "TOKEN_COOLDOWN_SECS")]
    token_cooldown_secs: Option<i64>,

    #[serde(alias = "USAGE_SYNC_BACKOFF_SECS")]
    usage_sync_backoff_secs: Option<u64>,
    #[serde(alias = "USAGE_MAX_CONCURRENT")]
    usage_max_concurrent: Option<usize>,

    #[serde(alias = "ASSET_URL")]
    asset_url: Option<String>,
    #[serde(alias = "IMAGE_FORMAT")]
    image_format: Option<String>,
    #[serde(alias = "THINKING_MODE")]
    thinking_mode: Option<String>,
    #[serde(alias = "STREAM_DEFAULT")]
    stream_default: Option<bool>,
    #[serde(alias = "TEMPORARY_CHAT")]
    temporary_chat: Option<bool>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_key: raw.api_key.unwrap_or_default(),
            proxy: raw.proxy.unwrap_or_default(),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            cf_clearance: raw.cf_clearance.unwrap_or_default(),
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(3),
            reservation_ttl_secs: raw.reservation_ttl_secs.unwrap_or(120).max(1),
            token_reload_ttl_secs: raw.token_reload_ttl_secs.unwrap_or(60),
            token_cooldown_secs: raw.token_cooldown_secs.unwrap_or(3600).max(0),
            usage_sync_backoff_secs: raw.usage_sync_backoff_secs.unwrap_or(600),
            usage_max_concurrent: raw.usage_max_concurrent.unwrap_or(25).max(1),
            asset_url: raw.asset_url.unwrap_or_else(|| DEFAULT_ASSET_URL.to_string()),
            image_format: raw.image_format.unwrap_or_else(|| "markdown".to_string()),
            thinking_mode: raw.thinking_mode.unwrap_or_else(|| "separate".to_string()),
            stream_default: raw.stream_default.unwrap_or(true),
            temporary_chat: raw.temporary_chat.unwrap_or(true),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
        }
    }

    pub fn thinking_merged(&self) -> bool {
        self.thinking_mode.trim().eq_ignore_ascii_case("merge")
    }

    pub fn image_markdown(&self) -> bool {
        !self.image_format.trim().eq_ignore_ascii_case("url")
    }
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}
