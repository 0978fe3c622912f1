//! grok.com 请求头构造（单一来源）：所有上游调用共用同一套浏览器指纹头。

use crate::config::Config;
use crate::util::id;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

static STATIC_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("cache-control", "no-cache"),
    ("content-type", "application/json"),
    ("origin", "https://grok.com"),
    ("pragma", "no-cache"),
    ("priority", "u=1, i"),
    ("referer", "https://grok.com/"),
    (
        "sec-ch-ua",
        "\"Google Chrome\";v=\"136\", \"Chromium\";v=\"136\", \"Not(A:Brand\";v=\"24\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    ("user-agent", UA),
];

/// 构建一次上游调用的请求头。token 接受 raw 或带 `sso=` 前缀两种形式。
pub fn build_grok_headers(cfg: &Config, token: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(STATIC_HEADERS.len() + 2);
    for (name, value) in STATIC_HEADERS {
        if let Ok(n) = HeaderName::from_bytes(name.as_bytes()) {
            headers.insert(n, HeaderValue::from_static(value));
        }
    }

    if let Ok(v) = HeaderValue::from_str(&id::upstream_request_id()) {
        headers.insert("x-xai-request-id", v);
    }

    let token = token.strip_prefix("sso=").unwrap_or(token);
    let cf = cfg.cf_clearance.trim();
    let cookie = if cf.is_empty() {
        format!("sso={token}")
    } else {
        format!("sso={token};cf_clearance={cf}")
    };
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        headers.insert(reqwest::header::COOKIE, v);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_strips_sso_prefix_and_appends_cf_clearance() {
        let cfg = Config {
            cf_clearance: "cf-abc".to_string(),
            ..Config::default()
        };

        let headers = build_grok_headers(&cfg, "sso=tok-123");
        let cookie = headers.get(reqwest::header::COOKIE).unwrap();
        assert_eq!(cookie.to_str().unwrap(), "sso=tok-123;cf_clearance=cf-abc");
    }

    #[test]
    fn request_id_is_fresh_per_call() {
        let cfg = Config::default();
        let a = build_grok_headers(&cfg, "t");
        let b = build_grok_headers(&cfg, "t");
        assert_ne!(a.get("x-xai-request-id"), b.get("x-xai-request-id"));
    }
}
