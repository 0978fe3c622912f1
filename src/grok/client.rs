//! 上游对话协作方：向 grok.com 发起对话请求，返回行式响应流。

use crate::config::Config;
use crate::error::AppError;
use crate::grok::headers::build_grok_headers;
use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

const CHAT_API: &str = "https://grok.com/rest/app-chat/conversations/new";

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

/// 一次对话调用的全部输入。
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub message: String,
    pub model: String,
    pub mode: String,
    pub think: bool,
}

#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// 非 2xx 返回携带状态码的上游错误；成功返回懒惰的响应行序列。
    async fn chat(&self, token: &str, payload: &ChatPayload) -> Result<LineStream, AppError>;
}

#[derive(Debug, Clone)]
pub struct GrokClient {
    client: reqwest::Client,
    cfg: Config,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrokChatRequest<'a> {
    temporary: bool,
    model_name: &'a str,
    model_mode: &'a str,
    message: &'a str,
    file_attachments: Vec<String>,
    image_attachments: Vec<String>,
    disable_search: bool,
    enable_image_generation: bool,
    return_image_bytes: bool,
    return_raw_grok_in_xai_request: bool,
    enable_image_streaming: bool,
    image_generation_count: u32,
    force_concise: bool,
    tool_overrides: HashMap<String, bool>,
    enable_side_by_side: bool,
    send_final_metadata: bool,
    is_reasoning: bool,
    disable_text_follow_ups: bool,
    response_metadata: ResponseMetadata<'a>,
    disable_memory: bool,
    force_side_by_side: bool,
    is_async_chat: bool,
    disable_self_harm_short_circuit: bool,
    device_env_info: DeviceEnvInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseMetadata<'a> {
    model_config_override: ModelConfigOverride,
    request_model_details: RequestModelDetails<'a>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelConfigOverride {
    model_map: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestModelDetails<'a> {
    model_id: &'a str,
}

/// 上游校验的浏览器环境指纹，取值与 headers 的指纹保持同一套桌面环境。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEnvInfo {
    dark_mode_enabled: bool,
    device_pixel_ratio: u32,
    screen_width: u32,
    screen_height: u32,
    viewport_width: u32,
    viewport_height: u32,
}

impl Default for DeviceEnvInfo {
    fn default() -> Self {
        Self {
            dark_mode_enabled: false,
            device_pixel_ratio: 2,
            screen_width: 2056,
            screen_height: 1329,
            viewport_width: 2056,
            viewport_height: 1083,
        }
    }
}

fn build_chat_body<'a>(cfg: &Config, payload: &'a ChatPayload) -> GrokChatRequest<'a> {
    GrokChatRequest {
        temporary: cfg.temporary_chat,
        model_name: &payload.model,
        model_mode: &payload.mode,
        message: &payload.message,
        file_attachments: Vec::new(),
        image_attachments: Vec::new(),
        disable_search: false,
        enable_image_generation: true,
        return_image_bytes: false,
        return_raw_grok_in_xai_request: false,
        enable_image_streaming: true,
        image_generation_count: 2,
        force_concise: false,
        tool_overrides: HashMap::new(),
        enable_side_by_side: true,
        send_final_metadata: true,
        is_reasoning: payload.think,
        disable_text_follow_ups: false,
        response_metadata: ResponseMetadata {
            model_config_override: ModelConfigOverride::default(),
            request_model_details: RequestModelDetails {
                model_id: &payload.model,
            },
        },
        disable_memory: false,
        force_side_by_side: false,
        is_async_chat: false,
        disable_self_harm_short_circuit: false,
        device_env_info: DeviceEnvInfo::default(),
    }
}

impl GrokClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(cfg.timeout_ms));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim()).context("解析代理地址失败")?);
        }
        Ok(Self {
            client: builder.build().context("构建 HTTP 客户端失败")?,
            cfg: cfg.clone(),
        })
    }
}

#[async_trait]
impl ChatUpstream for GrokClient {
    async fn chat(&self, token: &str, payload: &ChatPayload) -> Result<LineStream, AppError> {
        let body = build_chat_body(&self.cfg, payload);

        let resp = self
            .client
            .post(CHAT_API)
            .headers(build_grok_headers(&self.cfg, token))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(1000).collect();
            tracing::error!(status = status.as_u16(), "对话请求失败: {snippet}");
            return Err(AppError::upstream(status.as_u16(), snippet));
        }

        let mut bytes = resp.bytes_stream();
        let lines = async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(b) => {
                        buf.extend_from_slice(&b);
                        while let Some(pos) = buf.iter().position(|&c| c == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line).trim().to_string();
                            if !line.is_empty() {
                                yield Ok(line);
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(AppError::Network(e.to_string()));
                        return;
                    }
                }
            }
            if !buf.is_empty() {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if !line.is_empty() {
                    yield Ok(line);
                }
            }
        };

        Ok(Box::pin(lines))
    }
}
