//! 流式翻译：上游事件 -> OpenAI chunk 序列。
//!
//! 整个响应共用一个 `chatcmpl-` 前缀 id；首个产出 chunk 必须携带真实内容
//! （不发只有 role 的空前导包），序列以字面 `[DONE]` 收尾。

use super::types::{ChatCompletion, Choice, Delta, Usage};
use crate::config::Config;
use crate::grok::event::GrokEvent;
use crate::util::{id, tokens};
use chrono::Utc;

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// SSE 错误事件：`{"error":{...}}` 加终止标记。
pub fn sse_error_events(msg: &str) -> Vec<String> {
    let encoded = sonic_rs::to_string(msg).unwrap_or_else(|_| "\"\"".to_string());
    let json = format!("{{\"error\":{{\"message\":{encoded},\"type\":\"upstream_error\"}}}}");
    vec![json, "[DONE]".to_string()]
}

pub(crate) fn resolve_image_url(asset_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    format!(
        "{}/{}",
        asset_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

pub(crate) fn render_image(markdown: bool, full_url: &str) -> String {
    if markdown {
        format!("![image]({full_url})")
    } else {
        full_url.to_string()
    }
}

pub struct StreamProcessor {
    id: String,
    created: i64,
    model: String,
    prompt_tokens: u32,

    thinking_merge: bool,
    image_markdown: bool,
    asset_url: String,

    sent_role: bool,
    in_think: bool,
    content_acc: String,
    reasoning_acc: String,
}

impl StreamProcessor {
    pub fn new(cfg: &Config, model: &str, prompt_tokens: u32) -> Self {
        Self {
            id: id::chat_completion_id(),
            created: now_unix(),
            model: model.to_string(),
            prompt_tokens,
            thinking_merge: cfg.thinking_merged(),
            image_markdown: cfg.image_markdown(),
            asset_url: cfg.asset_url.clone(),
            sent_role: false,
            in_think: false,
            content_acc: String::new(),
            reasoning_acc: String::new(),
        }
    }

    pub fn process_event(&mut self, ev: &GrokEvent) -> Vec<String> {
        match ev {
            GrokEvent::Token { text, thinking } => {
                if *thinking {
                    self.reasoning_acc.push_str(text);
                    if self.thinking_merge {
                        let out = if self.in_think {
                            text.clone()
                        } else {
                            self.in_think = true;
                            format!("<think>\n{text}")
                        };
                        self.content_chunk(&out)
                    } else {
                        self.reasoning_chunk(text)
                    }
                } else {
                    self.content_acc.push_str(text);
                    let out = if self.in_think {
                        self.in_think = false;
                        format!("\n</think>\n{text}")
                    } else {
                        text.clone()
                    };
                    self.content_chunk(&out)
                }
            }
            GrokEvent::Image { url } => {
                let full = resolve_image_url(&self.asset_url, url);
                let rendered = render_image(self.image_markdown, &full);
                self.content_acc.push_str(&rendered);
                self.content_chunk(&format!("{rendered}\n"))
            }
            // 终止元数据：内容已增量下发，这里不再产生输出。
            GrokEvent::Final { .. } => Vec::new(),
        }
    }

    /// 结束序列：补齐未闭合的思考栅栏，发 finish_reason + usage，最后 `[DONE]`。
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.in_think {
            self.in_think = false;
            out.extend(self.content_chunk("\n</think>\n"));
        }

        let completion_tokens =
            tokens::count_text(&self.content_acc) + tokens::count_text(&self.reasoning_acc);
        out.extend(self.write_chunk(
            Delta::default(),
            Some("stop".to_string()),
            Some(Usage::new(self.prompt_tokens, completion_tokens)),
        ));
        out.push("[DONE]".to_string());
        out
    }

    fn content_chunk(&mut self, text: &str) -> Vec<String> {
        self.write_chunk(
            Delta {
                content: text.to_string(),
                ..Delta::default()
            },
            None,
            None,
        )
    }

    fn reasoning_chunk(&mut self, text: &str) -> Vec<String> {
        self.write_chunk(
            Delta {
                reasoning_content: text.to_string(),
                ..Delta::default()
            },
            None,
            None,
        )
    }

    fn write_chunk(
        &mut self,
        mut delta: Delta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> Vec<String> {
        // role 随第一个实际 chunk 一起下发，而不是单发一个空前导包。
        if !self.sent_role {
            self.sent_role = true;
            delta.role = "assistant".to_string();
        }

        let chunk = ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason,
            }],
            usage,
        };

        match sonic_rs::to_string(&chunk) {
            Ok(s) => vec![s],
            Err(_) => Vec::new(),
        }
    }
}
