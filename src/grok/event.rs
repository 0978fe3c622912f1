//! 上游行式 JSON 事件解析。
//!
//! 每行一个 JSON 对象，有效负载在 `result.response` 下；指纹/结构类事件
//! （llmInfo 等）直接忽略，不产生任何下游输出。

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum GrokEvent {
    /// 增量文本；thinking 为 true 时是思考内容。
    Token { text: String, thinking: bool },
    /// 生成图片引用（相对路径或完整 URL）。
    Image { url: String },
    /// 终止元数据：完整消息与图片清单。
    Final {
        message: String,
        image_urls: Vec<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: ResultBody,
}

#[derive(Debug, Default, Deserialize)]
struct ResultBody {
    #[serde(default)]
    response: ResponseBody,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    token: Option<String>,
    #[serde(rename = "isThinking", default)]
    is_thinking: bool,
    #[serde(rename = "cachedImageGenerationResponse", default)]
    cached_image: Option<ImageRef>,
    #[serde(rename = "streamingImageGenerationResponse", default)]
    streaming_image: Option<ImageRef>,
    #[serde(rename = "modelResponse", default)]
    model_response: Option<ModelResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageRef {
    #[serde(rename = "imageUrl", default)]
    image_url: String,
    /// 流式图片进度 [0,100]；仅完成帧产出事件，避免重复引用。
    #[serde(default)]
    progress: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    message: String,
    #[serde(rename = "generatedImageUrls", default)]
    generated_image_urls: Vec<String>,
}

/// 解析一行上游输出；非事件行（空行、元数据、坏行）返回 None。
pub fn parse_line(line: &str) -> Option<GrokEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let envelope: Envelope = match sonic_rs::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("跳过无法解析的上游行: {e}");
            return None;
        }
    };
    let resp = envelope.result.response;

    if let Some(model_response) = resp.model_response {
        return Some(GrokEvent::Final {
            message: model_response.message,
            image_urls: model_response.generated_image_urls,
        });
    }

    if let Some(token) = resp.token
        && !token.is_empty()
    {
        return Some(GrokEvent::Token {
            text: token,
            thinking: resp.is_thinking,
        });
    }

    if let Some(img) = resp.cached_image
        && !img.image_url.is_empty()
    {
        return Some(GrokEvent::Image { url: img.image_url });
    }

    if let Some(img) = resp.streaming_image
        && !img.image_url.is_empty()
        && img.progress.unwrap_or(100) >= 100
    {
        return Some(GrokEvent::Image { url: img.image_url });
    }

    None
}
