//! 基于 tiktoken o200k_base 的本地计数，用于 usage 字段估算。

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn encoder() -> Option<&'static CoreBPE> {
    static ENC: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENC.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

pub fn count_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(enc) => enc.encode_with_special_tokens(text).len() as u32,
        // 编码表加载失败时退化为粗略估算，计数精度不影响正确性。
        None => text.chars().count().div_ceil(4) as u32,
    }
}

/// 按 OpenAI 消息结构估算 prompt tokens：3 为基础开销，每条消息 +4（角色与分隔符）。
pub fn count_prompt_tokens(texts: &[String]) -> u32 {
    let mut total = 3u32;
    for t in texts {
        total += 4;
        total += count_text(t);
    }
    total
}
