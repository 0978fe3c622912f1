//! 从 OpenAI 消息列表提取上游所需的单段文本。

use crate::gateway::openai::types::{Message, MessageContent};

/// 单条消息的纯文本（多段取全部 text 段，换行拼接）。
pub fn message_text(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(s) => s.trim().to_string(),
        MessageContent::Parts(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.typ == "text" && !p.text.trim().is_empty())
                .map(|p| p.text.as_str())
                .collect();
            texts.join("\n")
        }
    }
}

/// 每条消息的文本列表（用于 prompt token 计数）。
pub fn message_texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(message_text).collect()
}

/// 合并整段对话为一条上游消息。
///
/// 除最后一条 user 消息外，每段前缀角色名；消息之间空行分隔。
pub fn merge_messages(messages: &[Message]) -> String {
    let extracted: Vec<(String, String)> = messages
        .iter()
        .filter_map(|m| {
            let text = message_text(m);
            if text.is_empty() {
                None
            } else {
                Some((m.role.clone(), text))
            }
        })
        .collect();

    let last_user_index = extracted.iter().rposition(|(role, _)| role == "user");

    let mut out = Vec::with_capacity(extracted.len());
    for (i, (role, text)) in extracted.iter().enumerate() {
        if Some(i) == last_user_index {
            out.push(text.clone());
        } else {
            let role = if role.is_empty() { "user" } else { role };
            out.push(format!("{role}: {text}"));
        }
    }
    out.join("\n\n")
}
