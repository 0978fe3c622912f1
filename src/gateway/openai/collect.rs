//! 聚合翻译：把整条上游事件流收拢为一个非流式 ChatCompletion。

use super::stream::{now_unix, render_image, resolve_image_url};
use super::types::{ChatCompletion, Choice, ResponseMessage, Usage};
use crate::config::Config;
use crate::grok::event::GrokEvent;
use crate::util::{id, tokens};

pub struct CollectProcessor {
    id: String,
    created: i64,
    model: String,
    prompt_tokens: u32,

    thinking_merge: bool,
    image_markdown: bool,
    asset_url: String,

    content: String,
    reasoning: String,
    final_message: Option<String>,
    image_urls: Vec<String>,
}

impl CollectProcessor {
    pub fn new(cfg: &Config, model: &str, prompt_tokens: u32) -> Self {
        Self {
            id: id::chat_completion_id(),
            created: now_unix(),
            model: model.to_string(),
            prompt_tokens,
            thinking_merge: cfg.thinking_merged(),
            image_markdown: cfg.image_markdown(),
            asset_url: cfg.asset_url.clone(),
            content: String::new(),
            reasoning: String::new(),
            final_message: None,
            image_urls: Vec::new(),
        }
    }

    pub fn process_event(&mut self, ev: &GrokEvent) {
        match ev {
            GrokEvent::Token { text, thinking } => {
                if *thinking {
                    self.reasoning.push_str(text);
                } else {
                    self.content.push_str(text);
                }
            }
            GrokEvent::Image { url } => self.push_image(url),
            GrokEvent::Final {
                message,
                image_urls,
            } => {
                if !message.is_empty() {
                    self.final_message = Some(message.clone());
                }
                for u in image_urls {
                    self.push_image(u);
                }
            }
        }
    }

    fn push_image(&mut self, url: &str) {
        let full = resolve_image_url(&self.asset_url, url);
        if !self.image_urls.contains(&full) {
            self.image_urls.push(full);
        }
    }

    /// 组装最终响应。终止事件里的完整 message 优先于增量拼接的文本。
    pub fn finish(self) -> ChatCompletion {
        let mut content = self
            .final_message
            .unwrap_or(self.content)
            .trim()
            .to_string();

        let mut reasoning = String::new();
        if !self.reasoning.is_empty() {
            if self.thinking_merge {
                content = format!("<think>\n{}\n</think>\n{content}", self.reasoning);
            } else {
                reasoning = self.reasoning;
            }
        }

        for url in &self.image_urls {
            let rendered = render_image(self.image_markdown, url);
            if content.is_empty() {
                content = rendered;
            } else {
                content = format!("{content}\n\n{rendered}");
            }
        }

        let completion_tokens = tokens::count_text(&content) + tokens::count_text(&reasoning);
        ChatCompletion {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![Choice {
                index: 0,
                message: Some(ResponseMessage {
                    role: "assistant".to_string(),
                    content,
                    reasoning_content: reasoning,
                }),
                delta: None,
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage::new(self.prompt_tokens, completion_tokens)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, thinking: bool) -> GrokEvent {
        GrokEvent::Token {
            text: text.to_string(),
            thinking,
        }
    }

    #[test]
    fn final_message_wins_over_concatenated_tokens() {
        let mut proc = CollectProcessor::new(&Config::default(), "grok-3", 2);
        proc.process_event(&token("Hel", false));
        proc.process_event(&token("lo", false));
        proc.process_event(&GrokEvent::Final {
            message: "Hello there".to_string(),
            image_urls: vec![],
        });

        let resp = proc.finish();
        let msg = resp.choices[0].message.as_ref().unwrap();
        assert_eq!(msg.content, "Hello there");
        assert_eq!(resp.object, "chat.completion");
        assert!(resp.id.starts_with("chatcmpl-"));
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn falls_back_to_token_concatenation_without_final() {
        let mut proc = CollectProcessor::new(&Config::default(), "grok-3", 0);
        proc.process_event(&token("a", false));
        proc.process_event(&token("b", false));

        let resp = proc.finish();
        assert_eq!(resp.choices[0].message.as_ref().unwrap().content, "ab");
    }

    #[test]
    fn separate_mode_keeps_reasoning_out_of_content() {
        let mut proc = CollectProcessor::new(&Config::default(), "grok-3", 0);
        proc.process_event(&token("deep thought", true));
        proc.process_event(&token("42", false));

        let msg = proc.finish().choices.remove(0).message.unwrap();
        assert_eq!(msg.content, "42");
        assert_eq!(msg.reasoning_content, "deep thought");
    }

    #[test]
    fn merge_mode_folds_reasoning_into_content() {
        let cfg = Config {
            thinking_mode: "merge".to_string(),
            ..Config::default()
        };
        let mut proc = CollectProcessor::new(&cfg, "grok-3", 0);
        proc.process_event(&token("hmm", true));
        proc.process_event(&token("ok", false));

        let msg = proc.finish().choices.remove(0).message.unwrap();
        assert_eq!(msg.content, "<think>\nhmm\n</think>\nok");
        assert!(msg.reasoning_content.is_empty());
    }

    #[test]
    fn images_are_deduped_and_appended() {
        let mut proc = CollectProcessor::new(&Config::default(), "grok-3", 0);
        proc.process_event(&GrokEvent::Image {
            url: "users/x/a.jpg".to_string(),
        });
        proc.process_event(&GrokEvent::Final {
            message: "done".to_string(),
            image_urls: vec!["users/x/a.jpg".to_string()],
        });

        let msg = proc.finish().choices.remove(0).message.unwrap();
        assert_eq!(
            msg.content,
            "done\n\n![image](https://assets.grok.com/users/x/a.jpg)"
        );
    }
}
