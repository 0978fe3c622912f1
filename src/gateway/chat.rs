//! 请求编排：预占 token -> 调上游 -> 失败换 token 重试 -> 交给翻译层。

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::common::extract::{merge_messages, message_texts};
use crate::gateway::openai::collect::CollectProcessor;
use crate::gateway::openai::stream::{StreamProcessor, sse_error_events};
use crate::gateway::openai::types::{ChatCompletion, ChatRequest};
use crate::grok::client::{ChatPayload, ChatUpstream, LineStream};
use crate::grok::event::parse_line;
use crate::grok::model::ModelService;
use crate::stats::RequestStats;
use crate::token::TokenManager;
use crate::util::tokens;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// 一次完成请求的产物：SSE 行流或完整响应体。
#[derive(Debug)]
pub enum CompletionOutput {
    Stream(ReceiverStream<String>),
    Full(Box<ChatCompletion>),
}

pub struct ChatService {
    cfg: Config,
    manager: Arc<TokenManager>,
    upstream: Arc<dyn ChatUpstream>,
    stats: Arc<RequestStats>,
}

impl ChatService {
    pub fn new(
        cfg: Config,
        manager: Arc<TokenManager>,
        upstream: Arc<dyn ChatUpstream>,
        stats: Arc<RequestStats>,
    ) -> Self {
        Self {
            cfg,
            manager,
            upstream,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<RequestStats> {
        &self.stats
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    /// 编排一次对话补全。校验失败立即返回，不消耗 token。
    pub async fn completions(&self, req: &ChatRequest) -> Result<CompletionOutput, AppError> {
        let Some(info) = ModelService::get(&req.model) else {
            return Err(AppError::validation(format!("未知模型: {}", req.model)));
        };
        let model_id = info.model_id.to_string();

        let message = merge_messages(&req.messages);
        if message.is_empty() {
            return Err(AppError::validation("messages 为空"));
        }
        let prompt_tokens = tokens::count_prompt_tokens(&message_texts(&req.messages));

        let think = match req.thinking.as_deref() {
            Some("enabled") => true,
            Some("disabled") => false,
            _ => info.is_reasoning,
        };
        let payload = ChatPayload {
            message,
            model: info.upstream_model.to_string(),
            mode: info.model_mode.to_string(),
            think,
        };

        self.manager.reload_if_stale().await;

        let (token, reservation_id, stream) = match self.acquire_stream(&model_id, &payload).await {
            Ok(v) => v,
            Err(e) => {
                self.stats.record(&model_id, false).await;
                return Err(e);
            }
        };

        let stream_mode = req.stream.unwrap_or(self.cfg.stream_default);
        if stream_mode {
            Ok(CompletionOutput::Stream(self.pump_stream(
                model_id,
                token,
                reservation_id,
                prompt_tokens,
                stream,
            )))
        } else {
            self.collect(model_id, token, reservation_id, prompt_tokens, stream)
                .await
                .map(|c| CompletionOutput::Full(Box::new(c)))
        }
    }

    /// 预占 + 上游握手，失败则排除该 token 换下一个，线性退避。
    ///
    /// 任何非成功状态都触发切换重试，不做状态码白名单。
    async fn acquire_stream(
        &self,
        model_id: &str,
        payload: &ChatPayload,
    ) -> Result<(String, String, LineStream), AppError> {
        let mut exclude: HashSet<String> = HashSet::new();
        let mut last_err: Option<AppError> = None;

        for attempt in 0..=self.cfg.retry_max_attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF_STEP * attempt as u32).await;
            }

            let Some((token, reservation_id)) =
                self.manager.reserve_token_for_model(model_id, &exclude).await
            else {
                break;
            };

            match self.upstream.chat(&token, payload).await {
                Ok(stream) => return Ok((token, reservation_id, stream)),
                Err(e) => {
                    let status = e.status().unwrap_or(0);
                    self.manager
                        .release_token_reservation(&token, &reservation_id)
                        .await;
                    self.manager.record_fail(&token, status, &e.to_string()).await;
                    exclude.insert(token);
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::warn!(
                        model = model_id,
                        attempt,
                        status,
                        "上游对话请求失败，切换 token 重试: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(AppError::RateLimited))
    }

    /// 流式输出：泵任务独立于客户端连接运行，
    /// 正常结束、上游出错、客户端断开都保证释放预占并记录统计。
    fn pump_stream(
        &self,
        model_id: String,
        token: String,
        reservation_id: String,
        prompt_tokens: u32,
        mut stream: LineStream,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel::<String>(64);
        let mut processor = StreamProcessor::new(&self.cfg, &model_id, prompt_tokens);
        let manager = Arc::clone(&self.manager);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let mut disconnected = false;
            let mut upstream_err: Option<AppError> = None;

            'recv: while let Some(item) = stream.next().await {
                match item {
                    Ok(line) => {
                        let Some(ev) = parse_line(&line) else { continue };
                        for chunk in processor.process_event(&ev) {
                            if tx.send(chunk).await.is_err() {
                                disconnected = true;
                                break 'recv;
                            }
                        }
                    }
                    Err(e) => {
                        upstream_err = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = upstream_err {
                tracing::warn!(model = model_id, "流式响应中断: {e}");
                for ev in sse_error_events(&e.to_string()) {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
                stats.record(&model_id, false).await;
            } else if disconnected {
                stats.record(&model_id, false).await;
            } else {
                for chunk in processor.finish() {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                manager.sync_usage(&token, &model_id, true, true).await;
                stats.record(&model_id, true).await;
            }

            manager.release_token_reservation(&token, &reservation_id).await;
        });

        ReceiverStream::new(rx)
    }

    /// 聚合输出。收集在独立任务里进行，调用方被取消也不会遗留预占。
    async fn collect(
        &self,
        model_id: String,
        token: String,
        reservation_id: String,
        prompt_tokens: u32,
        mut stream: LineStream,
    ) -> Result<ChatCompletion, AppError> {
        let mut processor = CollectProcessor::new(&self.cfg, &model_id, prompt_tokens);
        let manager = Arc::clone(&self.manager);
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            let mut result: Result<(), AppError> = Ok(());
            while let Some(item) = stream.next().await {
                match item {
                    Ok(line) => {
                        if let Some(ev) = parse_line(&line) {
                            processor.process_event(&ev);
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }

            match result {
                Ok(()) => {
                    manager.sync_usage(&token, &model_id, true, true).await;
                    stats.record(&model_id, true).await;
                    manager.release_token_reservation(&token, &reservation_id).await;
                    Ok(processor.finish())
                }
                Err(e) => {
                    stats.record(&model_id, false).await;
                    manager.release_token_reservation(&token, &reservation_id).await;
                    Err(e)
                }
            }
        });

        handle
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("聚合任务异常退出: {e}")))?
    }
}
