//! AI网关
//!
//! 对上层暴露统一的 (system_prompt, user_prompt) -> 响应文本 接口，
//! 隐藏提供商方言差异。支持两类方言：OpenAI兼容的chat-completions
//! （DeepSeek/Qwen/ChatGPT/自定义端点）与Assistant/Thread接口。
//! 内置最多5次的指数退避重试，仅重试瞬时网络错误与5xx。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::trading::config::{LlmProfile, LlmProvider};

/// 单次调用超时
const CALL_TIMEOUT: Duration = Duration::from_secs(120);
/// 最大重试次数
const MAX_RETRIES: u32 = 5;
/// 重试等待上限
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// 响应token数默认上限（可用AI_MAX_TOKENS覆盖）
const DEFAULT_MAX_TOKENS: u32 = 2000;
/// Assistant运行状态轮询间隔
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// AI调用接口；测试注入fake实现
#[async_trait]
pub trait LlmApi: Send + Sync {
    async fn call_with_messages(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AppError>;
}

/// 从环境变量读取响应token上限
fn max_tokens_from_env() -> u32 {
    match std::env::var("AI_MAX_TOKENS") {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(v) if v > 0 => {
                info!("使用环境变量 AI_MAX_TOKENS: {}", v);
                v
            }
            _ => {
                warn!("环境变量 AI_MAX_TOKENS 无效 ({})，使用默认值: {}", raw, DEFAULT_MAX_TOKENS);
                DEFAULT_MAX_TOKENS
            }
        },
        Err(_) => DEFAULT_MAX_TOKENS,
    }
}

pub struct LlmClient {
    provider: LlmProvider,
    api_key: String,
    model: String,
    base_url: String,
    /// base_url已是完整地址，不追加/chat/completions
    use_full_url: bool,
    max_tokens: u32,
    assistant_id: Option<String>,
    thread_id: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn from_profile(profile: &LlmProfile) -> Self {
        let (base_url, use_full_url) = match &profile.base_url {
            Some(url) if url.ends_with('#') => (url.trim_end_matches('#').to_string(), true),
            Some(url) => (url.clone(), false),
            None => ("https://api.deepseek.com/v1".to_string(), false),
        };
        Self {
            provider: profile.provider,
            api_key: profile.api_key.clone(),
            model: profile.model.clone(),
            base_url,
            use_full_url,
            max_tokens: max_tokens_from_env(),
            assistant_id: profile.assistant_id.clone(),
            thread_id: profile.thread_id.clone(),
            client: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .expect("构建HTTP客户端失败"),
        }
    }

    async fn call_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AppError> {
        match self.provider {
            LlmProvider::ChatCompletions => self.call_chat_completions(system_prompt, user_prompt).await,
            LlmProvider::Assistant => self.call_assistant(system_prompt, user_prompt).await,
        }
    }

    async fn call_chat_completions(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AppError> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.push(json!({"role": "user", "content": user_prompt}));

        let body = json!({
            "model": self.model,
            "messages": messages,
            // 较低temperature提高JSON格式稳定性
            "temperature": 0.5,
            "max_tokens": self.max_tokens,
        });

        let url = if self.use_full_url {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        };
        debug!("AI请求: model={}, url={}", self.model, url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LlmError(format!("发送请求失败: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AppError::LlmError(format!("读取响应失败: {}", e)))?;
        if !status.is_success() {
            return Err(AppError::LlmError(format!(
                "API返回错误 (status {}): {}",
                status.as_u16(),
                text
            )));
        }

        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChoiceMessage {
            content: String,
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| AppError::LlmError(format!("解析响应失败: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::LlmError("API返回空响应".to_string()))
    }

    /// Assistant/Thread方言：建线程（或复用固定thread）→ 运行 → 轮询 → 取最新回复
    async fn call_assistant(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AppError> {
        let assistant_id = self
            .assistant_id
            .as_deref()
            .ok_or_else(|| AppError::LlmError("Assistant ID 未设置".to_string()))?;

        // Assistant的instructions在平台侧配置，system prompt拼进消息正文
        let message_content = if system_prompt.is_empty() {
            user_prompt.to_string()
        } else {
            format!(
                "System Instructions: {}\n\nUser Request: {}",
                system_prompt, user_prompt
            )
        };

        let thread_id = match &self.thread_id {
            Some(id) => {
                // 复用现有thread，追加消息
                self.assistant_post(
                    &format!("threads/{}/messages", id),
                    json!({"role": "user", "content": message_content}),
                )
                .await?;
                debug!("Assistant 向现有Thread添加消息: {}", id);
                id.clone()
            }
            None => {
                let created = self
                    .assistant_post(
                        "threads",
                        json!({"messages": [{"role": "user", "content": message_content}]}),
                    )
                    .await?;
                let id = created["id"]
                    .as_str()
                    .ok_or_else(|| AppError::LlmError("创建Thread响应缺少id".to_string()))?
                    .to_string();
                debug!("Assistant 创建新Thread: {}", id);
                id
            }
        };

        let run = self
            .assistant_post(
                &format!("threads/{}/runs", thread_id),
                json!({"assistant_id": assistant_id}),
            )
            .await?;
        let run_id = run["id"]
            .as_str()
            .ok_or_else(|| AppError::LlmError("创建Run响应缺少id".to_string()))?
            .to_string();

        // 轮询Run状态，留10秒缓冲给读消息
        let deadline = tokio::time::Instant::now() + CALL_TIMEOUT - Duration::from_secs(10);
        loop {
            let status_resp = self
                .assistant_get(&format!("threads/{}/runs/{}", thread_id, run_id))
                .await?;
            match status_resp["status"].as_str().unwrap_or("") {
                "completed" => break,
                "failed" | "cancelled" | "expired" => {
                    return Err(AppError::LlmError(format!(
                        "Run失败或取消: {}",
                        status_resp["status"]
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::LlmError("等待Run完成超时".to_string()));
            }
            tokio::time::sleep(RUN_POLL_INTERVAL).await;
        }

        // 按时间倒序取第一条assistant消息
        let messages = self
            .assistant_get(&format!(
                "threads/{}/messages?order=desc&limit=10",
                thread_id
            ))
            .await?;
        let empty = Vec::new();
        for message in messages["data"].as_array().unwrap_or(&empty) {
            if message["role"].as_str() != Some("assistant") {
                continue;
            }
            for content in message["content"].as_array().unwrap_or(&empty) {
                if content["type"].as_str() == Some("text") {
                    if let Some(value) = content["text"]["value"].as_str() {
                        if !value.is_empty() {
                            return Ok(value.to_string());
                        }
                    }
                }
            }
        }
        Err(AppError::LlmError("未找到Assistant的回复".to_string()))
    }

    async fn assistant_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LlmError(format!("发送请求失败: {}", e)))?;
        Self::read_assistant_response(resp, path).await
    }

    async fn assistant_get(&self, path: &str) -> Result<serde_json::Value, AppError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await
            .map_err(|e| AppError::LlmError(format!("发送请求失败: {}", e)))?;
        Self::read_assistant_response(resp, path).await
    }

    async fn read_assistant_response(
        resp: reqwest::Response,
        path: &str,
    ) -> Result<serde_json::Value, AppError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AppError::LlmError(format!("读取响应失败: {}", e)))?;
        if !status.is_success() {
            return Err(AppError::LlmError(format!(
                "API返回错误 (status {}, path {}): {}",
                status.as_u16(),
                path,
                text
            )));
        }
        serde_json::from_str(&text).map_err(|e| AppError::LlmError(format!("解析响应失败: {}", e)))
    }
}

/// 判断错误是否可重试：瞬时网络故障、超时、5xx、408/429
fn is_retryable_error(err: &AppError) -> bool {
    let msg = err.to_string().to_lowercase();
    const RETRYABLE: &[&str] = &[
        "eof",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "connection closed",
        "broken pipe",
        "temporary failure",
        "no such host",
        "dns",
        "stream error",
        "internal_error",
        "network is unreachable",
        "status 500",
        "status 502",
        "status 503",
        "status 504",
        "status 408",
        "status 429",
    ];
    RETRYABLE.iter().any(|pattern| msg.contains(pattern))
}

#[async_trait]
impl LlmApi for LlmClient {
    async fn call_with_messages(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, AppError> {
        if self.api_key.is_empty() {
            return Err(AppError::LlmError("AI API密钥未设置".to_string()));
        }

        let mut last_err = AppError::LlmError("未调用".to_string());
        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                warn!("AI API调用失败，正在重试 ({}/{})...", attempt, MAX_RETRIES);
            }
            match self.call_once(system_prompt, user_prompt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("AI API重试成功");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !is_retryable_error(&e) {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
            if attempt < MAX_RETRIES {
                // 指数退避：2s, 4s, 8s, 16s，上限30s
                let wait =
                    Duration::from_secs(2u64.saturating_mul(1 << (attempt - 1))).min(MAX_BACKOFF);
                debug!("等待{:?}后重试", wait);
                tokio::time::sleep(wait).await;
            }
        }
        Err(AppError::LlmError(format!(
            "重试{}次后仍然失败: {}",
            MAX_RETRIES, last_err
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_error(&AppError::LlmError(
            "发送请求失败: connection reset by peer".to_string()
        )));
        assert!(is_retryable_error(&AppError::LlmError(
            "API返回错误 (status 503): overloaded".to_string()
        )));
        assert!(is_retryable_error(&AppError::LlmError(
            "API返回错误 (status 429): rate limited".to_string()
        )));
        // 4xx（非408/429）不重试
        assert!(!is_retryable_error(&AppError::LlmError(
            "API返回错误 (status 401): bad key".to_string()
        )));
        assert!(!is_retryable_error(&AppError::LlmError(
            "AI API密钥未设置".to_string()
        )));
    }

    #[test]
    fn test_full_url_suffix_handling() {
        let profile = LlmProfile {
            provider: LlmProvider::ChatCompletions,
            api_key: "k".to_string(),
            model: "m".to_string(),
            base_url: Some("https://example.com/v1/custom#".to_string()),
            assistant_id: None,
            thread_id: None,
        };
        let client = LlmClient::from_profile(&profile);
        assert!(client.use_full_url);
        assert_eq!(client.base_url, "https://example.com/v1/custom");
    }
}
