//! LLM 客户端 - 基础设施层
//!
//! 流水线只依赖 `ModelProvider` 这一能力接口：
//! `complete(system, user, {model, max_tokens, temperature, cache_hint}) -> {text, tokens}`。
//! 默认实现基于 `async-openai`，兼容任何 OpenAI API 风格的服务。

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ProviderError;
use crate::models::TokenUsage;

/// 一次模型调用的请求
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// system prompt 是跨调用共享的稳定前缀，可被服务端缓存
    pub cache_hint: bool,
}

/// 一次模型调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Completion {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// 模型能力接口
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;
}

/// 带超时的模型调用
///
/// 超时只作为本次调用的失败返回，由调用方决定是否影响整次运行。
pub async fn call_with_timeout(
    provider: &dyn ModelProvider,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<Completion, ProviderError> {
    let model = request.model.clone();
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("⏱️ 模型调用超时: {} ({} 秒)", model, timeout.as_secs());
            Err(ProviderError::Timeout {
                model,
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

/// OpenAI 兼容服务的实现
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// 创建新的客户端
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm.api_key)
            .with_api_base(&config.llm.api_base_url);

        Self {
            client: Client::with_config(openai_config),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        debug!(
            "调用 LLM API，模型: {}, 用户消息长度: {} 字符, 可缓存: {}",
            request.model,
            request.user_prompt.len(),
            request.cache_hint
        );

        let model = request.model.clone();
        let build_err = |e: async_openai::error::OpenAIError| ProviderError::Fatal {
            model: model.clone(),
            message: format!("请求构建失败: {}", e),
        };

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_prompt.as_str())
            .build()
            .map_err(build_err)?;
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(request.user_prompt.as_str())
            .build()
            .map_err(build_err)?;

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| classify_error(&request.model, &e.to_string()))?;

        debug!("LLM API 调用成功");

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::EmptyResponse {
                model: request.model.clone(),
            })?;

        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));

        Ok(Completion {
            text: text.trim().to_string(),
            input_tokens,
            output_tokens,
        })
    }
}

/// 根据错误信息区分瞬时错误和致命错误
///
/// 鉴权、权限、模型不存在、参数非法属于致命错误，其余（限流、网络、5xx）视为瞬时错误。
pub fn classify_error(model: &str, message: &str) -> ProviderError {
    const FATAL_MARKERS: [&str; 8] = [
        "401",
        "403",
        "invalid_api_key",
        "incorrect api key",
        "unauthorized",
        "authentication",
        "permission",
        "model_not_found",
    ];

    let lowered = message.to_ascii_lowercase();
    if FATAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        warn!("❌ LLM API 致命错误 (模型: {}): {}", model, message);
        ProviderError::Fatal {
            model: model.to_string(),
            message: message.to_string(),
        }
    } else {
        warn!("⚠️ LLM API 调用失败 (模型: {}): {}", model, message);
        ProviderError::Transient {
            model: model.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProvider;

    #[async_trait]
    impl ModelProvider for SlowProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ProviderError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Completion {
                text: "late".into(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "s".into(),
            user_prompt: "u".into(),
            model: "m".into(),
            max_tokens: 10,
            temperature: 0.0,
            cache_hint: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported_as_item_failure() {
        let err = call_with_timeout(&SlowProvider, request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Timeout {
                model: "m".into(),
                timeout_secs: 5
            }
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classify_error() {
        assert!(classify_error("m", "status 401: Incorrect API key provided").is_fatal());
        assert!(!classify_error("m", "429 rate limit exceeded").is_fatal());
        assert!(!classify_error("m", "connection reset by peer").is_fatal());
    }
}
