//! 单条声明分析服务 - 业务能力层（第 2 阶段）
//!
//! 只负责"分析一条声明"，不关心批次、会话和进度。
//! 模型由路由决定；解析宽松：缺失的分数取中间值，越界的分数截断到 1..10。

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clients::{call_with_timeout, CompletionRequest, ModelProvider};
use crate::config::Config;
use crate::error::{ClaimAnalysisError, ClaimAnalysisErrorKind, ParseError};
use crate::models::analysis::DEFAULT_SCORE;
use crate::models::{AnalysisStatus, Claim, ClaimAnalysis, ContentContext, TokenUsage};
use crate::services::json_repair::parse_structured;
use crate::services::model_router::{route, RoutingThresholds, TierModels};
use crate::services::prompts::{build_analysis_prompt_cached, build_analysis_prompt_full};

/// 声明分析服务
pub struct ClaimAnalysisService {
    provider: Arc<dyn ModelProvider>,
    tier_models: TierModels,
    thresholds: RoutingThresholds,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    prompt_caching: bool,
}

impl ClaimAnalysisService {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &Config) -> Self {
        Self {
            provider,
            tier_models: config.tier_models(),
            thresholds: config.routing_thresholds(),
            max_tokens: config.llm.analysis_max_tokens,
            temperature: config.llm.temperature,
            timeout: config.request_timeout(),
            prompt_caching: config.pipeline.prompt_caching,
        }
    }

    /// 多于一条声明时才值得使用共享前缀提示词
    pub fn uses_cached_prompt(&self, claim_count: usize) -> bool {
        self.prompt_caching && claim_count > 1
    }

    /// 分析单条声明
    ///
    /// `dependencies` 是该声明依赖的前提声明，会一并放进提示词；
    /// `claim_count` 是本次运行的声明总数。
    pub async fn analyze(
        &self,
        claim: &Claim,
        dependencies: &[&Claim],
        content: &str,
        context: &ContentContext,
        claim_count: usize,
    ) -> Result<ClaimAnalysis, ClaimAnalysisError> {
        let route = route(claim, &self.thresholds, &self.tier_models);
        debug!(
            "声明 #{} 路由: {} -> {} (升档: {})",
            claim.index,
            claim.complexity,
            route.model,
            route.escalated
        );

        let cached = self.uses_cached_prompt(claim_count);
        let (system_prompt, user_prompt) = if cached {
            build_analysis_prompt_cached(claim, dependencies, content, context)
        } else {
            build_analysis_prompt_full(claim, dependencies, content, context)
        };

        let request = CompletionRequest {
            system_prompt,
            user_prompt,
            model: route.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            cache_hint: cached,
        };

        let fail = |kind, usage| ClaimAnalysisError {
            claim_index: claim.index,
            model: route.model.clone(),
            kind,
            usage,
        };

        let completion = call_with_timeout(self.provider.as_ref(), request, self.timeout)
            .await
            .map_err(|e| fail(ClaimAnalysisErrorKind::Provider(e), TokenUsage::default()))?;
        let usage = completion.usage();

        let value: Value = parse_structured(&completion.text)
            .map_err(|e| fail(ClaimAnalysisErrorKind::Parse(e), usage))?;

        analysis_from_value(claim.index, &route.model, &value, usage)
            .map_err(|e| fail(ClaimAnalysisErrorKind::Parse(e), usage))
    }
}

/// 从模型输出构建分析记录
fn analysis_from_value(
    claim_index: usize,
    model: &str,
    value: &Value,
    usage: TokenUsage,
) -> Result<ClaimAnalysis, ParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::new("分析结果不是 JSON 对象", &value.to_string()))?;

    Ok(ClaimAnalysis {
        claim_index,
        status: AnalysisStatus::Completed,
        validity_score: score_field(obj.get("validityScore")),
        evidence_score: score_field(obj.get("evidenceScore")),
        fallacies: string_list(obj.get("fallacies")),
        assumptions: string_list(obj.get("assumptions")),
        counter_arguments: string_list(obj.get("counterArguments")),
        improvement_notes: obj
            .get("improvementNotes")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        model_used: model.to_string(),
        usage,
        error: None,
    })
}

/// 分数：接受数字或数字字符串，四舍五入后截断到 1..10
fn score_field(value: Option<&Value>) -> u8 {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match number {
        Some(n) if n.is_finite() => n.round().clamp(1.0, 10.0) as u8,
        _ => DEFAULT_SCORE,
    }
}

/// 字符串列表：单个字符串视为一项，对象取 `name` 字段
fn string_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(v @ Value::String(_)) => vec![v],
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => map.get("name").and_then(Value::as_str).map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}
