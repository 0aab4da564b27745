//! 声明抽取服务 - 业务能力层（第 1 阶段）
//!
//! 一次模型调用得到声明列表及其分类。解析失败时做一次结构修复，
//! 仍失败则整次运行失败（此时还没有声明快照，只能重新开始）。

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::{call_with_timeout, CompletionRequest, ModelProvider};
use crate::config::Config;
use crate::error::ExtractionError;
use crate::models::{Claim, ClaimKind, Complexity, ContentContext, TokenUsage};
use crate::services::json_repair::parse_structured;
use crate::services::prompts::{build_extraction_prompt, EXTRACTION_SYSTEM_PROMPT};

/// 模型未给出置信度时的默认值
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// 抽取结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub claims: Vec<Claim>,
    /// 截断前抽取到的声明总数
    pub total_count: usize,
    /// 因超出上限被排除的声明数
    pub grouped_count: usize,
    pub too_many_claims: bool,
    pub usage: TokenUsage,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    claims: Vec<RawClaim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClaim {
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type", alias = "kind")]
    kind: Option<String>,
    #[serde(default)]
    explicit: Option<bool>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    complexity_confidence: Option<f64>,
    #[serde(default)]
    depends_on: Vec<serde_json::Value>,
}

/// 声明抽取服务
pub struct ExtractionService {
    provider: Arc<dyn ModelProvider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    max_claims: usize,
}

impl ExtractionService {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &Config) -> Self {
        Self {
            provider,
            model: config.llm.extraction_model.clone(),
            max_tokens: config.llm.extraction_max_tokens,
            temperature: config.llm.temperature,
            timeout: config.request_timeout(),
            max_claims: config.pipeline.max_claims,
        }
    }

    /// 抽取声明
    pub async fn extract(
        &self,
        content: &str,
        context: &ContentContext,
        no_cap: bool,
    ) -> Result<ExtractionOutput, ExtractionError> {
        if content.trim().is_empty() {
            return Err(ExtractionError::EmptyContent);
        }

        debug!("开始抽取声明，内容长度: {} 字符, 模型: {}", content.len(), self.model);

        let request = CompletionRequest {
            system_prompt: EXTRACTION_SYSTEM_PROMPT.to_string(),
            user_prompt: build_extraction_prompt(content, context),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            cache_hint: false,
        };

        let completion = call_with_timeout(self.provider.as_ref(), request, self.timeout).await?;
        let raw: RawExtraction = parse_structured(&completion.text)?;

        let claims = normalize_claims(raw.claims);
        let total_count = claims.len();
        let (claims, grouped_count) = apply_claim_cap(claims, self.max_claims, no_cap);

        if grouped_count > 0 {
            warn!(
                "⚠️ 抽取到 {} 条声明，超出上限 {}，保留 {} 条，合并 {} 条",
                total_count,
                self.max_claims,
                claims.len(),
                grouped_count
            );
        }
        info!("✓ 声明抽取完成: {} 条", claims.len());

        Ok(ExtractionOutput {
            claims,
            total_count,
            grouped_count,
            too_many_claims: grouped_count > 0,
            usage: completion.usage(),
            model: self.model.clone(),
        })
    }
}

/// 把模型输出整理为声明：丢弃空文本，按顺序分配 index，重映射依赖关系
fn normalize_claims(raw: Vec<RawClaim>) -> Vec<Claim> {
    let mut position_to_index = HashMap::new();
    let mut kept = Vec::new();

    for (position, item) in raw.into_iter().enumerate() {
        if item.text.trim().is_empty() {
            continue;
        }
        position_to_index.insert(position, kept.len());
        kept.push(item);
    }

    kept.into_iter()
        .enumerate()
        .map(|(index, item)| {
            let depends_on = item
                .depends_on
                .iter()
                .filter_map(|v| v.as_u64())
                .filter_map(|pos| position_to_index.get(&(pos as usize)).copied())
                .filter(|dep| *dep != index);

            Claim {
                index,
                text: item.text.trim().to_string(),
                kind: item
                    .kind
                    .as_deref()
                    .map(ClaimKind::parse_lenient)
                    .unwrap_or(ClaimKind::Interpretive),
                explicit: item.explicit.unwrap_or(true),
                complexity: item
                    .complexity
                    .as_deref()
                    .map(Complexity::parse_lenient)
                    .unwrap_or(Complexity::Moderate),
                complexity_confidence: item
                    .complexity_confidence
                    .filter(|c| c.is_finite())
                    .unwrap_or(DEFAULT_CONFIDENCE)
                    .clamp(0.0, 1.0),
                depends_on: dedup_sorted(depends_on.collect()),
            }
        })
        .collect()
}

/// 超出上限时按（复杂度降序，置信度升序）保留前 N 条，再恢复原始顺序并重新编号
///
/// 返回保留的声明和被排除的数量。
pub fn apply_claim_cap(claims: Vec<Claim>, max_claims: usize, no_cap: bool) -> (Vec<Claim>, usize) {
    if no_cap || claims.len() <= max_claims {
        return (claims, 0);
    }

    let excluded = claims.len() - max_claims;

    let mut ranked = claims;
    ranked.sort_by(|a, b| {
        b.complexity
            .cmp(&a.complexity)
            .then(a.complexity_confidence.total_cmp(&b.complexity_confidence))
            .then(a.index.cmp(&b.index))
    });
    ranked.truncate(max_claims);
    ranked.sort_by_key(|c| c.index);

    let remap: HashMap<usize, usize> = ranked
        .iter()
        .enumerate()
        .map(|(new, claim)| (claim.index, new))
        .collect();

    let kept = ranked
        .into_iter()
        .enumerate()
        .map(|(new_index, mut claim)| {
            claim.depends_on = dedup_sorted(
                claim
                    .depends_on
                    .iter()
                    .filter_map(|old| remap.get(old).copied())
                    .collect(),
            );
            claim.index = new_index;
            claim
        })
        .collect();

    (kept, excluded)
}

fn dedup_sorted(mut values: Vec<usize>) -> Vec<usize> {
    values.sort_unstable();
    values.dedup();
    values
}
