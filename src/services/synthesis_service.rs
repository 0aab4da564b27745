//! 综合服务 - 业务能力层（第 3 阶段）
//!
//! 主路径：一次模型调用给出整体结论。
//! 兜底路径：调用失败或结果无法解析时，用确定性公式聚合逐条分数，`used_ai = false`。
//! 致命的模型错误（如鉴权失败）不兜底，直接向上传播。

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clients::{call_with_timeout, CompletionRequest, ModelProvider};
use crate::config::Config;
use crate::error::{ParseError, SynthesisError};
use crate::models::{Claim, ClaimAnalysis, ContentContext, FallacyFinding, Findings, Label, TokenUsage};
use crate::services::json_repair::parse_structured;
use crate::services::prompts::{build_synthesis_prompt, SYNTHESIS_SYSTEM_PROMPT};

/// 固定结果使用的中间分
const NEUTRAL_SCORE: f64 = 0.5;
/// 兜底公式中谬误扣分的上限
const MAX_FALLACY_PENALTY: f64 = 20.0;

/// 综合结果
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    /// 0..1
    pub score: f64,
    pub label: Label,
    pub findings: Findings,
    pub used_ai: bool,
    pub usage: TokenUsage,
    /// 实际调用的模型，未调用时为 `None`
    pub model: Option<String>,
}

impl SynthesisOutput {
    /// 所有声明都分析失败
    pub fn incomplete() -> Self {
        Self::fixed(Label::Incomplete, "所有声明均分析失败，无法给出评价。")
    }

    /// 没有抽取到任何声明
    pub fn no_claims() -> Self {
        Self::fixed(Label::NoClaims, "未在内容中发现可评估的声明。")
    }

    fn fixed(label: Label, summary: &str) -> Self {
        Self {
            score: NEUTRAL_SCORE,
            label,
            findings: Findings {
                summary: summary.to_string(),
                ..Findings::default()
            },
            used_ai: false,
            usage: TokenUsage::default(),
            model: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSynthesis {
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    good_faith_indicators: Vec<String>,
    #[serde(default)]
    fallacies: Vec<FallacyFinding>,
    #[serde(default)]
    manipulative_language: Vec<String>,
    #[serde(default)]
    summary: String,
}

/// 综合服务
pub struct SynthesisService {
    provider: Arc<dyn ModelProvider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl SynthesisService {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &Config) -> Self {
        Self {
            provider,
            model: config.llm.synthesis_model.clone(),
            max_tokens: config.llm.synthesis_max_tokens,
            temperature: config.llm.temperature,
            timeout: config.request_timeout(),
        }
    }

    /// 综合逐条分析结果
    ///
    /// `content` 为 `None` 时（例如只重新综合）提示词中不附原文。
    pub async fn synthesize(
        &self,
        claims: &[Claim],
        analyses: &[ClaimAnalysis],
        content: Option<&str>,
        context: &ContentContext,
    ) -> Result<SynthesisOutput, SynthesisError> {
        if claims.is_empty() {
            return Ok(SynthesisOutput::no_claims());
        }
        if !analyses.iter().any(ClaimAnalysis::is_completed) {
            warn!("⚠️ 没有分析成功的声明，返回 incomplete 结果");
            return Ok(SynthesisOutput::incomplete());
        }

        match self.synthesize_with_model(claims, analyses, content, context).await {
            Ok(output) => {
                info!("✓ 综合完成: {:.2} ({:?})", output.score, output.label);
                Ok(output)
            }
            Err(SynthesisError::Provider(e)) if e.is_fatal() => Err(SynthesisError::Provider(e)),
            Err(e) => {
                warn!("⚠️ 综合调用失败，使用确定性兜底聚合: {}", e);
                Ok(fallback_synthesis(analyses))
            }
        }
    }

    async fn synthesize_with_model(
        &self,
        claims: &[Claim],
        analyses: &[ClaimAnalysis],
        content: Option<&str>,
        context: &ContentContext,
    ) -> Result<SynthesisOutput, SynthesisError> {
        let request = CompletionRequest {
            system_prompt: SYNTHESIS_SYSTEM_PROMPT.to_string(),
            user_prompt: build_synthesis_prompt(claims, analyses, content, context),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            cache_hint: false,
        };

        let completion = call_with_timeout(self.provider.as_ref(), request, self.timeout).await?;
        let raw: RawSynthesis = parse_structured(&completion.text)?;

        let score = raw
            .score
            .filter(|s| s.is_finite())
            .ok_or_else(|| ParseError::new("综合结果缺少 score 字段", &completion.text))?;
        let score = (score / 100.0).clamp(0.0, 1.0);
        let label = raw
            .label
            .as_deref()
            .and_then(Label::parse)
            .unwrap_or_else(|| Label::from_score(score));

        let claim_count = claims.len();
        let fallacies = raw
            .fallacies
            .into_iter()
            .map(|mut f| {
                f.claim_indices.retain(|i| *i < claim_count);
                f
            })
            .collect();

        Ok(SynthesisOutput {
            score,
            label,
            findings: Findings {
                good_faith_indicators: raw.good_faith_indicators,
                fallacies,
                manipulative_language: raw.manipulative_language,
                summary: raw.summary,
            },
            used_ai: true,
            usage: completion.usage(),
            model: Some(self.model.clone()),
        })
    }
}

/// 确定性兜底聚合
///
/// `score = clamp(0, 100, (0.6 * 平均有效性 + 0.4 * 平均证据) * 10 - min(20, 3 * 谬误总数)) / 100`，
/// 只统计分析成功的声明；没有成功的声明时返回 incomplete。
pub fn fallback_synthesis(analyses: &[ClaimAnalysis]) -> SynthesisOutput {
    let completed: Vec<&ClaimAnalysis> = analyses.iter().filter(|a| a.is_completed()).collect();
    if completed.is_empty() {
        return SynthesisOutput::incomplete();
    }

    let count = completed.len() as f64;
    let avg_validity = completed.iter().map(|a| a.validity_score as f64).sum::<f64>() / count;
    let avg_evidence = completed.iter().map(|a| a.evidence_score as f64).sum::<f64>() / count;
    let fallacy_count: usize = completed.iter().map(|a| a.fallacies.len()).sum();

    let penalty = (3.0 * fallacy_count as f64).min(MAX_FALLACY_PENALTY);
    let raw = (0.6 * avg_validity + 0.4 * avg_evidence) * 10.0 - penalty;
    let score = raw.clamp(0.0, 100.0) / 100.0;

    let mut fallacies: Vec<FallacyFinding> = Vec::new();
    for analysis in &completed {
        for name in &analysis.fallacies {
            match fallacies.iter_mut().find(|f| &f.name == name) {
                Some(existing) => existing.claim_indices.push(analysis.claim_index),
                None => fallacies.push(FallacyFinding {
                    name: name.clone(),
                    description: String::new(),
                    claim_indices: vec![analysis.claim_index],
                }),
            }
        }
    }

    SynthesisOutput {
        score,
        label: Label::from_score(score),
        findings: Findings {
            good_faith_indicators: Vec::new(),
            fallacies,
            manipulative_language: Vec::new(),
            summary: format!(
                "基于 {} 条声明的分数聚合：平均有效性 {:.1}/10，平均证据 {:.1}/10，谬误 {} 处。",
                completed.len(),
                avg_validity,
                avg_evidence,
                fallacy_count
            ),
        },
        used_ai: false,
        usage: TokenUsage::default(),
        model: None,
    }
}
