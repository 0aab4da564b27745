//! 流水线最终输出

use serde::{Deserialize, Serialize};

use crate::models::analysis::{ClaimAnalysis, TokenUsage};

/// 综合评级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Exemplary,
    Constructive,
    Neutral,
    Questionable,
    Hostile,
    /// 所有声明都分析失败
    Incomplete,
    /// 没有抽取到任何声明
    NoClaims,
}

impl Label {
    /// 按固定分数段（0..1）给出评级
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Label::Exemplary
        } else if score >= 0.6 {
            Label::Constructive
        } else if score >= 0.4 {
            Label::Neutral
        } else if score >= 0.2 {
            Label::Questionable
        } else {
            Label::Hostile
        }
    }

    /// 解析模型给出的评级；无法识别时返回 `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exemplary" => Some(Label::Exemplary),
            "constructive" => Some(Label::Constructive),
            "neutral" => Some(Label::Neutral),
            "questionable" => Some(Label::Questionable),
            "hostile" => Some(Label::Hostile),
            _ => None,
        }
    }
}

/// 谬误发现
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallacyFinding {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub claim_indices: Vec<usize>,
}

/// 结构化发现
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Findings {
    #[serde(default)]
    pub good_faith_indicators: Vec<String>,
    #[serde(default)]
    pub fallacies: Vec<FallacyFinding>,
    #[serde(default)]
    pub manipulative_language: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// 最终结果
///
/// `used_ai` 只在综合阶段通过模型调用成功时为 true；走确定性兜底时为 false。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub subject_id: String,
    pub session_id: String,
    /// 0..1
    pub score: f64,
    pub label: Label,
    pub findings: Findings,
    /// 按 claim_index 排序的逐条分析
    pub claims: Vec<ClaimAnalysis>,
    pub claims_analyzed: usize,
    pub claims_total: usize,
    /// 超出上限被合并掉的声明数
    pub grouped_count: usize,
    pub usage: TokenUsage,
    pub estimated_cost_usd: f64,
    pub used_ai: bool,
}
