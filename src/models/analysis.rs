//! 单条声明的分析结果

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

/// 分析状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Completed,
    Failed,
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens + rhs.input_tokens,
            self.output_tokens + rhs.output_tokens,
        )
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// 单条声明的分析记录
///
/// 重试时以相同的 `claim_index` 整条替换，`error` 仅在失败时存在。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAnalysis {
    pub claim_index: usize,
    pub status: AnalysisStatus,
    /// 1..10
    pub validity_score: u8,
    /// 1..10
    pub evidence_score: u8,
    #[serde(default)]
    pub fallacies: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub counter_arguments: Vec<String>,
    #[serde(default)]
    pub improvement_notes: String,
    pub model_used: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 模型未给出分数时使用的中间值
pub const DEFAULT_SCORE: u8 = 5;

impl ClaimAnalysis {
    /// 构造失败记录，分数取中间值
    pub fn failed(claim_index: usize, model_used: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            claim_index,
            status: AnalysisStatus::Failed,
            validity_score: DEFAULT_SCORE,
            evidence_score: DEFAULT_SCORE,
            fallacies: Vec::new(),
            assumptions: Vec::new(),
            counter_arguments: Vec::new(),
            improvement_notes: String::new(),
            model_used: model_used.into(),
            usage: TokenUsage::default(),
            error: Some(error.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AnalysisStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == AnalysisStatus::Failed
    }
}

/// 按 `claim_index` 合并分析结果
///
/// `updates` 中的记录覆盖 `prior` 中同 index 的记录（重试替换旧的失败记录），
/// 同一 index 永远只保留一条，输出按 index 升序。
pub fn merge_analyses(
    prior: impl IntoIterator<Item = ClaimAnalysis>,
    updates: impl IntoIterator<Item = ClaimAnalysis>,
) -> Vec<ClaimAnalysis> {
    let mut merged: BTreeMap<usize, ClaimAnalysis> = prior
        .into_iter()
        .map(|record| (record.claim_index, record))
        .collect();

    for record in updates {
        merged.insert(record.claim_index, record);
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(index: usize, validity: u8) -> ClaimAnalysis {
        ClaimAnalysis {
            claim_index: index,
            status: AnalysisStatus::Completed,
            validity_score: validity,
            evidence_score: 5,
            fallacies: vec![],
            assumptions: vec![],
            counter_arguments: vec![],
            improvement_notes: String::new(),
            model_used: "m".into(),
            usage: TokenUsage::new(10, 5),
            error: None,
        }
    }

    #[test]
    fn test_merge_replaces_failed_record_by_index() {
        let prior = vec![
            completed(0, 7),
            ClaimAnalysis::failed(1, "m", "timeout"),
            completed(2, 4),
        ];
        let merged = merge_analyses(prior, vec![completed(1, 9)]);

        assert_eq!(merged.len(), 3);
        assert_eq!(
            merged.iter().map(|a| a.claim_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(merged[1].is_completed());
        assert_eq!(merged[1].validity_score, 9);
    }

    #[test]
    fn test_merge_sorts_out_of_order_updates() {
        let merged = merge_analyses(vec![], vec![completed(3, 1), completed(0, 2)]);
        assert_eq!(merged[0].claim_index, 0);
        assert_eq!(merged[1].claim_index, 3);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::new(1, 2);
        usage += TokenUsage::new(10, 20);
        assert_eq!(usage, TokenUsage::new(11, 22));
        assert_eq!(usage.total(), 33);
    }
}
