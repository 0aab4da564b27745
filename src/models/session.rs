//! 分析会话（检查点）模型
//!
//! 状态机：`not_started → in_progress(pass=1|2|3) → {completed, failed, abandoned}`。
//! 运行中 `current_pass` 只增不减；`claims_completed + claims_failed ≤ total_claims`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionError;
use crate::models::claim::{Claim, ContentContext};

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Pass {
    /// 第 1 阶段：声明抽取
    Extraction = 1,
    /// 第 2 阶段：逐条分析
    Analysis = 2,
    /// 第 3 阶段：综合
    Synthesis = 3,
}

impl Pass {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Pass::Extraction => "extraction",
            Pass::Analysis => "analysis",
            Pass::Synthesis => "synthesis",
        }
    }
}

impl From<Pass> for u8 {
    fn from(pass: Pass) -> u8 {
        pass.number()
    }
}

impl TryFrom<u8> for Pass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Pass::Extraction),
            2 => Ok(Pass::Analysis),
            3 => Ok(Pass::Synthesis),
            other => Err(format!("未知阶段: {}", other)),
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass{}({})", self.number(), self.name())
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "abandoned" => Some(SessionStatus::Abandoned),
            _ => None,
        }
    }
}

/// 一次运行的检查点记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSession {
    pub id: String,
    pub subject_id: String,
    pub status: SessionStatus,
    pub current_pass: Pass,
    /// 第 1 阶段成功后写入，之后不再修改
    pub extracted_claims: Option<Vec<Claim>>,
    pub total_claims: usize,
    pub claims_completed: usize,
    pub claims_failed: usize,
    pub last_batch_index: Option<usize>,
    pub content_hash: String,
    #[serde(default)]
    pub context: ContentContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_phase: Option<Pass>,
}

impl AnalysisSession {
    /// 新建会话，处于第 1 阶段
    pub fn new(subject_id: impl Into<String>, content_hash: impl Into<String>, context: ContentContext) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            status: SessionStatus::InProgress,
            current_pass: Pass::Extraction,
            extracted_claims: None,
            total_claims: 0,
            claims_completed: 0,
            claims_failed: 0,
            last_batch_index: None,
            content_hash: content_hash.into(),
            context,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
            error_phase: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == SessionStatus::InProgress
    }

    /// 有声明快照才能从第 2 / 3 阶段恢复
    pub fn has_snapshot(&self) -> bool {
        self.extracted_claims.is_some() && self.current_pass >= Pass::Analysis
    }

    pub fn processed(&self) -> usize {
        self.claims_completed + self.claims_failed
    }

    pub fn unprocessed(&self) -> usize {
        self.total_claims.saturating_sub(self.processed())
    }

    /// 推进到下一阶段，不允许回退
    pub fn advance_to(&mut self, pass: Pass) -> Result<(), SessionError> {
        if !self.is_in_progress() || pass < self.current_pass {
            return Err(SessionError::InvalidTransition {
                from: self.current_pass,
                to: pass,
            });
        }
        self.current_pass = pass;
        self.touch();
        Ok(())
    }

    /// 第 1 阶段成功：写入声明快照并进入第 2 阶段
    pub fn store_snapshot(&mut self, claims: Vec<Claim>) -> Result<(), SessionError> {
        self.advance_to(Pass::Analysis)?;
        self.total_claims = claims.len();
        self.extracted_claims = Some(claims);
        self.claims_completed = 0;
        self.claims_failed = 0;
        self.last_batch_index = None;
        Ok(())
    }

    /// 批次完成后更新计数和批次号
    pub fn record_progress(&mut self, completed: usize, failed: usize, batch_index: usize) {
        self.record_counts(completed, failed);
        self.last_batch_index = Some(batch_index);
    }

    /// 只更新计数，计数总和不超过声明总数
    pub fn record_counts(&mut self, completed: usize, failed: usize) {
        let completed = completed.min(self.total_claims);
        let failed = failed.min(self.total_claims - completed);
        self.claims_completed = completed;
        self.claims_failed = failed;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, phase: Pass, message: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error_phase = Some(phase);
        self.error_message = Some(message.into());
        self.touch();
    }

    pub fn mark_abandoned(&mut self) {
        self.status = SessionStatus::Abandoned;
        self.touch();
    }

    /// 恢复时重新打开会话，可从失败状态回到运行中
    pub fn reopen(&mut self, pass: Pass) {
        self.status = SessionStatus::InProgress;
        self.current_pass = pass;
        self.error_message = None;
        self.error_phase = None;
        self.completed_at = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
