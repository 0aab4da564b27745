//! 恢复决策 - 流程层
//!
//! `resume_actions` 是纯函数：只看会话的状态、阶段和计数。
//! 返回顺序固定为 continue, retry_failed, resynthesize, start_fresh。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{AnalysisSession, Pass, SessionStatus};

/// 恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    /// 只处理尚未处理的声明
    Continue,
    /// 重新处理失败的和尚未处理的声明
    RetryFailed,
    /// 只重新执行第 3 阶段
    Resynthesize,
    /// 新建会话，从第 1 阶段开始
    StartFresh,
}

impl ResumeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeAction::Continue => "continue",
            ResumeAction::RetryFailed => "retry_failed",
            ResumeAction::Resynthesize => "resynthesize",
            ResumeAction::StartFresh => "start_fresh",
        }
    }
}

impl fmt::Display for ResumeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计算当前会话允许的恢复动作
pub fn resume_actions(
    status: SessionStatus,
    current_pass: Pass,
    claims_completed: usize,
    claims_failed: usize,
    total_claims: usize,
) -> Vec<ResumeAction> {
    let processed = claims_completed + claims_failed;
    let unprocessed = total_claims.saturating_sub(processed);

    let mut continue_ok = false;
    let mut retry_ok = false;
    let mut resynthesize_ok = false;

    match (status, current_pass) {
        // 第 1 阶段没有声明快照，无法恢复
        (SessionStatus::InProgress, Pass::Extraction) => {}
        (SessionStatus::InProgress, Pass::Analysis) => {
            continue_ok = unprocessed > 0;
            resynthesize_ok = unprocessed == 0;
            retry_ok = claims_failed > 0;
        }
        (SessionStatus::InProgress, Pass::Synthesis) => {
            resynthesize_ok = true;
        }
        // 失败但已有声明快照：允许重试和重新综合
        (SessionStatus::Failed, Pass::Analysis | Pass::Synthesis) => {
            retry_ok = claims_failed > 0 || unprocessed > 0;
            resynthesize_ok = claims_completed > 0;
        }
        (SessionStatus::Failed, Pass::Extraction)
        | (SessionStatus::Completed, _)
        | (SessionStatus::Abandoned, _) => {}
    }

    let mut actions = Vec::with_capacity(4);
    if continue_ok {
        actions.push(ResumeAction::Continue);
    }
    if retry_ok {
        actions.push(ResumeAction::RetryFailed);
    }
    if resynthesize_ok {
        actions.push(ResumeAction::Resynthesize);
    }
    actions.push(ResumeAction::StartFresh);
    actions
}

/// 会话的恢复动作；没有会话时只能重新开始
pub fn actions_for(session: Option<&AnalysisSession>) -> Vec<ResumeAction> {
    match session {
        Some(s) => resume_actions(
            s.status,
            s.current_pass,
            s.claims_completed,
            s.claims_failed,
            s.total_claims,
        ),
        None => vec![ResumeAction::StartFresh],
    }
}

/// 状态查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub subject_id: String,
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    /// 当前阶段（1..3），没有会话时为空
    pub phase: Option<Pass>,
    pub resume_actions: Vec<ResumeAction>,
    pub claims_total: usize,
    pub claims_completed: usize,
    pub claims_failed: usize,
    pub error_message: Option<String>,
}

impl StatusReport {
    pub fn new(subject_id: &str, session: Option<&AnalysisSession>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            session_id: session.map(|s| s.id.clone()),
            status: session.map(|s| s.status),
            phase: session.map(|s| s.current_pass),
            resume_actions: actions_for(session),
            claims_total: session.map_or(0, |s| s.total_claims),
            claims_completed: session.map_or(0, |s| s.claims_completed),
            claims_failed: session.map_or(0, |s| s.claims_failed),
            error_message: session.and_then(|s| s.error_message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResumeAction::*;

    #[test]
    fn test_no_session() {
        assert_eq!(actions_for(None), vec![StartFresh]);
    }

    #[test]
    fn test_pass1_offers_only_fresh_start() {
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Extraction, 0, 0, 0),
            vec![StartFresh]
        );
    }

    #[test]
    fn test_pass2_with_unprocessed_claims() {
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Analysis, 2, 2, 6),
            vec![Continue, RetryFailed, StartFresh]
        );
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Analysis, 2, 0, 6),
            vec![Continue, StartFresh]
        );
    }

    #[test]
    fn test_pass2_fully_drained() {
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Analysis, 4, 2, 6),
            vec![RetryFailed, Resynthesize, StartFresh]
        );
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Analysis, 6, 0, 6),
            vec![Resynthesize, StartFresh]
        );
    }

    #[test]
    fn test_pass3_and_terminal_states() {
        assert_eq!(
            resume_actions(SessionStatus::InProgress, Pass::Synthesis, 3, 0, 3),
            vec![Resynthesize, StartFresh]
        );
        assert_eq!(
            resume_actions(SessionStatus::Completed, Pass::Synthesis, 3, 0, 3),
            vec![StartFresh]
        );
        assert_eq!(
            resume_actions(SessionStatus::Abandoned, Pass::Analysis, 1, 0, 3),
            vec![StartFresh]
        );
    }

    #[test]
    fn test_failed_session_with_partial_data() {
        assert_eq!(
            resume_actions(SessionStatus::Failed, Pass::Analysis, 2, 1, 5),
            vec![RetryFailed, Resynthesize, StartFresh]
        );
        assert_eq!(
            resume_actions(SessionStatus::Failed, Pass::Extraction, 0, 0, 0),
            vec![StartFresh]
        );
    }

    #[test]
    fn test_always_subset_and_deterministic() {
        let statuses = [
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Abandoned,
        ];
        let passes = [Pass::Extraction, Pass::Analysis, Pass::Synthesis];
        for status in statuses {
            for pass in passes {
                for completed in 0..4 {
                    for failed in 0..(4 - completed) {
                        let a = resume_actions(status, pass, completed, failed, 3);
                        let b = resume_actions(status, pass, completed, failed, 3);
                        assert_eq!(a, b);
                        assert_eq!(a.last(), Some(&StartFresh));
                        assert!(a.len() <= 4);
                    }
                }
            }
        }
    }

    #[test]
    fn test_action_serialization() {
        assert_eq!(serde_json::to_string(&RetryFailed).unwrap(), "\"retry_failed\"");
        let parsed: ResumeAction = serde_json::from_str("\"start_fresh\"").unwrap();
        assert_eq!(parsed, StartFresh);
    }
}
