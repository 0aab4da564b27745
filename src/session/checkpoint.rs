//! 检查点写入 - 流程层
//!
//! 写入失败只记录 warn 日志，不影响内存中的运行；读取失败照常返回错误。
//! 会话被放弃后的写入返回 `WriteOutcome::Superseded`，由编排层停止运行。

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::models::{AnalysisSession, ClaimAnalysis};
use crate::session::store::{ClaimStore, SessionStore};

/// 会话写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Saved,
    /// 存储失败，运行继续
    Failed,
    /// 会话已被放弃，运行应当停止
    Superseded,
}

/// 检查点
#[derive(Clone)]
pub struct Checkpointer {
    sessions: Arc<dyn SessionStore>,
    claims: Arc<dyn ClaimStore>,
}

impl Checkpointer {
    pub fn new(sessions: Arc<dyn SessionStore>, claims: Arc<dyn ClaimStore>) -> Self {
        Self { sessions, claims }
    }

    /// 新建会话（同主题旧的运行中会话被放弃），返回是否写入成功
    pub async fn create(&self, session: &AnalysisSession) -> bool {
        match self.sessions.create(session).await {
            Ok(()) => {
                debug!("[主题 {}] 会话已创建: {}", session.subject_id, session.id);
                true
            }
            Err(e) => {
                warn!(
                    "[主题 {}] ⚠️ 会话创建写入失败 ({}): {}",
                    session.subject_id, session.current_pass, e
                );
                false
            }
        }
    }

    /// 保存会话状态
    pub async fn save_session(&self, session: &AnalysisSession) -> WriteOutcome {
        match self.sessions.update(session).await {
            Ok(()) => WriteOutcome::Saved,
            Err(SessionError::Superseded { .. }) => {
                warn!(
                    "[主题 {}] ⚠️ 会话 {} 已被新会话取代，停止写入",
                    session.subject_id, session.id
                );
                WriteOutcome::Superseded
            }
            Err(e) => {
                warn!(
                    "[主题 {}] ⚠️ 检查点写入失败 ({}): {}",
                    session.subject_id, session.current_pass, e
                );
                WriteOutcome::Failed
            }
        }
    }

    /// 保存一批声明记录，返回是否写入成功
    pub async fn save_claims(&self, session: &AnalysisSession, records: &[ClaimAnalysis]) -> bool {
        if records.is_empty() {
            return true;
        }
        match self.claims.upsert(&session.subject_id, &session.id, records).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "[主题 {}] ⚠️ 声明记录写入失败 ({} 条, {}): {}",
                    session.subject_id,
                    records.len(),
                    session.current_pass,
                    e
                );
                false
            }
        }
    }

    pub async fn load_latest(&self, subject_id: &str) -> Result<Option<AnalysisSession>, SessionError> {
        self.sessions.get_latest(subject_id).await
    }

    pub async fn load_claims(&self, session: &AnalysisSession) -> Result<Vec<ClaimAnalysis>, SessionError> {
        self.claims.query(&session.subject_id, &session.id).await
    }
}
