//! 会话与声明记录的存储接口 - 基础设施层
//!
//! 编排层只依赖这两个 trait；内存实现用于测试和未配置数据库的部署，
//! SQLite 实现见 `sqlite_store`。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::SessionError;
use crate::models::{merge_analyses, AnalysisSession, ClaimAnalysis, SessionStatus};

/// 会话存储
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 新建会话；同一主题下仍在运行中的旧会话会在同一操作内被标记为 abandoned
    async fn create(&self, session: &AnalysisSession) -> Result<(), SessionError>;

    /// 按 id 整条覆盖；已被放弃的会话拒绝写入（`SessionError::Superseded`）
    async fn update(&self, session: &AnalysisSession) -> Result<(), SessionError>;

    /// 主题下最近创建的会话
    async fn get_latest(&self, subject_id: &str) -> Result<Option<AnalysisSession>, SessionError>;
}

/// 声明分析记录存储，按 (主题, 会话) 隔离
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// 以 `claim_index` 为键写入，已存在的记录被替换
    async fn upsert(
        &self,
        subject_id: &str,
        session_id: &str,
        records: &[ClaimAnalysis],
    ) -> Result<(), SessionError>;

    /// 按 `claim_index` 升序返回
    async fn query(&self, subject_id: &str, session_id: &str) -> Result<Vec<ClaimAnalysis>, SessionError>;
}

/// 内存存储，同时实现两个 trait
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Vec<AnalysisSession>>>,
    claims: Mutex<HashMap<(String, String), BTreeMap<usize, ClaimAnalysis>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 主题下的全部会话，按创建顺序
    pub fn sessions_for(&self, subject_id: &str) -> Result<Vec<AnalysisSession>, SessionError> {
        let sessions = lock(&self.sessions, "sessions_for")?;
        Ok(sessions.get(subject_id).cloned().unwrap_or_default())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, operation: &str) -> Result<MutexGuard<'a, T>, SessionError> {
    mutex.lock().map_err(|e| SessionError::Store {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &AnalysisSession) -> Result<(), SessionError> {
        let mut sessions = lock(&self.sessions, "create")?;
        let history = sessions.entry(session.subject_id.clone()).or_default();

        for prior in history.iter_mut().filter(|s| s.status == SessionStatus::InProgress) {
            prior.mark_abandoned();
        }
        history.push(session.clone());
        Ok(())
    }

    async fn update(&self, session: &AnalysisSession) -> Result<(), SessionError> {
        let mut sessions = lock(&self.sessions, "update")?;
        let existing = sessions
            .get_mut(&session.subject_id)
            .and_then(|history| history.iter_mut().find(|s| s.id == session.id))
            .ok_or_else(|| SessionError::NotFound {
                subject_id: session.subject_id.clone(),
            })?;
        if existing.status == SessionStatus::Abandoned {
            return Err(SessionError::Superseded {
                session_id: session.id.clone(),
            });
        }
        *existing = session.clone();
        Ok(())
    }

    async fn get_latest(&self, subject_id: &str) -> Result<Option<AnalysisSession>, SessionError> {
        let sessions = lock(&self.sessions, "get_latest")?;
        Ok(sessions.get(subject_id).and_then(|history| history.last().cloned()))
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn upsert(
        &self,
        subject_id: &str,
        session_id: &str,
        records: &[ClaimAnalysis],
    ) -> Result<(), SessionError> {
        let mut claims = lock(&self.claims, "upsert")?;
        let stored = claims
            .entry((subject_id.to_string(), session_id.to_string()))
            .or_default();

        let merged = merge_analyses(stored.values().cloned(), records.iter().cloned());
        *stored = merged.into_iter().map(|r| (r.claim_index, r)).collect();
        Ok(())
    }

    async fn query(&self, subject_id: &str, session_id: &str) -> Result<Vec<ClaimAnalysis>, SessionError> {
        let claims = lock(&self.claims, "query")?;
        Ok(claims
            .get(&(subject_id.to_string(), session_id.to_string()))
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default())
    }
}
