//! SQLite 存储 - 基础设施层
//!
//! 单连接放在 `Mutex` 中，所有访问都在 `spawn_blocking` 里完成，不阻塞异步运行时。
//! 会话的声明快照和上下文以 JSON 文本保存；声明记录按 (主题, 会话, 序号) 为主键。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::SessionError;
use crate::models::{AnalysisSession, ClaimAnalysis, Pass, SessionStatus};
use crate::session::store::{ClaimStore, SessionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS analysis_sessions (
    id               TEXT PRIMARY KEY,
    subject_id       TEXT NOT NULL,
    status           TEXT NOT NULL,
    current_pass     INTEGER NOT NULL,
    extracted_claims TEXT,
    total_claims     INTEGER NOT NULL,
    claims_completed INTEGER NOT NULL,
    claims_failed    INTEGER NOT NULL,
    last_batch_index INTEGER,
    content_hash     TEXT NOT NULL,
    context          TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    completed_at     TEXT,
    error_message    TEXT,
    error_phase      INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_subject ON analysis_sessions(subject_id);

CREATE TABLE IF NOT EXISTS claim_analyses (
    subject_id  TEXT NOT NULL,
    session_id  TEXT NOT NULL,
    claim_index INTEGER NOT NULL,
    status      TEXT NOT NULL,
    record      TEXT NOT NULL,
    PRIMARY KEY (subject_id, session_id, claim_index)
);
";

const SESSION_COLUMNS: &str = "id, subject_id, status, current_pass, extracted_claims, total_claims, \
     claims_completed, claims_failed, last_batch_index, content_hash, context, created_at, updated_at, \
     completed_at, error_message, error_phase";

/// SQLite 存储，同时实现两个 trait
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let conn = Connection::open(path.as_ref())?;
        info!("✓ 已打开数据库: {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, SessionError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SessionError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中使用连接
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SessionError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| SessionError::Store {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| SessionError::Store {
            operation: operation.to_string(),
            message: e.to_string(),
        })?
    }
}

/// 数据库中的一行会话（原始列值）
struct SessionRow {
    id: String,
    subject_id: String,
    status: String,
    current_pass: u8,
    extracted_claims: Option<String>,
    total_claims: i64,
    claims_completed: i64,
    claims_failed: i64,
    last_batch_index: Option<i64>,
    content_hash: String,
    context: String,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    error_phase: Option<u8>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            status: row.get(2)?,
            current_pass: row.get(3)?,
            extracted_claims: row.get(4)?,
            total_claims: row.get(5)?,
            claims_completed: row.get(6)?,
            claims_failed: row.get(7)?,
            last_batch_index: row.get(8)?,
            content_hash: row.get(9)?,
            context: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            completed_at: row.get(13)?,
            error_message: row.get(14)?,
            error_phase: row.get(15)?,
        })
    }

    fn into_session(self) -> Result<AnalysisSession, SessionError> {
        Ok(AnalysisSession {
            id: self.id,
            subject_id: self.subject_id,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| corrupt(format!("未知会话状态: {}", self.status)))?,
            current_pass: Pass::try_from(self.current_pass).map_err(corrupt)?,
            extracted_claims: self
                .extracted_claims
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            total_claims: self.total_claims.max(0) as usize,
            claims_completed: self.claims_completed.max(0) as usize,
            claims_failed: self.claims_failed.max(0) as usize,
            last_batch_index: self.last_batch_index.map(|i| i.max(0) as usize),
            content_hash: self.content_hash,
            context: serde_json::from_str(&self.context)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            error_message: self.error_message,
            error_phase: self
                .error_phase
                .map(Pass::try_from)
                .transpose()
                .map_err(corrupt)?,
        })
    }
}

fn corrupt(message: impl Into<String>) -> SessionError {
    SessionError::Store {
        operation: "decode".to_string(),
        message: message.into(),
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("时间格式错误 '{}': {}", value, e)))
}

fn write_session(conn: &Connection, session: &AnalysisSession) -> Result<(), SessionError> {
    let claims_json = session
        .extracted_claims
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let context_json = serde_json::to_string(&session.context)?;

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO analysis_sessions ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            SESSION_COLUMNS
        ),
        params![
            session.id,
            session.subject_id,
            session.status.as_str(),
            session.current_pass.number(),
            claims_json,
            session.total_claims as i64,
            session.claims_completed as i64,
            session.claims_failed as i64,
            session.last_batch_index.map(|i| i as i64),
            session.content_hash,
            context_json,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
            session.completed_at.map(|t| t.to_rfc3339()),
            session.error_message,
            session.error_phase.map(Pass::number),
        ],
    )?;
    Ok(())
}

/// 覆盖可变列，已放弃的会话不更新；返回受影响的行数
fn update_session(conn: &Connection, session: &AnalysisSession) -> Result<usize, SessionError> {
    let claims_json = session
        .extracted_claims
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let context_json = serde_json::to_string(&session.context)?;

    let changed = conn.execute(
        "UPDATE analysis_sessions SET status = ?2, current_pass = ?3, extracted_claims = ?4, \
         total_claims = ?5, claims_completed = ?6, claims_failed = ?7, last_batch_index = ?8, \
         context = ?9, updated_at = ?10, completed_at = ?11, error_message = ?12, error_phase = ?13 \
         WHERE id = ?1 AND status != ?14",
        params![
            session.id,
            session.status.as_str(),
            session.current_pass.number(),
            claims_json,
            session.total_claims as i64,
            session.claims_completed as i64,
            session.claims_failed as i64,
            session.last_batch_index.map(|i| i as i64),
            context_json,
            session.updated_at.to_rfc3339(),
            session.completed_at.map(|t| t.to_rfc3339()),
            session.error_message,
            session.error_phase.map(Pass::number),
            SessionStatus::Abandoned.as_str(),
        ],
    )?;
    Ok(changed)
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create(&self, session: &AnalysisSession) -> Result<(), SessionError> {
        let session = session.clone();
        self.with_conn("create", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE analysis_sessions SET status = ?1, updated_at = ?2 \
                 WHERE subject_id = ?3 AND status = ?4",
                params![
                    SessionStatus::Abandoned.as_str(),
                    Utc::now().to_rfc3339(),
                    session.subject_id,
                    SessionStatus::InProgress.as_str(),
                ],
            )?;
            write_session(&tx, &session)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update(&self, session: &AnalysisSession) -> Result<(), SessionError> {
        let session = session.clone();
        self.with_conn("update", move |conn| {
            if update_session(conn, &session)? > 0 {
                return Ok(());
            }
            let exists: Option<String> = conn
                .query_row(
                    "SELECT status FROM analysis_sessions WHERE id = ?1",
                    params![session.id],
                    |row| row.get(0),
                )
                .optional()?;
            Err(match exists {
                Some(_) => SessionError::Superseded {
                    session_id: session.id.clone(),
                },
                None => SessionError::NotFound {
                    subject_id: session.subject_id.clone(),
                },
            })
        })
        .await
    }

    async fn get_latest(&self, subject_id: &str) -> Result<Option<AnalysisSession>, SessionError> {
        let subject_id = subject_id.to_string();
        self.with_conn("get_latest", move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM analysis_sessions WHERE subject_id = ?1 \
                         ORDER BY created_at DESC, rowid DESC LIMIT 1",
                        SESSION_COLUMNS
                    ),
                    params![subject_id],
                    SessionRow::from_row,
                )
                .optional()?;
            row.map(SessionRow::into_session).transpose()
        })
        .await
    }
}

#[async_trait]
impl ClaimStore for SqliteStore {
    async fn upsert(
        &self,
        subject_id: &str,
        session_id: &str,
        records: &[ClaimAnalysis],
    ) -> Result<(), SessionError> {
        let subject_id = subject_id.to_string();
        let session_id = session_id.to_string();
        let records = records.to_vec();

        self.with_conn("upsert", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO claim_analyses (subject_id, session_id, claim_index, status, record) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (subject_id, session_id, claim_index) \
                     DO UPDATE SET status = excluded.status, record = excluded.record",
                )?;
                for record in &records {
                    let status = if record.is_completed() { "completed" } else { "failed" };
                    stmt.execute(params![
                        subject_id,
                        session_id,
                        record.claim_index as i64,
                        status,
                        serde_json::to_string(record)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn query(&self, subject_id: &str, session_id: &str) -> Result<Vec<ClaimAnalysis>, SessionError> {
        let subject_id = subject_id.to_string();
        let session_id = session_id.to_string();

        self.with_conn("query", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM claim_analyses \
                 WHERE subject_id = ?1 AND session_id = ?2 ORDER BY claim_index",
            )?;
            let rows = stmt.query_map(params![subject_id, session_id], |row| row.get::<_, String>(0))?;

            let mut records = Vec::new();
            for row in rows {
                records.push(serde_json::from_str(&row?)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, Claim, ClaimKind, Complexity, ContentContext};

    fn session(subject: &str) -> AnalysisSession {
        AnalysisSession::new(
            subject,
            "abc123",
            ContentContext {
                title: Some("标题".into()),
                description: None,
            },
        )
    }

    fn claims(n: usize) -> Vec<Claim> {
        (0..n)
            .map(|index| Claim {
                index,
                text: format!("声明 {}", index),
                kind: ClaimKind::Evaluative,
                explicit: true,
                complexity: Complexity::Complex,
                complexity_confidence: 0.4,
                depends_on: if index > 0 { vec![index - 1] } else { vec![] },
            })
            .collect()
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut s = session("subject-1");
        store.create(&s).await.unwrap();

        s.store_snapshot(claims(3)).unwrap();
        s.record_progress(1, 1, 0);
        store.update(&s).await.unwrap();

        let loaded = store.get_latest("subject-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.current_pass, Pass::Analysis);
        assert_eq!(loaded.extracted_claims, s.extracted_claims);
        assert_eq!(loaded.claims_failed, 1);
        assert_eq!(loaded.last_batch_index, Some(0));
        assert_eq!(loaded.context.title.as_deref(), Some("标题"));
    }

    #[tokio::test]
    async fn test_create_abandons_prior_in_progress() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = session("subject-1");
        store.create(&first).await.unwrap();
        let second = session("subject-1");
        store.create(&second).await.unwrap();

        let latest = store.get_latest("subject-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let conn = store.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM analysis_sessions WHERE id = ?1",
                params![first.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "abandoned");
    }

    #[tokio::test]
    async fn test_abandoned_row_is_not_overwritten() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = session("subject-1");
        store.create(&first).await.unwrap();
        store.create(&session("subject-1")).await.unwrap();

        first.store_snapshot(claims(2)).unwrap();
        first.record_progress(1, 0, 0);
        let result = store.update(&first).await;
        assert!(matches!(result, Err(SessionError::Superseded { .. })));

        let conn = store.conn.lock().unwrap();
        let (status, completed): (String, i64) = conn
            .query_row(
                "SELECT status, claims_completed FROM analysis_sessions WHERE id = ?1",
                params![first.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "abandoned");
        assert_eq!(completed, 0);
    }

    #[tokio::test]
    async fn test_update_missing_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.update(&session("ghost")).await;
        assert!(matches!(result, Err(SessionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_claim_upsert_replaces_by_index() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert("s", "run-1", &[ClaimAnalysis::failed(0, "m", "超时"), ClaimAnalysis::failed(1, "m", "超时")])
            .await
            .unwrap();

        let mut retried = ClaimAnalysis::failed(1, "m", "");
        retried.status = AnalysisStatus::Completed;
        retried.error = None;
        retried.validity_score = 8;
        store.upsert("s", "run-1", &[retried.clone()]).await.unwrap();

        let records = store.query("s", "run-1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_failed());
        assert_eq!(records[1], retried);
        assert!(store.query("s", "run-2").await.unwrap().is_empty());
    }
}
