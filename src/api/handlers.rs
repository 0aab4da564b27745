//! 请求处理器

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::api::{ApiError, AppState};
use crate::models::ContentContext;
use crate::orchestrator::{ResumePlan, RunOptions};
use crate::progress::{ProgressEmitter, ProgressEvent};
use crate::session::{ResumeAction, StatusReport};

/// 开始分析请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnalysisRequest {
    pub subject_id: String,
    pub content: String,
    #[serde(default)]
    pub context: ContentContext,
    #[serde(default)]
    pub no_cap: bool,
}

/// 恢复请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub action: ResumeAction,
    #[serde(default)]
    pub content: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/analyses
///
/// 运行在独立任务中，客户端断开不会中断运行。
pub async fn start_analysis(
    State(state): State<AppState>,
    Json(req): Json<StartAnalysisRequest>,
) -> Result<Response, ApiError> {
    if req.subject_id.trim().is_empty() {
        return Err(ApiError::bad_request("subjectId 不能为空"));
    }
    if req.content.trim().is_empty() {
        return Err(ApiError::bad_request("content 不能为空"));
    }

    info!("📥 [主题 {}] 收到分析请求", req.subject_id);
    let (emitter, rx) = ProgressEmitter::channel();
    let pipeline = state.pipeline.clone();
    let options = RunOptions { no_cap: req.no_cap };

    tokio::spawn(async move {
        // 结果已通过进度事件送出
        let _ = pipeline
            .run_with_progress(&req.subject_id, &req.content, req.context, options, &emitter)
            .await;
    });

    Ok(progress_stream(rx).into_response())
}

/// POST /api/analyses/:subject_id/resume
///
/// 先同步校验，校验失败直接返回 404 / 409；resynthesize 返回 JSON，其他动作返回 SSE。
pub async fn resume_analysis(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Response, ApiError> {
    info!("📥 [主题 {}] 收到恢复请求: {}", subject_id, req.action);
    let plan = state
        .pipeline
        .prepare_resume(&subject_id, req.action, req.content.as_deref())
        .await?;

    if matches!(plan, ResumePlan::Resynthesize { .. }) {
        let result = state
            .pipeline
            .execute_resume(plan, &ProgressEmitter::silent())
            .await?;
        return Ok(Json(result).into_response());
    }

    info!("▶ [主题 {}] 恢复校验通过: {}", subject_id, plan.action());
    let (emitter, rx) = ProgressEmitter::channel();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let _ = pipeline.execute_resume(plan, &emitter).await;
    });

    Ok(progress_stream(rx).into_response())
}

/// GET /api/analyses/:subject_id/status
pub async fn analysis_status(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.pipeline.status(&subject_id).await?))
}

/// 进度事件转为 SSE，运行结束（发送端释放）后流结束
fn progress_stream(
    rx: UnboundedReceiver<ProgressEvent>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = UnboundedReceiverStream::new(rx)
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
