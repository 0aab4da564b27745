//! HTTP 接口 - 最外层
//!
//! 只做请求解析、错误映射和 SSE 转发，流程全部委托给 `Pipeline`。
//!
//! | 方法 | 路径 | 说明 |
//! |------|------|------|
//! | GET  | `/health` | 存活检查 |
//! | POST | `/api/analyses` | 开始分析，SSE 推送进度 |
//! | POST | `/api/analyses/:subject_id/resume` | 恢复运行 |
//! | GET  | `/api/analyses/:subject_id/status` | 会话状态 |

pub mod error;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::orchestrator::Pipeline;

pub use error::ApiError;

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/analyses", post(handlers::start_analysis))
        .route("/api/analyses/:subject_id/resume", post(handlers::resume_analysis))
        .route("/api/analyses/:subject_id/status", get(handlers::analysis_status))
        .with_state(state)
}
