//! # Claim Audit
//!
//! 对一段论证性文本做三阶段质量分析的服务
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `clients/` - `ModelProvider` 模型调用接口及 OpenAI 兼容实现
//! - `session/` - 会话与声明记录的存储（内存 / SQLite）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每个服务只处理一种能力
//! - `ExtractionService` - 声明抽取（第 1 阶段）
//! - `ClaimAnalysisService` - 单条声明分析与模型路由（第 2 阶段）
//! - `SynthesisService` - 综合评分与确定性兜底（第 3 阶段）
//!
//! ### ③ 流程层（Workflow）
//! - `session/checkpoint` - 检查点写入
//! - `session/resume` - 恢复决策
//! - `progress/` - 进度事件协议
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 批量执行引擎，控制并发和批间间隔
//! - `orchestrator/pipeline` - 单个主题的三阶段流水线
//!
//! ### ⑤ 接口层
//! - `api/` - HTTP + SSE
//!
//! ## 模块结构

pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod services;
pub mod session;
pub mod utils;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{AnalysisSession, Claim, ClaimAnalysis, ContentContext, PipelineResult};
pub use orchestrator::{Pipeline, PipelineContext, RunOptions};
pub use progress::{ProgressEmitter, ProgressEvent};
pub use session::{ResumeAction, StatusReport};
