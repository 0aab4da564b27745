//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量调度和三阶段流程，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 通用批量执行引擎
//! - 切分批次、批内并发（Semaphore）、批间等待
//! - 单项失败隔离，整批结束后回调观察者
//!
//! ### `pipeline` - 单个主题的三阶段流水线
//! - 抽取 → 逐条分析 → 综合
//! - 每批结束写检查点、发进度事件
//! - 恢复（continue / retry_failed / resynthesize / start_fresh）
//!
//! ## 层次关系
//!
//! ```text
//! api (HTTP / SSE)
//!     ↓
//! pipeline (处理一个主题)
//!     ↓
//! batch_processor (处理 Vec<Claim>)
//!     ↓
//! services (能力层：extraction / analysis / synthesis)
//!     ↓
//! clients + session (基础设施：ModelProvider / SessionStore)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：batch_processor 管批量，pipeline 管流程
//! 2. **向下依赖**：编排层 → services → clients / session
//! 3. **无业务判断**：评分和解析都在能力层

pub mod batch_processor;
pub mod pipeline;

// 重新导出主要类型
pub use batch_processor::{BatchConfig, BatchProcessor};
pub use pipeline::{content_hash, Pipeline, PipelineContext, ResumePlan, RunOptions};
