//! 数据模型
//!
//! - `claim` - 抽取出的声明（抽取后不可变）
//! - `analysis` - 单条声明的分析结果
//! - `session` - 每个主题一次运行的检查点
//! - `result` - 流水线最终输出

pub mod analysis;
pub mod claim;
pub mod result;
pub mod session;

pub use analysis::{merge_analyses, AnalysisStatus, ClaimAnalysis, TokenUsage};
pub use claim::{Claim, ClaimKind, Complexity, ContentContext};
pub use result::{FallacyFinding, Findings, Label, PipelineResult};
pub use session::{AnalysisSession, Pass, SessionStatus};
