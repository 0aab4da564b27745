//! 业务能力层（Capability Layer）
//!
//! 每个服务只负责一种能力（抽取、分析、综合、路由、解析、计费），
//! 不关心批次、会话和进度，这些由编排层负责。

pub mod claim_analysis_service;
pub mod cost;
pub mod extraction_service;
pub mod json_repair;
pub mod model_router;
pub mod prompts;
pub mod synthesis_service;

pub use claim_analysis_service::ClaimAnalysisService;
pub use cost::CostEstimator;
pub use extraction_service::{ExtractionOutput, ExtractionService};
pub use model_router::{route, ModelRoute, RoutingThresholds, TierModels};
pub use synthesis_service::{fallback_synthesis, SynthesisOutput, SynthesisService};
