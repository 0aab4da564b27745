//! 模型路由 - 业务能力层
//!
//! 纯函数：根据声明的复杂度和置信度选择模型档位。
//! 置信度低于阈值时升一档（simple → moderate → complex，complex 保持不变）。

use serde::{Deserialize, Serialize};

use crate::models::{Claim, Complexity};

/// 路由阈值
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingThresholds {
    pub confidence_threshold: f64,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
        }
    }
}

/// 每档对应的模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierModels {
    pub simple: String,
    pub moderate: String,
    pub complex: String,
}

impl TierModels {
    pub fn model_for(&self, tier: Complexity) -> &str {
        match tier {
            Complexity::Simple => &self.simple,
            Complexity::Moderate => &self.moderate,
            Complexity::Complex => &self.complex,
        }
    }
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub tier: Complexity,
    pub model: String,
    pub escalated: bool,
}

/// 为声明选择模型
pub fn route(claim: &Claim, thresholds: &RoutingThresholds, tier_models: &TierModels) -> ModelRoute {
    let escalated = claim.complexity_confidence < thresholds.confidence_threshold;
    let tier = if escalated {
        claim.complexity.escalate()
    } else {
        claim.complexity
    };

    ModelRoute {
        tier,
        model: tier_models.model_for(tier).to_string(),
        escalated,
    }
}
