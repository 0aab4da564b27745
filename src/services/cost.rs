//! 费用估算
//!
//! 按模型单价（美元 / 百万 token）估算调用费用。配置中的价格优先于内置价格表，
//! 未知模型按 0 计费。

use std::collections::HashMap;

use crate::config::ModelPrice;
use crate::models::TokenUsage;

/// 内置价格表
const BUILTIN_PRICES: [(&str, ModelPrice); 5] = [
    (
        "gpt-4o",
        ModelPrice {
            input_per_million: 2.5,
            output_per_million: 10.0,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPrice {
            input_per_million: 0.15,
            output_per_million: 0.6,
        },
    ),
    (
        "o3",
        ModelPrice {
            input_per_million: 2.0,
            output_per_million: 8.0,
        },
    ),
    (
        "gpt-4.1",
        ModelPrice {
            input_per_million: 2.0,
            output_per_million: 8.0,
        },
    ),
    (
        "gpt-4.1-mini",
        ModelPrice {
            input_per_million: 0.4,
            output_per_million: 1.6,
        },
    ),
];

/// 费用估算器
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    overrides: HashMap<String, ModelPrice>,
}

impl CostEstimator {
    pub fn new(overrides: HashMap<String, ModelPrice>) -> Self {
        Self { overrides }
    }

    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        self.overrides.get(model).copied().or_else(|| {
            BUILTIN_PRICES
                .iter()
                .find(|(name, _)| *name == model)
                .map(|(_, price)| *price)
        })
    }

    /// 估算单次调用费用（美元）
    pub fn estimate(&self, model: &str, usage: TokenUsage) -> f64 {
        match self.price_for(model) {
            Some(price) => {
                (usage.input_tokens as f64 * price.input_per_million
                    + usage.output_tokens as f64 * price.output_per_million)
                    / 1_000_000.0
            }
            None => 0.0,
        }
    }
}
