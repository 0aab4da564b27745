//! 程序配置
//!
//! 加载顺序：默认值 → TOML 配置文件（可选）→ 环境变量覆盖。

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::services::model_router::{RoutingThresholds, TierModels};

/// 配置文件路径的环境变量
const ENV_CONFIG_PATH: &str = "CLAIM_AUDIT_CONFIG";
/// 默认配置文件
const DEFAULT_CONFIG_PATH: &str = "claim_audit.toml";

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP 监听地址
    pub bind_addr: String,
    /// SQLite 数据库路径，未设置时使用内存存储
    pub database_path: Option<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- LLM 配置 ---
    pub llm: LlmConfig,
    // --- 流水线配置 ---
    pub pipeline: PipelineConfig,
    /// 模型单价（美元 / 百万 token），覆盖内置价格表
    pub pricing: HashMap<String, ModelPrice>,
}

/// LLM 配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base_url: String,
    /// 第 1 阶段使用的模型
    pub extraction_model: String,
    /// 第 3 阶段使用的模型
    pub synthesis_model: String,
    /// 三档分析模型
    pub simple_model: String,
    pub moderate_model: String,
    pub complex_model: String,
    /// 单次调用超时（秒）
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub extraction_max_tokens: u32,
    pub analysis_max_tokens: u32,
    pub synthesis_max_tokens: u32,
}

/// 流水线配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 每批处理的声明数
    pub batch_size: usize,
    /// 批次之间的等待时间（毫秒）
    pub batch_delay_ms: u64,
    /// 批内最大并发数
    pub max_concurrent: usize,
    /// 声明数量上限（no-cap 模式下忽略）
    pub max_claims: usize,
    /// 复杂度置信度低于该值时升档
    pub confidence_threshold: f64,
    /// 是否使用可缓存的共享上下文提示词
    pub prompt_caching: bool,
}

/// 模型单价
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            database_path: None,
            verbose_logging: false,
            llm: LlmConfig::default(),
            pipeline: PipelineConfig::default(),
            pricing: HashMap::new(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            extraction_model: "gpt-4o".to_string(),
            synthesis_model: "gpt-4o".to_string(),
            simple_model: "gpt-4o-mini".to_string(),
            moderate_model: "gpt-4o".to_string(),
            complex_model: "o3".to_string(),
            request_timeout_secs: 120,
            temperature: 0.3,
            extraction_max_tokens: 4096,
            analysis_max_tokens: 1500,
            synthesis_max_tokens: 3000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay_ms: 1000,
            max_concurrent: 5,
            max_claims: 30,
            confidence_threshold: 0.7,
            prompt_caching: true,
        }
    }
}

impl Config {
    /// 加载配置：配置文件（如果存在）+ 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(ENV_CONFIG_PATH).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let base = if Path::new(&path).exists() {
            Self::from_toml_file(&path)?
        } else if explicit.is_some() {
            return Err(ConfigError::FileLoadFailed {
                path,
                message: "文件不存在".to_string(),
            });
        } else {
            Self::default()
        };

        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileLoadFailed {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::FileLoadFailed { message, .. } => ConfigError::FileLoadFailed {
                path: path.to_string(),
                message,
            },
            other => other,
        })
    }

    /// 从 TOML 字符串解析，未出现的字段取默认值
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 用环境变量覆盖配置
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_string("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_string("DATABASE_PATH") {
            self.database_path = Some(v);
        }
        if let Some(v) = env_parse("VERBOSE_LOGGING")? {
            self.verbose_logging = v;
        }
        if let Some(v) = env_string("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = env_string("LLM_API_BASE_URL") {
            self.llm.api_base_url = v;
        }
        if let Some(v) = env_string("EXTRACTION_MODEL") {
            self.llm.extraction_model = v;
        }
        if let Some(v) = env_string("SYNTHESIS_MODEL") {
            self.llm.synthesis_model = v;
        }
        if let Some(v) = env_parse("REQUEST_TIMEOUT_SECS")? {
            self.llm.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("BATCH_SIZE")? {
            self.pipeline.batch_size = v;
        }
        if let Some(v) = env_parse("BATCH_DELAY_MS")? {
            self.pipeline.batch_delay_ms = v;
        }
        if let Some(v) = env_parse("MAX_CONCURRENT")? {
            self.pipeline.max_concurrent = v;
        }
        if let Some(v) = env_parse("MAX_CLAIMS")? {
            self.pipeline.max_claims = v;
        }
        if let Some(v) = env_parse("CONFIDENCE_THRESHOLD")? {
            self.pipeline.confidence_threshold = v;
        }
        if let Some(v) = env_parse("PROMPT_CACHING")? {
            self.pipeline.prompt_caching = v;
        }
        Ok(self)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.batch_size == 0 {
            return Err(invalid("pipeline.batch_size", "必须大于 0"));
        }
        if self.pipeline.max_concurrent == 0 {
            return Err(invalid("pipeline.max_concurrent", "必须大于 0"));
        }
        if self.pipeline.max_claims == 0 {
            return Err(invalid("pipeline.max_claims", "必须大于 0"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.confidence_threshold) {
            return Err(invalid("pipeline.confidence_threshold", "必须在 [0, 1] 之间"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(invalid("llm.request_timeout_secs", "必须大于 0"));
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.pipeline.batch_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn tier_models(&self) -> TierModels {
        TierModels {
            simple: self.llm.simple_model.clone(),
            moderate: self.llm.moderate_model.clone(),
            complex: self.llm.complex_model.clone(),
        }
    }

    pub fn routing_thresholds(&self) -> RoutingThresholds {
        RoutingThresholds {
            confidence_threshold: self.pipeline.confidence_threshold,
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(var_name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(var_name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_delay(), Duration::from_millis(1000));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            bind_addr = "0.0.0.0:9000"

            [pipeline]
            batch_size = 3

            [pricing."gpt-4o"]
            input_per_million = 2.5
            output_per_million = 10.0
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.pipeline.batch_size, 3);
        assert_eq!(config.pipeline.max_concurrent, 5);
        assert_eq!(config.llm.simple_model, "gpt-4o-mini");
        assert_eq!(config.pricing["gpt-4o"].output_per_million, 10.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = Config::default();
        config.pipeline.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("bind_addr = ").unwrap_err();
        assert!(matches!(err, ConfigError::FileLoadFailed { .. }));
    }
}
