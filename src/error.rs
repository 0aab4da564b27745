//! 错误类型
//!
//! 按错误的作用域分类：
//! - 致命错误（抽取失败、致命的模型调用错误）会终止整个运行
//! - 单条声明的错误只标记该声明失败
//! - 综合阶段的错误由确定性兜底聚合吸收
//! - 检查点写入错误只记录日志，不影响内存中的运行

use thiserror::Error;

use crate::models::{Pass, TokenUsage};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 声明抽取错误（第 1 阶段，致命）
    #[error("抽取错误: {0}")]
    Extraction(#[from] ExtractionError),

    /// 单条声明分析错误
    #[error("声明分析错误: {0}")]
    ClaimAnalysis(#[from] ClaimAnalysisError),

    /// 综合阶段错误
    #[error("综合错误: {0}")]
    Synthesis(#[from] SynthesisError),

    /// 模型调用错误
    #[error("模型调用错误: {0}")]
    Provider(#[from] ProviderError),

    /// 会话 / 检查点错误
    #[error("会话错误: {0}")]
    Session(#[from] SessionError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

/// 模型调用错误
///
/// 区分瞬时错误（限流、网络抖动、超时）和致命错误（鉴权失败、参数非法）。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// 瞬时错误，可通过 `retry_failed` 重试
    #[error("瞬时错误 (模型: {model}): {message}")]
    Transient { model: String, message: String },

    /// 致命错误，终止运行
    #[error("致命错误 (模型: {model}): {message}")]
    Fatal { model: String, message: String },

    /// 单次调用超时
    #[error("调用超时 (模型: {model}, {timeout_secs} 秒)")]
    Timeout { model: String, timeout_secs: u64 },

    /// 返回内容为空
    #[error("模型返回内容为空 (模型: {model})")]
    EmptyResponse { model: String },
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal { .. })
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderError::Transient { model, .. }
            | ProviderError::Fatal { model, .. }
            | ProviderError::Timeout { model, .. }
            | ProviderError::EmptyResponse { model } => model,
        }
    }
}

/// 结构化响应解析错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("响应解析失败: {message} (片段: {excerpt})")]
pub struct ParseError {
    pub message: String,
    pub excerpt: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>, raw: &str) -> Self {
        Self {
            message: message.into(),
            excerpt: raw.chars().take(120).collect(),
        }
    }
}

/// 声明抽取错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// 内容为空
    #[error("待评估内容为空")]
    EmptyContent,

    /// 模型调用失败
    #[error("抽取调用失败: {0}")]
    Provider(#[from] ProviderError),

    /// 修复后仍无法解析
    #[error("抽取结果无法解析: {0}")]
    Parse(#[from] ParseError),
}

/// 单条声明分析错误
#[derive(Debug, Clone, Error)]
#[error("声明 #{claim_index} 分析失败 (模型: {model}): {kind}")]
pub struct ClaimAnalysisError {
    pub claim_index: usize,
    pub model: String,
    pub kind: ClaimAnalysisErrorKind,
    /// 调用已返回但解析失败时仍计入用量
    pub usage: TokenUsage,
}

/// 单条声明分析失败的原因
#[derive(Debug, Clone, Error)]
pub enum ClaimAnalysisErrorKind {
    #[error("{0}")]
    Provider(ProviderError),

    #[error("{0}")]
    Parse(ParseError),
}

impl ClaimAnalysisError {
    /// 致命的模型错误会升级为运行级错误
    pub fn is_fatal(&self) -> bool {
        matches!(&self.kind, ClaimAnalysisErrorKind::Provider(e) if e.is_fatal())
    }
}

/// 综合阶段错误
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("综合调用失败: {0}")]
    Provider(#[from] ProviderError),

    #[error("综合结果无法解析: {0}")]
    Parse(#[from] ParseError),
}

/// 会话 / 检查点错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 存储读写失败
    #[error("存储操作失败 ({operation}): {message}")]
    Store { operation: String, message: String },

    /// 找不到会话
    #[error("主题 {subject_id} 没有分析会话")]
    NotFound { subject_id: String },

    /// 当前会话不允许该恢复动作
    #[error("恢复动作 {action} 不可用: {reason}")]
    InvalidResume { action: String, reason: String },

    /// 传入内容与会话记录的哈希不一致
    #[error("内容哈希不一致 (主题: {subject_id})")]
    ContentMismatch { subject_id: String },

    /// 会话已被同主题的新会话放弃，不再接受写入
    #[error("会话 {session_id} 已被放弃")]
    Superseded { session_id: String },

    /// 非法的状态迁移
    #[error("非法的阶段迁移: {from} -> {to}")]
    InvalidTransition { from: Pass, to: Pass },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },

    /// 配置文件读取或解析失败
    #[error("配置文件 {path} 加载失败: {message}")]
    FileLoadFailed { path: String, message: String },

    /// 配置值非法
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: String, reason: String },
}

// ========== 从常见错误类型转换 ==========

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        SessionError::Store {
            operation: "sqlite".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Store {
            operation: "serde_json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::FileLoadFailed {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建恢复动作不可用错误
    pub fn invalid_resume(action: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Session(SessionError::InvalidResume {
            action: action.into(),
            reason: reason.into(),
        })
    }

    /// 创建存储失败错误
    pub fn store_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Session(SessionError::Store {
            operation: operation.into(),
            message: message.into(),
        })
    }

    /// 运行所属的会话已被放弃
    pub fn is_superseded(&self) -> bool {
        matches!(self, AppError::Session(SessionError::Superseded { .. }))
    }

    /// 运行失败所在的阶段（用于会话的 `error_phase`）
    pub fn phase_hint(&self) -> Option<Pass> {
        match self {
            AppError::Extraction(_) => Some(Pass::Extraction),
            AppError::ClaimAnalysis(_) => Some(Pass::Analysis),
            AppError::Synthesis(_) => Some(Pass::Synthesis),
            _ => None,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
