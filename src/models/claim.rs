//! 声明模型

use serde::{Deserialize, Serialize};
use std::fmt;

/// 声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimKind {
    /// 事实性
    Factual,
    /// 解释性
    Interpretive,
    /// 评价性
    Evaluative,
    /// 规范性（应当如何）
    Prescriptive,
}

impl ClaimKind {
    /// 宽松解析模型返回的类型字符串，无法识别时视为解释性
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "factual" | "fact" => ClaimKind::Factual,
            "evaluative" | "value" => ClaimKind::Evaluative,
            "prescriptive" | "policy" | "normative" => ClaimKind::Prescriptive,
            _ => ClaimKind::Interpretive,
        }
    }
}

/// 复杂度分级，决定路由到哪一档模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    /// 升一档；`Complex` 保持不变
    pub fn escalate(self) -> Self {
        match self {
            Complexity::Simple => Complexity::Moderate,
            Complexity::Moderate | Complexity::Complex => Complexity::Complex,
        }
    }

    /// 宽松解析，无法识别时视为中等
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" | "low" | "easy" => Complexity::Simple,
            "complex" | "high" | "hard" => Complexity::Complex,
            _ => Complexity::Moderate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 抽取出的声明
///
/// `index` 在抽取时分配，从 0 开始，同一次运行内不会复用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub index: usize,
    pub text: String,
    pub kind: ClaimKind,
    /// 原文明确陈述（true）还是推断得出（false）
    pub explicit: bool,
    pub complexity: Complexity,
    /// 复杂度判断的置信度，范围 0..1
    pub complexity_confidence: f64,
    /// 本声明所依赖的其他声明的 index
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// 待评估内容的附加上下文
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentContext {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ContentContext {
    /// 渲染为提示词片段；没有任何上下文时返回 `None`
    pub fn render(&self) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            lines.push(format!("标题: {}", title.trim()));
        }
        if let Some(desc) = self.description.as_deref().filter(|d| !d.trim().is_empty()) {
            lines.push(format!("描述: {}", desc.trim()));
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}
