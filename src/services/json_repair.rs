//! 结构化响应解析
//!
//! 先严格解析；失败时只做一次有边界的结构修复（尾随逗号、字符串内未转义的控制字符、
//! 缺失的分隔逗号），再解析一次，仍失败则返回 `ParseError`。

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::ParseError;

/// 解析模型返回的 JSON
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    let candidate = extract_json_block(raw)
        .ok_or_else(|| ParseError::new("响应中没有 JSON 对象", raw))?;

    match serde_json::from_str::<T>(candidate) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            debug!("JSON 解析失败，尝试修复: {}", first_err);
            let repaired = repair_json(candidate);
            serde_json::from_str::<T>(&repaired).map_err(|second_err| {
                ParseError::new(
                    format!("修复后仍无法解析: {} (原始错误: {})", second_err, first_err),
                    raw,
                )
            })
        }
    }
}

/// 截取响应中的 JSON 对象：去掉 markdown 代码块和前后说明文字
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

/// 有边界的结构修复，只执行一遍
pub fn repair_json(input: &str) -> String {
    let escaped = escape_control_chars_in_strings(input);
    let separated = insert_missing_commas(&escaped);
    remove_trailing_commas(&separated)
}

fn trailing_comma_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").ok()).as_ref()
}

fn missing_comma_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"("|\d|true|false|null|\}|\])(\s*\n\s*)("|\{|\[)"#).ok())
        .as_ref()
}

fn remove_trailing_commas(input: &str) -> String {
    match trailing_comma_re() {
        Some(re) => re.replace_all(input, "$1").into_owned(),
        None => input.to_string(),
    }
}

/// 相邻两行的值之间缺少逗号时补上（只处理换行分隔的情况）
fn insert_missing_commas(input: &str) -> String {
    match missing_comma_re() {
        Some(re) => re.replace_all(input, "$1,$2$3").into_owned(),
        None => input.to_string(),
    }
}

/// 转义字符串字面量内部的原始换行、回车、制表符等控制字符
fn escape_control_chars_in_strings(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }

    out
}
