//! 提示词构建
//!
//! 只负责拼装结构，具体的评估措辞可以随时替换。

use crate::models::{Claim, ClaimAnalysis, ContentContext};

/// 第 1 阶段系统提示词
pub const EXTRACTION_SYSTEM_PROMPT: &str = "你是一名论证分析专家。请把给定文本拆解为相互独立、可单独评估的声明，\
并只输出符合约定格式的 JSON，不要输出任何其他内容。";

/// 第 2 阶段系统提示词
pub const ANALYSIS_SYSTEM_PROMPT: &str = "你是一名严谨的论证评估专家。请评估单条声明的有效性与证据支撑，\
识别其中的逻辑谬误、隐含假设和可能的反驳，并只输出符合约定格式的 JSON。";

/// 第 3 阶段系统提示词
pub const SYNTHESIS_SYSTEM_PROMPT: &str = "你是一名论证质量评审。请综合逐条声明的分析结果，\
给出整体的善意论证指标、谬误、操纵性语言和总结，并只输出符合约定格式的 JSON。";

const EXTRACTION_SCHEMA: &str = r#"{
  "claims": [
    {
      "text": "声明原文或忠实复述",
      "type": "factual | interpretive | evaluative | prescriptive",
      "explicit": true,
      "complexity": "simple | moderate | complex",
      "complexityConfidence": 0.0,
      "dependsOn": [0]
    }
  ]
}"#;

const ANALYSIS_SCHEMA: &str = r#"{
  "validityScore": 1,
  "evidenceScore": 1,
  "fallacies": ["谬误名称"],
  "assumptions": ["隐含假设"],
  "counterArguments": ["可能的反驳"],
  "improvementNotes": "改进建议"
}"#;

const SYNTHESIS_SCHEMA: &str = r#"{
  "score": 0,
  "label": "exemplary | constructive | neutral | questionable | hostile",
  "goodFaithIndicators": ["善意论证的表现"],
  "fallacies": [{"name": "谬误名称", "description": "说明", "claimIndices": [0]}],
  "manipulativeLanguage": ["操纵性语言"],
  "summary": "整体评价"
}"#;

/// 声明在提示词中的标记，`index` 为声明编号
pub fn claim_tag(index: usize) -> String {
    format!("<claim index=\"{}\">", index)
}

/// 构建抽取提示词
pub fn build_extraction_prompt(content: &str, context: &ContentContext) -> String {
    let context_block = context
        .render()
        .map(|c| format!("【上下文】\n{}\n\n", c))
        .unwrap_or_default();

    format!(
        "{}【待分析文本】\n{}\n\n【输出格式】\n{}\n\n\
         dependsOn 填写本声明所依赖的其他声明在列表中的位置（从 0 开始）。",
        context_block, content, EXTRACTION_SCHEMA
    )
}

/// 共享上下文：整篇内容 + 上下文，跨声明保持不变
fn shared_context_block(content: &str, context: &ContentContext) -> String {
    let context_block = context
        .render()
        .map(|c| format!("【上下文】\n{}\n\n", c))
        .unwrap_or_default();
    format!("{}【原文】\n{}", context_block, content)
}

fn claim_block(claim: &Claim, dependencies: &[&Claim]) -> String {
    let mut block = format!(
        "{}\n类型: {:?}\n{}\n内容: {}\n</claim>",
        claim_tag(claim.index),
        claim.kind,
        if claim.explicit { "原文明确陈述" } else { "由原文推断" },
        claim.text
    );

    if !dependencies.is_empty() {
        block.push_str("\n\n【依赖的前提声明】");
        for dep in dependencies {
            block.push_str(&format!("\n- #{}: {}", dep.index, dep.text));
        }
    }

    block
}

/// 完整上下文版本：原文放在 user prompt 中
pub fn build_analysis_prompt_full(
    claim: &Claim,
    dependencies: &[&Claim],
    content: &str,
    context: &ContentContext,
) -> (String, String) {
    let user = format!(
        "{}\n\n【待评估声明】\n{}\n\n【输出格式】\n{}\n分数为 1-10 的整数。",
        shared_context_block(content, context),
        claim_block(claim, dependencies),
        ANALYSIS_SCHEMA
    );
    (ANALYSIS_SYSTEM_PROMPT.to_string(), user)
}

/// 可缓存版本：原文作为稳定前缀放在 system prompt 中，user prompt 只有声明本身
pub fn build_analysis_prompt_cached(
    claim: &Claim,
    dependencies: &[&Claim],
    content: &str,
    context: &ContentContext,
) -> (String, String) {
    let system = format!(
        "{}\n\n{}\n\n【输出格式】\n{}\n分数为 1-10 的整数。",
        ANALYSIS_SYSTEM_PROMPT,
        shared_context_block(content, context),
        ANALYSIS_SCHEMA
    );
    let user = format!("【待评估声明】\n{}", claim_block(claim, dependencies));
    (system, user)
}

/// 构建综合提示词
pub fn build_synthesis_prompt(
    claims: &[Claim],
    analyses: &[ClaimAnalysis],
    content: Option<&str>,
    context: &ContentContext,
) -> String {
    let mut prompt = String::new();

    if let Some(ctx) = context.render() {
        prompt.push_str(&format!("【上下文】\n{}\n\n", ctx));
    }
    if let Some(content) = content {
        prompt.push_str(&format!("【原文】\n{}\n\n", content));
    }

    prompt.push_str("【逐条分析】\n");
    for analysis in analyses {
        let text = claims
            .iter()
            .find(|c| c.index == analysis.claim_index)
            .map(|c| c.text.as_str())
            .unwrap_or("");
        if analysis.is_completed() {
            prompt.push_str(&format!(
                "- #{} {}\n  有效性 {}/10, 证据 {}/10, 谬误: [{}], 假设: [{}]\n",
                analysis.claim_index,
                text,
                analysis.validity_score,
                analysis.evidence_score,
                analysis.fallacies.join(", "),
                analysis.assumptions.join(", ")
            ));
        } else {
            prompt.push_str(&format!("- #{} {}\n  (分析失败，未纳入评分)\n", analysis.claim_index, text));
        }
    }

    prompt.push_str(&format!(
        "\n【输出格式】\n{}\nscore 为 0-100 的整数。",
        SYNTHESIS_SCHEMA
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClaimKind, Complexity};

    fn claim(index: usize, text: &str) -> Claim {
        Claim {
            index,
            text: text.into(),
            kind: ClaimKind::Evaluative,
            explicit: false,
            complexity: Complexity::Moderate,
            complexity_confidence: 0.5,
            depends_on: vec![],
        }
    }

    #[test]
    fn test_cached_variant_keeps_content_out_of_user_prompt() {
        let c = claim(3, "减税会提高就业");
        let (system, user) =
            build_analysis_prompt_cached(&c, &[], "全文内容ABC", &ContentContext::default());
        assert!(system.starts_with(ANALYSIS_SYSTEM_PROMPT));
        assert!(system.contains("全文内容ABC"));
        assert!(!user.contains("全文内容ABC"));
        assert!(user.contains(&claim_tag(3)));
    }

    #[test]
    fn test_full_variant_includes_dependencies() {
        let dep = claim(0, "税负过高");
        let c = claim(1, "应当减税");
        let (system, user) =
            build_analysis_prompt_full(&c, &[&dep], "全文", &ContentContext::default());
        assert_eq!(system, ANALYSIS_SYSTEM_PROMPT);
        assert!(user.contains("#0: 税负过高"));
        assert!(user.contains("全文"));
    }
}
