//! 三阶段流水线 - 编排层
//!
//! ## 职责
//!
//! 按顺序驱动 抽取 → 逐条分析 → 综合，在每个关键节点更新会话检查点并发出进度事件。
//!
//! ## 入口
//!
//! - `run`：完整运行，不关心进度
//! - `run_with_progress`：完整运行，发出进度事件
//! - `resume`：从已有会话的第 2 / 3 阶段继续，或重新开始
//! - `status`：会话状态与可用的恢复动作
//!
//! 所有依赖（模型、存储、配置）通过 `PipelineContext` 注入，没有全局状态。

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clients::ModelProvider;
use crate::config::Config;
use crate::error::{AppError, AppResult, ClaimAnalysisError, SessionError};
use crate::models::{
    merge_analyses, AnalysisSession, Claim, ClaimAnalysis, ContentContext, Pass, PipelineResult,
    TokenUsage,
};
use crate::orchestrator::batch_processor::{
    BatchConfig, BatchControl, BatchItemResult, BatchObserver, BatchProcessor, BatchProgress,
    ItemError, Keyed,
};
use crate::progress::ProgressEmitter;
use crate::services::{
    ClaimAnalysisService, CostEstimator, ExtractionService, SynthesisOutput, SynthesisService,
};
use crate::session::{
    actions_for, Checkpointer, ClaimStore, MemoryStore, ResumeAction, SessionStore, StatusReport,
    WriteOutcome,
};
use crate::utils::logging::truncate_text;

/// 流水线依赖
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Config,
    pub provider: Arc<dyn ModelProvider>,
    pub sessions: Arc<dyn SessionStore>,
    pub claims: Arc<dyn ClaimStore>,
}

impl PipelineContext {
    pub fn new(
        config: Config,
        provider: Arc<dyn ModelProvider>,
        sessions: Arc<dyn SessionStore>,
        claims: Arc<dyn ClaimStore>,
    ) -> Self {
        Self {
            config,
            provider,
            sessions,
            claims,
        }
    }

    /// 使用内存存储
    pub fn in_memory(config: Config, provider: Arc<dyn ModelProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, provider, store.clone(), store)
    }
}

/// 单次运行选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// 不限制声明数量
    pub no_cap: bool,
}

/// 已校验的恢复计划，由 `prepare_resume` 生成
#[derive(Debug, Clone)]
pub enum ResumePlan {
    /// 新建会话，从第 1 阶段开始
    Fresh {
        subject_id: String,
        content: String,
        context: ContentContext,
    },
    /// 在原会话上重新进入第 2 阶段
    Analyze {
        action: ResumeAction,
        session: AnalysisSession,
        content: String,
    },
    /// 在原会话上只重新执行第 3 阶段
    Resynthesize {
        session: AnalysisSession,
        content: Option<String>,
    },
}

impl ResumePlan {
    pub fn action(&self) -> ResumeAction {
        match self {
            ResumePlan::Fresh { .. } => ResumeAction::StartFresh,
            ResumePlan::Analyze { action, .. } => *action,
            ResumePlan::Resynthesize { .. } => ResumeAction::Resynthesize,
        }
    }
}

/// 内容哈希（SHA-256 十六进制）
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// 第 2 阶段的工作项
struct ClaimJob {
    index: usize,
}

impl Keyed for ClaimJob {
    fn key(&self) -> usize {
        self.index
    }
}

/// 本次运行累计的 token 和费用
#[derive(Debug, Clone, Copy, Default)]
struct RunTotals {
    usage: TokenUsage,
    cost_usd: f64,
    grouped_count: usize,
}

/// 流水线
pub struct Pipeline {
    extraction: ExtractionService,
    analysis: Arc<ClaimAnalysisService>,
    synthesis: SynthesisService,
    checkpoints: Checkpointer,
    batch_config: BatchConfig,
    cost: CostEstimator,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        let config = &ctx.config;
        Self {
            extraction: ExtractionService::new(ctx.provider.clone(), config),
            analysis: Arc::new(ClaimAnalysisService::new(ctx.provider.clone(), config)),
            synthesis: SynthesisService::new(ctx.provider.clone(), config),
            checkpoints: Checkpointer::new(ctx.sessions.clone(), ctx.claims.clone()),
            batch_config: BatchConfig::from_config(config),
            cost: CostEstimator::new(config.pricing.clone()),
        }
    }

    /// 完整运行，不发出进度事件
    pub async fn run(
        &self,
        subject_id: &str,
        content: &str,
        context: ContentContext,
        options: RunOptions,
    ) -> AppResult<PipelineResult> {
        self.run_with_progress(subject_id, content, context, options, &ProgressEmitter::silent())
            .await
    }

    /// 完整运行并发出进度事件
    pub async fn run_with_progress(
        &self,
        subject_id: &str,
        content: &str,
        context: ContentContext,
        options: RunOptions,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        let mut session = AnalysisSession::new(subject_id, content_hash(content), context);
        log_run_start(&session, content, "run");
        self.checkpoints.create(&session).await;

        let outcome = self.execute_fresh(&mut session, content, options, emitter).await;
        self.finish(&mut session, outcome, emitter).await
    }

    /// 校验恢复请求，不修改任何状态
    pub async fn prepare_resume(
        &self,
        subject_id: &str,
        action: ResumeAction,
        content: Option<&str>,
    ) -> AppResult<ResumePlan> {
        let latest = self.checkpoints.load_latest(subject_id).await?;

        if action == ResumeAction::StartFresh {
            let content = content
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| AppError::invalid_resume(action.as_str(), "重新开始需要提供内容"))?;
            return Ok(ResumePlan::Fresh {
                subject_id: subject_id.to_string(),
                content: content.to_string(),
                context: latest.map(|s| s.context).unwrap_or_default(),
            });
        }

        let session = latest.ok_or_else(|| SessionError::NotFound {
            subject_id: subject_id.to_string(),
        })?;

        let allowed = actions_for(Some(&session));
        if !allowed.contains(&action) || !session.has_snapshot() {
            let allowed: Vec<&str> = allowed.iter().map(|a| a.as_str()).collect();
            return Err(AppError::invalid_resume(
                action.as_str(),
                format!(
                    "会话状态 {} / {}，可用动作: {}",
                    session.status.as_str(),
                    session.current_pass,
                    allowed.join(", ")
                ),
            ));
        }

        if let Some(content) = content {
            if content_hash(content) != session.content_hash {
                return Err(SessionError::ContentMismatch {
                    subject_id: subject_id.to_string(),
                }
                .into());
            }
        }

        match action {
            ResumeAction::Resynthesize => Ok(ResumePlan::Resynthesize {
                session,
                content: content.map(str::to_string),
            }),
            _ => {
                let content = content.ok_or_else(|| {
                    AppError::invalid_resume(action.as_str(), "继续分析需要提供原始内容")
                })?;
                Ok(ResumePlan::Analyze {
                    action,
                    session,
                    content: content.to_string(),
                })
            }
        }
    }

    /// 执行已校验的恢复计划
    pub async fn execute_resume(
        &self,
        plan: ResumePlan,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        match plan {
            ResumePlan::Fresh {
                subject_id,
                content,
                context,
            } => {
                self.run_with_progress(&subject_id, &content, context, RunOptions::default(), emitter)
                    .await
            }
            ResumePlan::Analyze {
                action,
                mut session,
                content,
            } => {
                log_run_start(&session, &content, action.as_str());
                session.reopen(Pass::Analysis);

                let outcome = self
                    .execute_reanalysis(&mut session, action, &content, emitter)
                    .await;
                self.finish(&mut session, outcome, emitter).await
            }
            ResumePlan::Resynthesize {
                mut session,
                content,
            } => {
                info!("[主题 {}] 🔁 重新综合 (会话 {})", session.subject_id, session.id);
                session.reopen(Pass::Synthesis);

                let outcome = self
                    .execute_resynthesis(&mut session, content.as_deref(), emitter)
                    .await;
                self.finish(&mut session, outcome, emitter).await
            }
        }
    }

    /// 恢复入口：校验后执行
    pub async fn resume(
        &self,
        subject_id: &str,
        action: ResumeAction,
        content: Option<&str>,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        let plan = self.prepare_resume(subject_id, action, content).await?;
        self.execute_resume(plan, emitter).await
    }

    /// 查询会话状态
    pub async fn status(&self, subject_id: &str) -> AppResult<StatusReport> {
        let latest = self.checkpoints.load_latest(subject_id).await?;
        Ok(StatusReport::new(subject_id, latest.as_ref()))
    }

    // ========== 各阶段 ==========

    async fn execute_fresh(
        &self,
        session: &mut AnalysisSession,
        content: &str,
        options: RunOptions,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        // 第 1 阶段
        let extraction = self
            .extraction
            .extract(content, &session.context, options.no_cap)
            .await?;

        let mut totals = RunTotals {
            usage: extraction.usage,
            cost_usd: self.cost.estimate(&extraction.model, extraction.usage),
            grouped_count: extraction.grouped_count,
        };

        session.store_snapshot(extraction.claims.clone())?;
        self.checkpoint(session).await?;
        emitter.pass1_complete(
            extraction.claims.len(),
            extraction.grouped_count,
            extraction.too_many_claims,
        );

        // 第 2 阶段
        let claims = Arc::new(extraction.claims);
        let targets: Vec<usize> = (0..claims.len()).collect();
        let analyses = self
            .analyze_claims(session, claims.clone(), content, Vec::new(), targets, emitter)
            .await?;

        // 第 3 阶段
        self.synthesize(session, &claims, analyses, Some(content), &mut totals, emitter)
            .await
    }

    async fn execute_reanalysis(
        &self,
        session: &mut AnalysisSession,
        action: ResumeAction,
        content: &str,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        self.checkpoint(session).await?;
        let claims = Arc::new(snapshot(session)?);
        let prior = self.checkpoints.load_claims(session).await?;

        let targets = select_targets(claims.len(), &prior, action);
        info!(
            "[主题 {}] 已有 {} 条记录，本次处理 {} 条声明",
            session.subject_id,
            prior.len(),
            targets.len()
        );

        let analyses = self
            .analyze_claims(session, claims.clone(), content, prior, targets, emitter)
            .await?;

        let mut totals = RunTotals::default();
        self.synthesize(session, &claims, analyses, Some(content), &mut totals, emitter)
            .await
    }

    async fn execute_resynthesis(
        &self,
        session: &mut AnalysisSession,
        content: Option<&str>,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        self.checkpoint(session).await?;
        let claims = snapshot(session)?;
        let analyses = self.checkpoints.load_claims(session).await?;
        let mut totals = RunTotals::default();
        self.synthesize(session, &claims, analyses, content, &mut totals, emitter)
            .await
    }

    /// 第 2 阶段：按批分析 `targets` 中的声明，结果合并进 `prior`
    async fn analyze_claims(
        &self,
        session: &mut AnalysisSession,
        claims: Arc<Vec<Claim>>,
        content: &str,
        prior: Vec<ClaimAnalysis>,
        targets: Vec<usize>,
        emitter: &ProgressEmitter,
    ) -> AppResult<Vec<ClaimAnalysis>> {
        let total_batches = self.batch_config.total_batches(targets.len());
        emitter.pass2_started(targets.len(), total_batches);
        info!(
            "[主题 {}] 🔍 第 2 阶段: {} 条声明, {} 批",
            session.subject_id,
            targets.len(),
            total_batches
        );

        let service = self.analysis.clone();
        let shared_claims = claims.clone();
        let shared_content: Arc<str> = Arc::from(content);
        let context = Arc::new(session.context.clone());
        let claim_count = claims.len();

        let operation = move |job: ClaimJob| {
            let service = service.clone();
            let claims = shared_claims.clone();
            let content = shared_content.clone();
            let context = context.clone();
            async move {
                let claim = &claims[job.index];
                let dependencies: Vec<&Claim> = claim
                    .depends_on
                    .iter()
                    .filter_map(|dep| claims.get(*dep))
                    .collect();
                service
                    .analyze(claim, &dependencies, &content, &context, claim_count)
                    .await
            }
        };

        let batch_offset = session.last_batch_index.map_or(0, |i| i + 1);
        let mut observer = AnalysisObserver {
            checkpoints: &self.checkpoints,
            session,
            emitter,
            merged: prior,
            batch_offset,
            fatal: None,
            superseded: false,
        };

        let processor = BatchProcessor::new(self.batch_config)
            .with_label(format!("[主题 {}]", observer.session.subject_id));
        let jobs: Vec<ClaimJob> = targets.into_iter().map(|index| ClaimJob { index }).collect();
        processor.run(jobs, operation, &mut observer).await;

        let AnalysisObserver {
            session,
            merged,
            fatal,
            superseded,
            ..
        } = observer;

        if superseded {
            return Err(superseded_error(session));
        }
        if let Some(fatal) = fatal {
            error!(
                "[主题 {}] ❌ 致命的模型错误，终止运行: {}",
                session.subject_id, fatal
            );
            return Err(fatal.into());
        }

        let (completed, failed) = count_statuses(&merged);
        session.record_counts(completed, failed);
        session.advance_to(Pass::Synthesis)?;
        self.checkpoint(session).await?;
        emitter.pass2_complete(completed, failed);
        info!(
            "[主题 {}] ✓ 第 2 阶段完成: 成功 {}, 失败 {}",
            session.subject_id, completed, failed
        );

        Ok(merged)
    }

    /// 第 3 阶段：综合并组装最终结果
    async fn synthesize(
        &self,
        session: &AnalysisSession,
        claims: &[Claim],
        analyses: Vec<ClaimAnalysis>,
        content: Option<&str>,
        totals: &mut RunTotals,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        emitter.pass3_started();
        info!("[主题 {}] 🧩 第 3 阶段: 综合", session.subject_id);

        for analysis in &analyses {
            totals.usage += analysis.usage;
            totals.cost_usd += self.cost.estimate(&analysis.model_used, analysis.usage);
        }

        let output = self
            .synthesis
            .synthesize(claims, &analyses, content, &session.context)
            .await?;

        emitter.pass3_complete(output.used_ai);
        totals.usage += output.usage;
        if let Some(model) = &output.model {
            totals.cost_usd += self.cost.estimate(model, output.usage);
        }

        Ok(build_result(session, claims.len(), analyses, output, totals))
    }

    /// 收尾：更新会话终态，发出唯一的终止事件
    async fn finish(
        &self,
        session: &mut AnalysisSession,
        outcome: AppResult<PipelineResult>,
        emitter: &ProgressEmitter,
    ) -> AppResult<PipelineResult> {
        let outcome = match outcome {
            Ok(result) => {
                session.mark_completed();
                self.checkpoint(session).await.map(|()| result)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                log_run_complete(&result);
                emitter.complete(result.clone());
                Ok(result)
            }
            Err(e) if e.is_superseded() => {
                // 会话已归新运行所有，不再改写它的状态
                warn!("[主题 {}] ⚠️ 运行已被取代，停止: {}", session.subject_id, e);
                emitter.error(Some(session.current_pass), e.to_string());
                Err(e)
            }
            Err(e) => {
                let phase = e.phase_hint().unwrap_or(session.current_pass);
                error!("[主题 {}] ❌ 运行失败 ({}): {}", session.subject_id, phase, e);
                session.mark_failed(phase, e.to_string());
                self.checkpoints.save_session(session).await;
                emitter.error(Some(phase), e.to_string());
                Err(e)
            }
        }
    }

    /// 写会话检查点；存储失败照常继续，会话已被放弃时返回错误
    async fn checkpoint(&self, session: &AnalysisSession) -> AppResult<()> {
        match self.checkpoints.save_session(session).await {
            WriteOutcome::Superseded => Err(superseded_error(session)),
            WriteOutcome::Saved | WriteOutcome::Failed => Ok(()),
        }
    }
}

fn superseded_error(session: &AnalysisSession) -> AppError {
    SessionError::Superseded {
        session_id: session.id.clone(),
    }
    .into()
}

/// 第 2 阶段的批次观察者：合并结果、写检查点、发进度
struct AnalysisObserver<'a> {
    checkpoints: &'a Checkpointer,
    session: &'a mut AnalysisSession,
    emitter: &'a ProgressEmitter,
    merged: Vec<ClaimAnalysis>,
    batch_offset: usize,
    fatal: Option<ClaimAnalysisError>,
    /// 写入被拒绝：会话已被放弃
    superseded: bool,
}

#[async_trait]
impl<'a> BatchObserver<ClaimAnalysis, ClaimAnalysisError> for AnalysisObserver<'a> {
    async fn on_batch_complete(
        &mut self,
        progress: &BatchProgress<ClaimAnalysis, ClaimAnalysisError>,
    ) -> BatchControl {
        let records: Vec<ClaimAnalysis> = progress.results.iter().map(to_record).collect();

        if self.fatal.is_none() {
            self.fatal = progress.results.iter().find_map(|r| match &r.outcome {
                Err(ItemError::Failed(e)) if e.is_fatal() => Some(e.clone()),
                _ => None,
            });
        }

        let prior = std::mem::take(&mut self.merged);
        self.merged = merge_analyses(prior, records.clone());
        let (completed, failed) = count_statuses(&self.merged);

        self.session
            .record_progress(completed, failed, self.batch_offset + progress.batch_index);
        self.checkpoints.save_claims(self.session, &records).await;
        if self.checkpoints.save_session(self.session).await == WriteOutcome::Superseded {
            self.superseded = true;
        }

        self.emitter.pass2_batch_complete(
            progress.batch_index,
            progress.total_batches,
            progress.succeeded,
            progress.failed,
            records,
        );

        if self.fatal.is_some() || self.superseded {
            BatchControl::Stop
        } else {
            BatchControl::Continue
        }
    }
}

fn to_record(result: &BatchItemResult<ClaimAnalysis, ClaimAnalysisError>) -> ClaimAnalysis {
    match &result.outcome {
        Ok(analysis) => analysis.clone(),
        Err(ItemError::Failed(e)) => {
            warn!("⚠️ {}", e);
            let mut record =
                ClaimAnalysis::failed(e.claim_index, e.model.clone(), e.kind.to_string());
            record.usage = e.usage;
            record
        }
        Err(ItemError::Aborted(message)) => {
            ClaimAnalysis::failed(result.key, String::new(), message.clone())
        }
    }
}

fn count_statuses(records: &[ClaimAnalysis]) -> (usize, usize) {
    let completed = records.iter().filter(|r| r.is_completed()).count();
    (completed, records.len() - completed)
}

fn snapshot(session: &AnalysisSession) -> Result<Vec<Claim>, SessionError> {
    session
        .extracted_claims
        .clone()
        .ok_or_else(|| SessionError::InvalidResume {
            action: "resume".to_string(),
            reason: "会话没有声明快照".to_string(),
        })
}

/// 恢复时要处理的声明：continue 只处理没有记录的，retry_failed 还包括失败的
fn select_targets(claim_count: usize, prior: &[ClaimAnalysis], action: ResumeAction) -> Vec<usize> {
    let done: BTreeSet<usize> = prior
        .iter()
        .filter(|r| action != ResumeAction::RetryFailed || r.is_completed())
        .map(|r| r.claim_index)
        .collect();

    (0..claim_count).filter(|i| !done.contains(i)).collect()
}

fn build_result(
    session: &AnalysisSession,
    claims_total: usize,
    analyses: Vec<ClaimAnalysis>,
    output: SynthesisOutput,
    totals: &RunTotals,
) -> PipelineResult {
    let claims_analyzed = analyses.iter().filter(|a| a.is_completed()).count();
    PipelineResult {
        subject_id: session.subject_id.clone(),
        session_id: session.id.clone(),
        score: output.score,
        label: output.label,
        findings: output.findings,
        claims: analyses,
        claims_analyzed,
        claims_total,
        grouped_count: totals.grouped_count,
        usage: totals.usage,
        estimated_cost_usd: totals.cost_usd,
        used_ai: output.used_ai,
    }
}

// ========== 日志辅助函数 ==========

fn log_run_start(session: &AnalysisSession, content: &str, mode: &str) {
    info!("{}", "=".repeat(60));
    info!(
        "🚀 [主题 {}] 开始分析 ({}) - 会话 {}",
        session.subject_id, mode, session.id
    );
    info!("📄 内容: {} 字符 | {}", content.chars().count(), truncate_text(content, 40));
    info!("{}", "=".repeat(60));
}

fn log_run_complete(result: &PipelineResult) {
    info!("{}", "=".repeat(60));
    info!(
        "✅ [主题 {}] 分析完成: {:.2} ({:?}) | 声明 {}/{} | AI 综合: {}",
        result.subject_id,
        result.score,
        result.label,
        result.claims_analyzed,
        result.claims_total,
        result.used_ai
    );
    info!(
        "💰 tokens: {} | 预估费用: ${:.4}",
        result.usage.total(),
        result.estimated_cost_usd
    );
    info!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClaimAnalysisErrorKind, ParseError};
    use crate::models::AnalysisStatus;

    fn record(index: usize, completed: bool) -> ClaimAnalysis {
        let mut r = ClaimAnalysis::failed(index, "m", "e");
        if completed {
            r.status = AnalysisStatus::Completed;
            r.error = None;
        }
        r
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello!"));
    }

    #[test]
    fn test_continue_skips_every_processed_claim() {
        let prior = vec![record(0, true), record(1, false), record(3, true)];
        assert_eq!(select_targets(5, &prior, ResumeAction::Continue), vec![2, 4]);
    }

    #[test]
    fn test_retry_failed_includes_failed_and_unprocessed() {
        let prior = vec![record(0, true), record(1, false), record(3, true)];
        assert_eq!(select_targets(5, &prior, ResumeAction::RetryFailed), vec![1, 2, 4]);
    }

    #[test]
    fn test_failed_record_keeps_spent_usage() {
        let result = BatchItemResult {
            key: 2,
            outcome: Err(ItemError::Failed(ClaimAnalysisError {
                claim_index: 2,
                model: "m".to_string(),
                kind: ClaimAnalysisErrorKind::Parse(ParseError::new("坏 JSON", "{oops")),
                usage: TokenUsage::new(120, 30),
            })),
        };

        let record = to_record(&result);
        assert!(!record.is_completed());
        assert_eq!(record.claim_index, 2);
        assert_eq!(record.usage, TokenUsage::new(120, 30));
    }

    #[test]
    fn test_count_statuses() {
        assert_eq!(count_statuses(&[record(0, true), record(1, false), record(2, true)]), (2, 1));
    }
}
