use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use claim_audit::clients::{Completion, CompletionRequest, ModelProvider};
use claim_audit::error::{AppError, ProviderError, SessionError};
use claim_audit::models::{AnalysisSession, ClaimAnalysis, Label, Pass, SessionStatus};
use claim_audit::services::prompts::{
    claim_tag, ANALYSIS_SYSTEM_PROMPT, EXTRACTION_SYSTEM_PROMPT, SYNTHESIS_SYSTEM_PROMPT,
};
use claim_audit::session::{ClaimStore, MemoryStore, SessionStore};
use claim_audit::{
    Config, ContentContext, Pipeline, PipelineContext, ProgressEmitter, ProgressEvent,
    ResumeAction, RunOptions,
};

const CONTENT: &str = "我们应当提高公共交通补贴。城市拥堵日益严重。补贴能减少私家车出行。";

/// 模型对某一次调用的表现
#[derive(Debug, Clone, Copy)]
enum Behavior {
    Ok,
    Transient,
    Fatal,
    /// 永不返回，模拟进程在调用途中中断
    Hang,
    /// 等 `gate` 放行后正常返回
    Gate,
}

/// 按提示词类型和声明编号返回脚本化响应的模型
struct ScriptedProvider {
    claim_count: usize,
    analysis: Mutex<HashMap<usize, Behavior>>,
    synthesis: Mutex<Behavior>,
    extraction_calls: AtomicUsize,
    synthesis_calls: AtomicUsize,
    analyzed: Mutex<Vec<usize>>,
    gate: tokio::sync::Semaphore,
}

impl ScriptedProvider {
    fn new(claim_count: usize) -> Arc<Self> {
        Arc::new(Self {
            claim_count,
            analysis: Mutex::new(HashMap::new()),
            synthesis: Mutex::new(Behavior::Ok),
            extraction_calls: AtomicUsize::new(0),
            synthesis_calls: AtomicUsize::new(0),
            analyzed: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    fn set_claim(&self, index: usize, behavior: Behavior) {
        self.analysis.lock().unwrap().insert(index, behavior);
    }

    fn set_synthesis(&self, behavior: Behavior) {
        *self.synthesis.lock().unwrap() = behavior;
    }

    fn analyzed(&self) -> Vec<usize> {
        let mut calls = self.analyzed.lock().unwrap().clone();
        calls.sort_unstable();
        calls
    }

    fn reset_analyzed(&self) {
        self.analyzed.lock().unwrap().clear();
    }

    fn extraction_response(&self) -> String {
        let claims: Vec<serde_json::Value> = (0..self.claim_count)
            .map(|i| {
                serde_json::json!({
                    "text": format!("声明 {}", i),
                    "type": "factual",
                    "complexity": "simple",
                    "complexityConfidence": 0.9
                })
            })
            .collect();
        serde_json::json!({ "claims": claims }).to_string()
    }

    async fn respond(&self, behavior: Behavior, model: &str, text: String) -> Result<Completion, ProviderError> {
        match behavior {
            Behavior::Gate => {
                let _permit = self.gate.acquire().await.unwrap();
                Ok(Completion {
                    text,
                    input_tokens: 100,
                    output_tokens: 20,
                })
            }
            Behavior::Ok => Ok(Completion {
                text,
                input_tokens: 100,
                output_tokens: 20,
            }),
            Behavior::Transient => Err(ProviderError::Transient {
                model: model.to_string(),
                message: "rate limited".to_string(),
            }),
            Behavior::Fatal => Err(ProviderError::Fatal {
                model: model.to_string(),
                message: "invalid api key".to_string(),
            }),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let system = request.system_prompt.as_str();
        if system.starts_with(EXTRACTION_SYSTEM_PROMPT) {
            self.extraction_calls.fetch_add(1, Ordering::SeqCst);
            let text = self.extraction_response();
            return self.respond(Behavior::Ok, &request.model, text).await;
        }
        if system.starts_with(SYNTHESIS_SYSTEM_PROMPT) {
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.synthesis.lock().unwrap();
            let text = r#"{"score": 70, "label": "constructive", "summary": "论证基本成立"}"#.to_string();
            return self.respond(behavior, &request.model, text).await;
        }

        assert!(system.starts_with(ANALYSIS_SYSTEM_PROMPT));
        let index = (0..self.claim_count)
            .find(|i| request.user_prompt.contains(&claim_tag(*i)))
            .expect("analysis prompt carries a claim tag");
        let behavior = self
            .analysis
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(Behavior::Ok);
        self.analyzed.lock().unwrap().push(index);
        let text = r#"{"validityScore": 8, "evidenceScore": 6, "fallacies": []}"#.to_string();
        self.respond(behavior, &request.model, text).await
    }
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    store: Arc<MemoryStore>,
    pipeline: Arc<Pipeline>,
}

fn test_config(batch_size: usize) -> Config {
    let mut config = Config::default();
    config.pipeline.batch_size = batch_size;
    config.pipeline.batch_delay_ms = 0;
    config
}

fn harness(claim_count: usize, batch_size: usize) -> Harness {
    let config = test_config(batch_size);
    let provider = ScriptedProvider::new(claim_count);
    let store = Arc::new(MemoryStore::new());
    let ctx = PipelineContext::new(config, provider.clone(), store.clone(), store.clone());
    Harness {
        provider,
        store,
        pipeline: Arc::new(Pipeline::new(ctx)),
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// 运行到第 3 批时挂起，等第 2 批的检查点落盘后中断
async fn interrupted_run(h: &Harness) {
    h.provider.set_claim(2, Behavior::Transient);
    h.provider.set_claim(3, Behavior::Transient);
    h.provider.set_claim(4, Behavior::Hang);
    h.provider.set_claim(5, Behavior::Hang);

    let pipeline = h.pipeline.clone();
    let handle = tokio::spawn(async move {
        pipeline
            .run("s1", CONTENT, ContentContext::default(), RunOptions::default())
            .await
    });

    let mut drained = false;
    for _ in 0..500 {
        let report = h.pipeline.status("s1").await.unwrap();
        if report.claims_failed == 2 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(drained, "second batch never checkpointed");
    handle.abort();
}

#[tokio::test]
async fn test_full_run_uses_model_synthesis() {
    let h = harness(3, 2);
    let (emitter, mut rx) = ProgressEmitter::channel();

    let result = h
        .pipeline
        .run_with_progress("s1", CONTENT, ContentContext::default(), RunOptions::default(), &emitter)
        .await
        .unwrap();

    assert!(result.used_ai);
    assert_eq!(result.label, Label::Constructive);
    assert_eq!(result.claims_analyzed, 3);
    assert_eq!(result.claims_total, 3);
    assert!((result.score - 0.7).abs() < 1e-9);
    // 1 次抽取 + 3 次分析 + 1 次综合
    assert_eq!(result.usage.input_tokens, 500);

    let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec![
            "pass1_complete",
            "pass2_started",
            "pass2_batch_complete",
            "pass2_batch_complete",
            "pass2_complete",
            "pass3_started",
            "pass3_complete",
            "complete",
        ]
    );

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.status, Some(SessionStatus::Completed));
    assert_eq!(report.resume_actions, vec![ResumeAction::StartFresh]);
}

#[tokio::test]
async fn test_interrupted_run_offers_continue_and_retry() {
    let h = harness(6, 2);
    interrupted_run(&h).await;

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.status, Some(SessionStatus::InProgress));
    assert_eq!(report.phase, Some(Pass::Analysis));
    assert_eq!(report.claims_completed, 2);
    assert_eq!(report.claims_failed, 2);
    assert_eq!(
        report.resume_actions,
        vec![
            ResumeAction::Continue,
            ResumeAction::RetryFailed,
            ResumeAction::StartFresh
        ]
    );
}

#[tokio::test]
async fn test_continue_skips_processed_claims() {
    let h = harness(6, 2);
    interrupted_run(&h).await;

    h.provider.set_claim(4, Behavior::Ok);
    h.provider.set_claim(5, Behavior::Ok);
    h.provider.reset_analyzed();

    let (emitter, mut rx) = ProgressEmitter::channel();
    let result = h
        .pipeline
        .resume("s1", ResumeAction::Continue, Some(CONTENT), &emitter)
        .await
        .unwrap();

    assert_eq!(h.provider.analyzed(), vec![4, 5]);
    assert_eq!(h.provider.extraction_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.claims_total, 6);
    assert_eq!(result.claims_analyzed, 4);
    assert_eq!(result.claims.len(), 6);

    let events = drain(&mut rx);
    match &events[0] {
        ProgressEvent::Pass2Started { claims_to_process, .. } => assert_eq!(*claims_to_process, 2),
        other => panic!("unexpected first event: {:?}", other),
    }
    assert_eq!(events.last().map(|e| e.name()), Some("complete"));
}

#[tokio::test]
async fn test_retry_failed_reprocesses_failed_and_unprocessed() {
    let h = harness(6, 2);
    interrupted_run(&h).await;

    for index in 2..6 {
        h.provider.set_claim(index, Behavior::Ok);
    }
    h.provider.reset_analyzed();

    let result = h
        .pipeline
        .resume("s1", ResumeAction::RetryFailed, Some(CONTENT), &ProgressEmitter::silent())
        .await
        .unwrap();

    assert_eq!(h.provider.analyzed(), vec![2, 3, 4, 5]);
    assert_eq!(result.claims_analyzed, 6);
    assert!(result.claims.iter().all(|c| c.is_completed()));
}

#[tokio::test]
async fn test_all_claims_failed_is_incomplete() {
    let h = harness(3, 5);
    for index in 0..3 {
        h.provider.set_claim(index, Behavior::Transient);
    }

    let result = h
        .pipeline
        .run("s1", CONTENT, ContentContext::default(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.label, Label::Incomplete);
    assert!(!result.used_ai);
    assert_eq!(result.claims_analyzed, 0);
    assert_eq!(h.provider.synthesis_calls.load(Ordering::SeqCst), 0);

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.status, Some(SessionStatus::Completed));
}

#[tokio::test]
async fn test_zero_claims_yields_no_claims_label() {
    let h = harness(0, 5);

    let result = h
        .pipeline
        .run("s1", CONTENT, ContentContext::default(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.label, Label::NoClaims);
    assert_eq!(result.score, 0.5);
    assert_eq!(result.claims_total, 0);
    assert!(h.provider.analyzed().is_empty());

    // 没有批次运行过，批次号保持为空
    let sessions = h.store.sessions_for("s1").unwrap();
    assert_eq!(sessions[0].status, SessionStatus::Completed);
    assert_eq!(sessions[0].last_batch_index, None);
}

#[tokio::test]
async fn test_fatal_provider_error_fails_session() {
    let h = harness(4, 2);
    h.provider.set_claim(1, Behavior::Fatal);
    let (emitter, mut rx) = ProgressEmitter::channel();

    let err = h
        .pipeline
        .run_with_progress("s1", CONTENT, ContentContext::default(), RunOptions::default(), &emitter)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ClaimAnalysis(_)));

    // 第 2 批不会开始
    assert_eq!(h.provider.analyzed(), vec![0, 1]);

    let events = drain(&mut rx);
    let terminals: Vec<&ProgressEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    match terminals[0] {
        ProgressEvent::Error { phase, .. } => assert_eq!(*phase, Some(Pass::Analysis)),
        other => panic!("unexpected terminal event: {:?}", other),
    }

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.status, Some(SessionStatus::Failed));
    assert!(report.error_message.is_some());
    assert!(report.resume_actions.contains(&ResumeAction::RetryFailed));
}

#[tokio::test]
async fn test_resynthesize_makes_no_extraction_or_analysis_calls() {
    let h = harness(3, 5);
    h.provider.set_synthesis(Behavior::Fatal);

    let err = h
        .pipeline
        .run("s1", CONTENT, ContentContext::default(), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Synthesis(_)));

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.status, Some(SessionStatus::Failed));
    assert_eq!(
        report.resume_actions,
        vec![ResumeAction::Resynthesize, ResumeAction::StartFresh]
    );

    // 内容不一致直接拒绝
    let mismatch = h
        .pipeline
        .resume("s1", ResumeAction::Resynthesize, Some("另一段内容"), &ProgressEmitter::silent())
        .await
        .unwrap_err();
    assert!(matches!(
        mismatch,
        AppError::Session(SessionError::ContentMismatch { .. })
    ));

    h.provider.set_synthesis(Behavior::Ok);
    h.provider.reset_analyzed();
    let result = h
        .pipeline
        .resume("s1", ResumeAction::Resynthesize, None, &ProgressEmitter::silent())
        .await
        .unwrap();

    assert!(result.used_ai);
    assert_eq!(result.claims_analyzed, 3);
    assert_eq!(h.provider.extraction_calls.load(Ordering::SeqCst), 1);
    assert!(h.provider.analyzed().is_empty());
    assert_eq!(h.provider.synthesis_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unavailable_action_is_rejected() {
    let h = harness(2, 5);
    h.pipeline
        .run("s1", CONTENT, ContentContext::default(), RunOptions::default())
        .await
        .unwrap();

    let err = h
        .pipeline
        .resume("s1", ResumeAction::Continue, Some(CONTENT), &ProgressEmitter::silent())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Session(SessionError::InvalidResume { .. })));

    let missing = h
        .pipeline
        .resume("nobody", ResumeAction::Resynthesize, None, &ProgressEmitter::silent())
        .await
        .unwrap_err();
    assert!(matches!(missing, AppError::Session(SessionError::NotFound { .. })));
}

#[tokio::test]
async fn test_start_fresh_abandons_interrupted_session() {
    let h = harness(6, 2);
    interrupted_run(&h).await;

    for index in 2..6 {
        h.provider.set_claim(index, Behavior::Ok);
    }

    let result = h
        .pipeline
        .resume("s1", ResumeAction::StartFresh, Some(CONTENT), &ProgressEmitter::silent())
        .await
        .unwrap();
    assert_eq!(result.claims_analyzed, 6);

    let sessions = h.store.sessions_for("s1").unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].status, SessionStatus::Abandoned);
    assert_eq!(sessions[1].status, SessionStatus::Completed);
    assert_eq!(sessions[1].id, result.session_id);
}

#[tokio::test]
async fn test_superseded_run_stops_without_rewriting_its_session() {
    let h = harness(4, 2);
    h.provider.set_claim(0, Behavior::Gate);
    h.provider.set_claim(1, Behavior::Gate);

    let pipeline = h.pipeline.clone();
    let (emitter, mut rx) = ProgressEmitter::channel();
    let orphan = tokio::spawn(async move {
        pipeline
            .run_with_progress("s1", CONTENT, ContentContext::default(), RunOptions::default(), &emitter)
            .await
    });

    let mut started = false;
    for _ in 0..500 {
        if h.provider.analyzed().len() == 2 {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(started, "first batch never started");

    // 新运行取代仍在等待模型的旧运行
    h.provider.set_claim(0, Behavior::Ok);
    h.provider.set_claim(1, Behavior::Ok);
    let fresh = h
        .pipeline
        .resume("s1", ResumeAction::StartFresh, Some(CONTENT), &ProgressEmitter::silent())
        .await
        .unwrap();
    assert_eq!(fresh.claims_analyzed, 4);

    h.provider.reset_analyzed();
    h.provider.gate.add_permits(10);
    let err = orphan.await.unwrap().unwrap_err();
    assert!(matches!(err, AppError::Session(SessionError::Superseded { .. })));

    // 旧运行在第一批之后停止，不再调用模型
    assert!(h.provider.analyzed().is_empty());

    let sessions = h.store.sessions_for("s1").unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].status, SessionStatus::Abandoned);
    assert_eq!(sessions[1].status, SessionStatus::Completed);
    assert_eq!(sessions[1].id, fresh.session_id);

    let report = h.pipeline.status("s1").await.unwrap();
    assert_eq!(report.session_id.as_deref(), Some(fresh.session_id.as_str()));
    assert_eq!(report.status, Some(SessionStatus::Completed));

    let events = drain(&mut rx);
    let terminals: Vec<&ProgressEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(matches!(terminals[0], ProgressEvent::Error { .. }));
}

/// 每次读写都失败的存储
struct BrokenStore;

fn broken(operation: &str) -> SessionError {
    SessionError::Store {
        operation: operation.to_string(),
        message: "disk full".to_string(),
    }
}

#[async_trait]
impl SessionStore for BrokenStore {
    async fn create(&self, _session: &AnalysisSession) -> Result<(), SessionError> {
        Err(broken("create"))
    }

    async fn update(&self, _session: &AnalysisSession) -> Result<(), SessionError> {
        Err(broken("update"))
    }

    async fn get_latest(&self, _subject_id: &str) -> Result<Option<AnalysisSession>, SessionError> {
        Err(broken("get_latest"))
    }
}

#[async_trait]
impl ClaimStore for BrokenStore {
    async fn upsert(
        &self,
        _subject_id: &str,
        _session_id: &str,
        _records: &[ClaimAnalysis],
    ) -> Result<(), SessionError> {
        Err(broken("upsert"))
    }

    async fn query(&self, _subject_id: &str, _session_id: &str) -> Result<Vec<ClaimAnalysis>, SessionError> {
        Err(broken("query"))
    }
}

#[tokio::test]
async fn test_failing_store_still_produces_result() {
    let provider = ScriptedProvider::new(3);
    let store = Arc::new(BrokenStore);
    let ctx = PipelineContext::new(test_config(2), provider.clone(), store.clone(), store);
    let pipeline = Pipeline::new(ctx);
    let (emitter, mut rx) = ProgressEmitter::channel();

    let result = pipeline
        .run_with_progress("s1", CONTENT, ContentContext::default(), RunOptions::default(), &emitter)
        .await
        .unwrap();

    assert!(result.used_ai);
    assert_eq!(result.claims_analyzed, 3);
    assert_eq!(provider.analyzed(), vec![0, 1, 2]);

    let events = drain(&mut rx);
    assert_eq!(events.last().map(|e| e.name()), Some("complete"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    // 读取失败照常报错
    let err = pipeline.status("s1").await.unwrap_err();
    assert!(matches!(err, AppError::Session(SessionError::Store { .. })));
}
