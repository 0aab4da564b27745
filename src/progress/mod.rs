//! 进度协议 - 流程层
//!
//! 每次运行产生一条有序事件序列：
//!
//! ```text
//! pass1_complete → pass2_started → pass2_batch_complete* → pass2_complete
//!     → pass3_started → pass3_complete → complete
//! ```
//!
//! 致命错误时由 `error` 代替剩余事件。每次运行恰好一个终止事件（`complete` 或 `error`）。
//! 接收端断开后发送变为空操作，运行本身继续。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::debug;

use crate::models::{ClaimAnalysis, Pass, PipelineResult};

/// 进度事件，每个事件都带有距运行开始的毫秒数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    Pass1Complete {
        elapsed_ms: u64,
        claims_total: usize,
        grouped_count: usize,
        too_many_claims: bool,
    },
    Pass2Started {
        elapsed_ms: u64,
        /// 本次要处理的声明数（恢复时可能少于总数）
        claims_to_process: usize,
        total_batches: usize,
    },
    Pass2BatchComplete {
        elapsed_ms: u64,
        batch_index: usize,
        total_batches: usize,
        succeeded: usize,
        failed: usize,
        results: Vec<ClaimAnalysis>,
    },
    Pass2Complete {
        elapsed_ms: u64,
        claims_completed: usize,
        claims_failed: usize,
    },
    Pass3Started {
        elapsed_ms: u64,
    },
    Pass3Complete {
        elapsed_ms: u64,
        used_ai: bool,
    },
    Complete {
        elapsed_ms: u64,
        result: Box<PipelineResult>,
    },
    Error {
        elapsed_ms: u64,
        phase: Option<Pass>,
        message: String,
    },
}

impl ProgressEvent {
    /// 事件名（SSE 的 event 字段）
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Pass1Complete { .. } => "pass1_complete",
            ProgressEvent::Pass2Started { .. } => "pass2_started",
            ProgressEvent::Pass2BatchComplete { .. } => "pass2_batch_complete",
            ProgressEvent::Pass2Complete { .. } => "pass2_complete",
            ProgressEvent::Pass3Started { .. } => "pass3_started",
            ProgressEvent::Pass3Complete { .. } => "pass3_complete",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            ProgressEvent::Pass1Complete { elapsed_ms, .. }
            | ProgressEvent::Pass2Started { elapsed_ms, .. }
            | ProgressEvent::Pass2BatchComplete { elapsed_ms, .. }
            | ProgressEvent::Pass2Complete { elapsed_ms, .. }
            | ProgressEvent::Pass3Started { elapsed_ms }
            | ProgressEvent::Pass3Complete { elapsed_ms, .. }
            | ProgressEvent::Complete { elapsed_ms, .. }
            | ProgressEvent::Error { elapsed_ms, .. } => *elapsed_ms,
        }
    }
}

/// 进度发送端
pub struct ProgressEmitter {
    tx: Option<UnboundedSender<ProgressEvent>>,
    started: Instant,
    terminal_sent: AtomicBool,
}

impl ProgressEmitter {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            started: Instant::now(),
            terminal_sent: AtomicBool::new(false),
        }
    }

    /// 新建发送端和对应的接收端
    pub fn channel() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self::new(tx), rx)
    }

    /// 没有观察者（`run` 使用）
    pub fn silent() -> Self {
        Self {
            tx: None,
            started: Instant::now(),
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// 发送事件；终止事件之后的任何事件都被丢弃。返回事件是否被接收端收下
    pub fn emit(&self, event: ProgressEvent) -> bool {
        if event.is_terminal() {
            if self.terminal_sent.swap(true, Ordering::SeqCst) {
                debug!("终止事件已发送，丢弃 {}", event.name());
                return false;
            }
        } else if self.terminal_sent() {
            return false;
        }

        match &self.tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn pass1_complete(&self, claims_total: usize, grouped_count: usize, too_many_claims: bool) {
        self.emit(ProgressEvent::Pass1Complete {
            elapsed_ms: self.elapsed_ms(),
            claims_total,
            grouped_count,
            too_many_claims,
        });
    }

    pub fn pass2_started(&self, claims_to_process: usize, total_batches: usize) {
        self.emit(ProgressEvent::Pass2Started {
            elapsed_ms: self.elapsed_ms(),
            claims_to_process,
            total_batches,
        });
    }

    pub fn pass2_batch_complete(
        &self,
        batch_index: usize,
        total_batches: usize,
        succeeded: usize,
        failed: usize,
        results: Vec<ClaimAnalysis>,
    ) {
        self.emit(ProgressEvent::Pass2BatchComplete {
            elapsed_ms: self.elapsed_ms(),
            batch_index,
            total_batches,
            succeeded,
            failed,
            results,
        });
    }

    pub fn pass2_complete(&self, claims_completed: usize, claims_failed: usize) {
        self.emit(ProgressEvent::Pass2Complete {
            elapsed_ms: self.elapsed_ms(),
            claims_completed,
            claims_failed,
        });
    }

    pub fn pass3_started(&self) {
        self.emit(ProgressEvent::Pass3Started {
            elapsed_ms: self.elapsed_ms(),
        });
    }

    pub fn pass3_complete(&self, used_ai: bool) {
        self.emit(ProgressEvent::Pass3Complete {
            elapsed_ms: self.elapsed_ms(),
            used_ai,
        });
    }

    pub fn complete(&self, result: PipelineResult) {
        self.emit(ProgressEvent::Complete {
            elapsed_ms: self.elapsed_ms(),
            result: Box::new(result),
        });
    }

    pub fn error(&self, phase: Option<Pass>, message: impl Into<String>) {
        self.emit(ProgressEvent::Error {
            elapsed_ms: self.elapsed_ms(),
            phase,
            message: message.into(),
        });
    }
}
