//! 批量执行引擎 - 编排层
//!
//! ## 职责
//!
//! 把一组工作项切成连续的批次，批内并发执行，批间等待固定间隔。
//!
//! ## 核心规则
//!
//! 1. **分批**：每批 `batch_size` 项，批次数为 `ceil(N / batch_size)`
//! 2. **并发控制**：批内使用 Semaphore 限制同时执行的数量
//! 3. **失败隔离**：单项失败（包括任务 panic）不会取消同批其他项，也不会中止运行
//! 4. **等待整批结束**：本批全部结束后才回调观察者、开始下一批
//! 5. **批间间隔**：最后一批之后不再等待
//!
//! 引擎不支持取消正在执行的调用；观察者可以在某批结束后要求停止后续批次。

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::Config;

/// 批处理参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_concurrent: usize,
}

impl BatchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.pipeline.batch_size.max(1),
            batch_delay: config.batch_delay(),
            max_concurrent: config.pipeline.max_concurrent.max(1),
        }
    }

    /// 批次数 = ceil(N / batch_size)
    pub fn total_batches(&self, item_count: usize) -> usize {
        item_count.div_ceil(self.batch_size.max(1))
    }
}

/// 工作项的稳定编号，结果按编号回收
pub trait Keyed {
    fn key(&self) -> usize;
}

/// 单项失败原因
#[derive(Debug, Clone, PartialEq)]
pub enum ItemError<E> {
    /// 操作本身返回的错误
    Failed(E),
    /// 任务没有正常结束（panic 或无法获取并发许可）
    Aborted(String),
}

/// 单项结果
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult<R, E> {
    pub key: usize,
    pub outcome: Result<R, ItemError<E>>,
}

impl<R, E> BatchItemResult<R, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// 每批结束后交给观察者的进度，计数为本次运行的累计值
#[derive(Debug)]
pub struct BatchProgress<R, E> {
    pub succeeded: usize,
    pub failed: usize,
    /// 从 0 开始
    pub batch_index: usize,
    pub total_batches: usize,
    /// 本批的结果，按 key 升序
    pub results: Vec<BatchItemResult<R, E>>,
}

/// 观察者的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    Continue,
    Stop,
}

/// 批次观察者
#[async_trait]
pub trait BatchObserver<R, E>: Send
where
    R: Send + Sync,
    E: Send + Sync,
{
    async fn on_batch_complete(&mut self, progress: &BatchProgress<R, E>) -> BatchControl;
}

/// 不关心进度时使用
pub struct NoopObserver;

#[async_trait]
impl<R, E> BatchObserver<R, E> for NoopObserver
where
    R: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    async fn on_batch_complete(&mut self, _progress: &BatchProgress<R, E>) -> BatchControl {
        BatchControl::Continue
    }
}

/// 整次运行的汇总
#[derive(Debug)]
pub struct BatchRunSummary<R, E> {
    /// 所有已执行项的结果，按 key 升序
    pub results: Vec<BatchItemResult<R, E>>,
    pub succeeded: usize,
    pub failed: usize,
    pub batches_run: usize,
    pub total_batches: usize,
    /// 观察者提前停止
    pub stopped: bool,
}

/// 批量执行器
pub struct BatchProcessor {
    config: BatchConfig,
    label: String,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            label: String::new(),
        }
    }

    /// 日志前缀，例如 `[主题 abc]`
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// 执行所有工作项
    pub async fn run<T, R, E, F, Fut, O>(
        &self,
        items: Vec<T>,
        operation: F,
        observer: &mut O,
    ) -> BatchRunSummary<R, E>
    where
        T: Keyed + Send + 'static,
        R: Send + Sync + 'static,
        E: Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        O: BatchObserver<R, E> + ?Sized,
    {
        let total_items = items.len();
        let total_batches = self.config.total_batches(total_items);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let operation = Arc::new(operation);

        let mut summary = BatchRunSummary {
            results: Vec::with_capacity(total_items),
            succeeded: 0,
            failed: 0,
            batches_run: 0,
            total_batches,
            stopped: false,
        };

        let mut remaining = items.into_iter().peekable();
        let mut batch_index = 0;

        while remaining.peek().is_some() {
            let batch: Vec<T> = remaining.by_ref().take(self.config.batch_size).collect();
            self.log_batch_start(batch_index, total_batches, batch.len(), total_items);

            let mut results = self
                .run_batch(batch, operation.clone(), semaphore.clone())
                .await;
            results.sort_by_key(|r| r.key);

            let batch_succeeded = results.iter().filter(|r| r.is_success()).count();
            let batch_failed = results.len() - batch_succeeded;
            summary.succeeded += batch_succeeded;
            summary.failed += batch_failed;
            summary.batches_run += 1;

            self.log_batch_complete(batch_index, batch_succeeded, results.len());

            let progress = BatchProgress {
                succeeded: summary.succeeded,
                failed: summary.failed,
                batch_index,
                total_batches,
                results,
            };
            let control = observer.on_batch_complete(&progress).await;
            summary.results.extend(progress.results);

            if control == BatchControl::Stop {
                info!("{} 观察者要求停止，跳过剩余批次", self.label);
                summary.stopped = true;
                break;
            }

            batch_index += 1;
            if remaining.peek().is_some() && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        summary
    }

    /// 执行单个批次，等待本批所有任务结束
    async fn run_batch<T, R, E, F, Fut>(
        &self,
        batch: Vec<T>,
        operation: Arc<F>,
        semaphore: Arc<Semaphore>,
    ) -> Vec<BatchItemResult<R, E>>
    where
        T: Keyed + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(batch.len());

        for item in batch {
            let key = item.key();
            let semaphore = semaphore.clone();
            let operation = operation.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err(ItemError::<E>::Aborted(format!("无法获取并发许可: {}", e))),
                };
                operation(item).await.map_err(ItemError::Failed)
            });
            handles.push((key, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("{} 工作项 #{} 任务执行失败: {}", self.label, key, e);
                    Err(ItemError::Aborted(e.to_string()))
                }
            };
            results.push(BatchItemResult { key, outcome });
        }

        results
    }

    fn log_batch_start(&self, batch_index: usize, total_batches: usize, size: usize, total: usize) {
        info!("{}", "=".repeat(60));
        info!(
            "{} 📦 开始处理第 {}/{} 批 (本批 {} 项 / 共 {} 项)",
            self.label,
            batch_index + 1,
            total_batches,
            size,
            total
        );
    }

    fn log_batch_complete(&self, batch_index: usize, succeeded: usize, total: usize) {
        info!(
            "{} ✓ 第 {} 批完成: 成功 {}/{}",
            self.label,
            batch_index + 1,
            succeeded,
            total
        );
        info!("{}", "─".repeat(60));
    }
}
