/// 日志工具模块
///
/// 提供日志初始化和格式化的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 初始化日志
///
/// `RUST_LOG` 优先；未设置时按 `verbose` 选择 debug 或 info。重复初始化静默忽略。
pub fn init(verbose: bool) {
    let default_level = if verbose { "claim_audit=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 已加载的配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 论证质量分析服务");
    info!("🌐 监听地址: {}", config.bind_addr);
    info!(
        "📊 每批 {} 条声明, 最大并发 {}, 批间间隔 {} ms",
        config.pipeline.batch_size, config.pipeline.max_concurrent, config.pipeline.batch_delay_ms
    );
    info!(
        "🤖 模型: 抽取 {} | 综合 {} | 分析 {}/{}/{}",
        config.llm.extraction_model,
        config.llm.synthesis_model,
        config.llm.simple_model,
        config.llm.moderate_model,
        config.llm.complex_model
    );
    match &config.database_path {
        Some(path) => info!("💾 会话存储: SQLite ({})", path),
        None => info!("💾 会话存储: 内存（重启后丢失）"),
    }
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
