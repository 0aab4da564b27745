use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use claim_audit::api::{router, AppState};
use claim_audit::clients::OpenAiProvider;
use claim_audit::session::{MemoryStore, SqliteStore};
use claim_audit::utils::logging;
use claim_audit::{Config, Pipeline, PipelineContext};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志
    logging::init(config.verbose_logging);
    logging::log_startup(&config);

    let provider = Arc::new(OpenAiProvider::new(&config));
    let ctx = match &config.database_path {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            PipelineContext::new(config.clone(), provider, store.clone(), store)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            PipelineContext::new(config.clone(), provider, store.clone(), store)
        }
    };

    let app = router(AppState::new(Pipeline::new(ctx)));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("无法监听 {}", config.bind_addr))?;

    info!("✓ 服务已启动: http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
