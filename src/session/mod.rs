//! 会话与检查点
//!
//! - `store` / `sqlite_store`：存储接口与实现（基础设施层）
//! - `checkpoint`：尽力而为的检查点写入
//! - `resume`：恢复决策与状态查询

pub mod checkpoint;
pub mod resume;
pub mod sqlite_store;
pub mod store;

pub use checkpoint::{Checkpointer, WriteOutcome};
pub use resume::{actions_for, resume_actions, ResumeAction, StatusReport};
pub use sqlite_store::SqliteStore;
pub use store::{ClaimStore, MemoryStore, SessionStore};
