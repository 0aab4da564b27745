pub mod llm_client;

pub use llm_client::{call_with_timeout, Completion, CompletionRequest, ModelProvider, OpenAiProvider};
