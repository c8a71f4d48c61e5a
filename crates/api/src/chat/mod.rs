//! Visitor chat: knowledge retrieval and the LLM-backed assistant

pub mod assistant;
pub mod knowledge;
pub mod llm;

pub use assistant::{AssistantReply, ChatAssistant, ReplySource, StudioContext};
pub use knowledge::{KnowledgeBase, KnowledgeEntry};
pub use llm::{LlmClient, LlmConfig, LlmError, LlmMessage};
