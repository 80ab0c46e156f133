//! LLM integration.
//!
//! The orchestration core never talks to a provider directly: the agent loop
//! consumes a [`crate::agent::ModelCaller`]. This module supplies the message
//! types shared by both sides, the [`LlmProvider`] trait, and a
//! LiteLLM/OpenAI-compatible client that can be adapted into a model caller
//! with [`crate::agent::ProviderModelCaller`].
//!
//! ```ignore
//! use episode_forge::agent::ProviderModelCaller;
//! use episode_forge::llm::LiteLlmClient;
//! use std::sync::Arc;
//!
//! let client = Arc::new(LiteLlmClient::from_env()?);
//! let caller = ProviderModelCaller::new(client, "gpt-4o-mini");
//! ```

pub mod litellm;

pub use litellm::{
    GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, ProviderToolCall,
    Usage,
};
