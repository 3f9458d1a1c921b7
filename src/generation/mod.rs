//! Streaming text generation
//!
//! Module structure:
//! - types.rs: messages, model keys, template strategies, sampling params
//! - engine.rs: InferenceEngine trait
//! - orchestrator.rs: single model slot, history, token streaming
//! - mistral.rs: mistral.rs backend

pub mod engine;
pub mod mistral;
pub mod orchestrator;
pub mod types;

pub use engine::{FragmentSender, InferenceEngine};
pub use mistral::MistralEngine;
pub use orchestrator::GenerationOrchestrator;
pub use types::{
    ChatMessage, ContentPart, ModelKey, PlainTurn, PreparedInput, Role, SamplingParams,
    StopPredicate, TemplateStrategy, TemplateSupport,
};
