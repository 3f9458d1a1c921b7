//! Inference engine abstraction
//!
//! Everything the orchestrator needs from a backend: loading a model,
//! reporting and rendering its chat template, and streaming generated text.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{
    ChatMessage, ModelKey, PreparedInput, SamplingParams, StopPredicate, TemplateStrategy,
    TemplateSupport,
};
use crate::error::InferenceError;

/// Channel the engine pushes decoded text fragments into, in order
pub type FragmentSender = mpsc::UnboundedSender<String>;

#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Handle to a loaded model. Dropping it releases the model's memory.
    type Model: Send + Sync + 'static;

    /// Load model weights and tokenizer. `model_id` is a hub id or a local path.
    async fn load_model(&self, model_id: &str, key: &ModelKey) -> Result<Self::Model, InferenceError>;

    /// What the model's chat template accepts, if the engine can tell
    fn template_support(&self, model: &Self::Model) -> TemplateSupport;

    /// Prepare the conversation for generation.
    ///
    /// Returns `InferenceError::UnsupportedTemplate` when the model cannot
    /// take input shaped by `strategy`.
    fn render_template(
        &self,
        model: &Self::Model,
        strategy: TemplateStrategy,
        history: &[ChatMessage],
    ) -> Result<PreparedInput, InferenceError>;

    /// False when the current device has no efficient stochastic sampling path
    fn supports_stochastic_sampling(&self) -> bool {
        true
    }

    /// Generate until finished, `params.max_new_tokens` is reached, or `stop`
    /// returns true. Fragments go to `sink`; a closed sink also ends generation.
    async fn stream_generate(
        &self,
        model: Arc<Self::Model>,
        input: PreparedInput,
        params: SamplingParams,
        stop: StopPredicate,
        sink: FragmentSender,
    ) -> Result<(), InferenceError>;
}
