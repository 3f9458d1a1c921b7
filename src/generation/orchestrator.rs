//! Generation orchestrator: single model slot, conversation history, and
//! the streaming drain loop

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::engine::InferenceEngine;
use super::types::{
    ChatMessage, ModelKey, SamplingParams, StopPredicate, TemplateStrategy, TemplateSupport,
};
use crate::config::{HistoryScope, RunnerConfig};
use crate::error::{GenerationError, InferenceError};
use crate::protocol::{Event, EventEmitter, GenerateCommand};

/// The one resident model
struct ModelSlot<M> {
    key: ModelKey,
    model: Arc<M>,
    strategy: TemplateStrategy,
}

/// Conversation history, either one shared transcript or one per model
struct Conversations {
    scope: HistoryScope,
    shared: Vec<ChatMessage>,
    per_model: HashMap<ModelKey, Vec<ChatMessage>>,
}

impl Conversations {
    fn new(scope: HistoryScope) -> Self {
        Self {
            scope,
            shared: Vec::new(),
            per_model: HashMap::new(),
        }
    }

    fn for_model(&mut self, key: &ModelKey) -> &mut Vec<ChatMessage> {
        match self.scope {
            HistoryScope::Shared => &mut self.shared,
            HistoryScope::PerModel => self.per_model.entry(key.clone()).or_default(),
        }
    }

    fn get(&self, key: &ModelKey) -> Option<&Vec<ChatMessage>> {
        match self.scope {
            HistoryScope::Shared => Some(&self.shared),
            HistoryScope::PerModel => self.per_model.get(key),
        }
    }
}

struct OrchestratorState<M> {
    slot: Option<ModelSlot<M>>,
    conversations: Conversations,
}

/// Runs generation jobs one at a time against a single loaded model
pub struct GenerationOrchestrator<E: InferenceEngine> {
    engine: Arc<E>,
    // Held for the whole of a generation; this is what serializes jobs
    state: Mutex<OrchestratorState<E::Model>>,
    system_preamble: Vec<String>,
    cancel_grace: Duration,
}

impl<E: InferenceEngine> GenerationOrchestrator<E> {
    pub fn new(engine: Arc<E>, config: &RunnerConfig) -> Self {
        Self {
            engine,
            state: Mutex::new(OrchestratorState {
                slot: None,
                conversations: Conversations::new(config.history_scope),
            }),
            system_preamble: config.system_preamble.clone(),
            cancel_grace: config.cancel_grace,
        }
    }

    /// Run one generation. Tokens go to `emitter`; the terminal event is
    /// returned so the caller can release the job first.
    pub async fn run(&self, cmd: &GenerateCommand, cancel: &CancellationToken, emitter: &EventEmitter) -> Event {
        log::info!("Starting generation: {} with model: {}", cmd.generation_id, cmd.model);

        match self.generate(cmd, cancel, emitter).await {
            Ok(reply) => {
                log::info!(
                    "Generation done: {} ({} chars)",
                    cmd.generation_id,
                    reply.chars().count()
                );
                Event::Done {
                    generation_id: cmd.generation_id.clone(),
                }
            }
            Err(e) => {
                match e {
                    GenerationError::Cancelled => log::info!("Generation cancelled: {}", cmd.generation_id),
                    _ => log::error!("Generation error: {}: {}", cmd.generation_id, e),
                }
                Event::error(Some(&cmd.generation_id), e.to_string())
            }
        }
    }

    /// Stream one reply as `chat_token` events and return the full text.
    /// The reply joins the history only when this succeeds.
    pub async fn generate(
        &self,
        cmd: &GenerateCommand,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<String, GenerationError> {
        let mut state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            state = self.state.lock() => state,
        };

        let key = ModelKey::normalize(&cmd.model);
        let (model, strategy) = self.ensure_loaded(&mut state, &cmd.model, &key).await?;

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let history = state.conversations.for_model(&key);
        if history.is_empty() && !self.system_preamble.is_empty() {
            history.push(ChatMessage::system(self.system_preamble.iter().cloned()));
        }
        history.push(ChatMessage::user(cmd.prompt.clone()));

        let input = match self.engine.render_template(&model, strategy, history) {
            Err(e) if strategy == TemplateStrategy::Structured => {
                log::warn!("Structured template failed for {} ({}), switching to plain", key, e);
                if let Some(slot) = state.slot.as_mut() {
                    slot.strategy = TemplateStrategy::Plain;
                }
                let history = state.conversations.for_model(&key);
                self.engine
                    .render_template(&model, TemplateStrategy::Plain, history)?
            }
            other => other?,
        };

        let params = SamplingParams::new(
            cmd.max_new_tokens,
            cmd.temperature,
            self.engine.supports_stochastic_sampling(),
        );
        log::debug!(
            "Generating for {}: {} turns, max_new_tokens={}, temperature={}, do_sample={}",
            cmd.generation_id,
            input.len(),
            params.max_new_tokens,
            params.temperature,
            params.do_sample
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let stop_token = cancel.clone();
        let stop: StopPredicate = Arc::new(move || stop_token.is_cancelled());
        let engine = self.engine.clone();
        let mut worker =
            tokio::spawn(async move { engine.stream_generate(model, input, params, stop, tx).await });

        let mut reply = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    rx.close();
                    if tokio::time::timeout(self.cancel_grace, &mut worker).await.is_err() {
                        log::warn!(
                            "Generation worker for {} did not stop within {:?}, abandoning it",
                            cmd.generation_id,
                            self.cancel_grace
                        );
                        worker.abort();
                    }
                    return Err(GenerationError::Cancelled);
                }
                fragment = rx.recv() => match fragment {
                    Some(token) => {
                        if token.is_empty() {
                            continue;
                        }
                        reply.push_str(&token);
                        emitter.emit(Event::ChatToken {
                            generation_id: cmd.generation_id.clone(),
                            token,
                        });
                    }
                    None => break,
                },
            }
        }

        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                log::error!("Generation worker failed: {}", e);
                return Err(InferenceError::WorkerPanicked.into());
            }
        }

        // The engine may have honored the stop predicate and ended cleanly
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        state
            .conversations
            .for_model(&key)
            .push(ChatMessage::assistant(reply.clone()));

        Ok(reply)
    }

    /// Make `key` the resident model, evicting whatever was there first
    async fn ensure_loaded(
        &self,
        state: &mut OrchestratorState<E::Model>,
        model_id: &str,
        key: &ModelKey,
    ) -> Result<(Arc<E::Model>, TemplateStrategy), InferenceError> {
        if let Some(slot) = state.slot.as_ref().filter(|slot| &slot.key == key) {
            return Ok((slot.model.clone(), slot.strategy));
        }

        if let Some(previous) = state.slot.take() {
            log::info!("Unloading model: {}", previous.key);
            drop(previous);
        }

        log::info!("Loading model: {} (key {})", model_id, key);
        let model = Arc::new(self.engine.load_model(model_id, key).await?);
        let strategy = self.select_strategy(&model, key);
        log::info!("Model loaded: {} using {:?} template input", key, strategy);

        state.slot = Some(ModelSlot {
            key: key.clone(),
            model: model.clone(),
            strategy,
        });
        Ok((model, strategy))
    }

    /// Structured input is tried first. The model family only decides when
    /// the engine neither reports support nor answers the trial render
    /// conclusively.
    fn select_strategy(&self, model: &E::Model, key: &ModelKey) -> TemplateStrategy {
        match self.engine.template_support(model) {
            TemplateSupport::Structured => return TemplateStrategy::Structured,
            TemplateSupport::Plain => return TemplateStrategy::Plain,
            TemplateSupport::Unknown => {}
        }

        let trial = [
            ChatMessage::system(self.system_preamble.iter().cloned()),
            ChatMessage::user("ping"),
        ];
        match self
            .engine
            .render_template(model, TemplateStrategy::Structured, &trial)
        {
            Ok(_) => TemplateStrategy::Structured,
            Err(InferenceError::UnsupportedTemplate) => TemplateStrategy::Plain,
            Err(e) => {
                log::debug!("Structured trial render failed for {}: {}", key, e);
                if key.prefers_plain_template() {
                    TemplateStrategy::Plain
                } else {
                    TemplateStrategy::Structured
                }
            }
        }
    }

    /// Key of the resident model, if any
    pub async fn resident_model(&self) -> Option<ModelKey> {
        self.state.lock().await.slot.as_ref().map(|slot| slot.key.clone())
    }

    /// Snapshot of the conversation that generations for `model` use
    pub async fn history(&self, model: &str) -> Vec<ChatMessage> {
        let key = ModelKey::normalize(model);
        self.state
            .lock()
            .await
            .conversations
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::generation::engine::FragmentSender;
    use crate::generation::types::PreparedInput;

    /// Counts live models so tests can check that only one is resident
    pub struct ScriptedModel {
        live: Arc<AtomicUsize>,
    }

    impl Drop for ScriptedModel {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Engine that replays a fixed list of fragments
    pub struct ScriptedEngine {
        pub fragments: Vec<String>,
        pub delay: Duration,
        pub support: TemplateSupport,
        /// Returned by every structured render when set
        pub structured_error: Option<InferenceError>,
        /// Send fragments without ever checking the stop predicate, pausing
        /// this long after each one
        pub stall: Option<Duration>,
        pub stochastic: bool,
        pub fail_load: bool,
        pub live: Arc<AtomicUsize>,
        pub loads: StdMutex<Vec<String>>,
        pub renders: StdMutex<Vec<TemplateStrategy>>,
        pub inputs: StdMutex<Vec<PreparedInput>>,
        pub params: StdMutex<Vec<SamplingParams>>,
    }

    impl ScriptedEngine {
        pub fn new<I, S>(fragments: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                fragments: fragments.into_iter().map(Into::into).collect(),
                delay: Duration::ZERO,
                support: TemplateSupport::Structured,
                structured_error: None,
                stall: None,
                stochastic: true,
                fail_load: false,
                live: Arc::new(AtomicUsize::new(0)),
                loads: StdMutex::new(Vec::new()),
                renders: StdMutex::new(Vec::new()),
                inputs: StdMutex::new(Vec::new()),
                params: StdMutex::new(Vec::new()),
            }
        }

        pub fn live_models(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        pub fn loads(&self) -> Vec<String> {
            self.loads.lock().unwrap().clone()
        }

        pub fn renders(&self) -> Vec<TemplateStrategy> {
            self.renders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        type Model = ScriptedModel;

        async fn load_model(&self, model_id: &str, _key: &ModelKey) -> Result<ScriptedModel, InferenceError> {
            self.loads.lock().unwrap().push(model_id.to_string());
            if self.fail_load {
                return Err(InferenceError::Load(format!("no such model: {}", model_id)));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedModel {
                live: self.live.clone(),
            })
        }

        fn template_support(&self, _model: &ScriptedModel) -> TemplateSupport {
            self.support
        }

        fn render_template(
            &self,
            _model: &ScriptedModel,
            strategy: TemplateStrategy,
            history: &[ChatMessage],
        ) -> Result<PreparedInput, InferenceError> {
            self.renders.lock().unwrap().push(strategy);
            match (strategy, &self.structured_error) {
                (TemplateStrategy::Structured, Some(e)) => Err(e.clone()),
                (TemplateStrategy::Structured, None) => Ok(PreparedInput::structured(history)),
                (TemplateStrategy::Plain, _) => Ok(PreparedInput::plain(history)),
            }
        }

        fn supports_stochastic_sampling(&self) -> bool {
            self.stochastic
        }

        async fn stream_generate(
            &self,
            _model: Arc<ScriptedModel>,
            input: PreparedInput,
            params: SamplingParams,
            stop: StopPredicate,
            sink: FragmentSender,
        ) -> Result<(), InferenceError> {
            self.inputs.lock().unwrap().push(input);
            self.params.lock().unwrap().push(params);
            if let Some(stall) = self.stall {
                for fragment in &self.fragments {
                    let _ = sink.send(fragment.clone());
                    tokio::time::sleep(stall).await;
                }
                return Ok(());
            }
            for fragment in self.fragments.iter().take(params.max_new_tokens as usize) {
                if stop() {
                    break;
                }
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if sink.send(fragment.clone()).is_err() {
                    break;
                }
            }
            Ok(())
        }
    }
}
