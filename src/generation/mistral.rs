//! mistral.rs inference backend
//!
//! Loads either a GGUF file (through `GgufModelBuilder`) or a Hugging Face
//! style model folder or hub id (through `TextModelBuilder`). mistral.rs
//! applies the chat template itself from string content; structured input is
//! passed with each content part on its own line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mistralrs::{
    GgufModelBuilder, Model, RequestBuilder, Response, TextMessageRole, TextModelBuilder,
};

use super::engine::{FragmentSender, InferenceEngine};
use super::types::{
    ChatMessage, ModelKey, PreparedInput, Role, SamplingParams, StopPredicate, TemplateStrategy,
    TemplateSupport,
};
use crate::config::RunnerConfig;
use crate::error::InferenceError;

/// Points stdout at stderr while mistral.rs loads a model, so its println!
/// output cannot land in the event stream.
#[cfg(windows)]
mod stdout_redirect {
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::System::Console::{GetStdHandle, SetStdHandle, STD_ERROR_HANDLE, STD_OUTPUT_HANDLE};

    /// Held across model loading awaits, so the handle is kept as an
    /// address to stay `Send`
    pub struct StdoutRedirect {
        original_stdout: usize,
    }

    impl StdoutRedirect {
        pub fn to_stderr() -> Option<Self> {
            unsafe {
                let original_stdout = GetStdHandle(STD_OUTPUT_HANDLE);
                let stderr = GetStdHandle(STD_ERROR_HANDLE);
                if SetStdHandle(STD_OUTPUT_HANDLE, stderr) != 0 {
                    Some(Self {
                        original_stdout: original_stdout as usize,
                    })
                } else {
                    None
                }
            }
        }
    }

    impl Drop for StdoutRedirect {
        fn drop(&mut self) {
            unsafe {
                SetStdHandle(STD_OUTPUT_HANDLE, self.original_stdout as HANDLE);
            }
        }
    }
}

#[cfg(not(windows))]
mod stdout_redirect {
    pub struct StdoutRedirect;

    impl StdoutRedirect {
        /// No handle swap outside Windows; loader output goes through `log`
        pub fn to_stderr() -> Option<Self> {
            None
        }
    }
}

/// A model resident in mistral.rs
pub struct MistralModel {
    model: Model,
    source: String,
    gguf: bool,
}

pub struct MistralEngine {
    models_dir: PathBuf,
}

impl MistralEngine {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
        }
    }

    /// An existing path wins, then a folder under the models directory,
    /// then the id is handed to mistral.rs as a hub id
    fn resolve_source(&self, model_id: &str) -> ModelSource {
        let direct = PathBuf::from(model_id);
        let under_models = self.models_dir.join(model_id);

        for candidate in [direct, under_models] {
            if candidate.is_file() {
                return ModelSource::GgufFile(candidate);
            }
            if candidate.is_dir() {
                return match find_gguf(&candidate) {
                    Some(file) => ModelSource::GgufFile(file),
                    None => ModelSource::Folder(candidate),
                };
            }
        }
        ModelSource::Hub(model_id.to_string())
    }
}

enum ModelSource {
    GgufFile(PathBuf),
    Folder(PathBuf),
    Hub(String),
}

fn find_gguf(dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files.into_iter().next()
}

fn message_role(role: Role) -> TextMessageRole {
    match role {
        Role::System => TextMessageRole::System,
        Role::User => TextMessageRole::User,
        Role::Assistant => TextMessageRole::Assistant,
    }
}

fn request_turns(input: PreparedInput) -> Vec<(Role, String)> {
    match input {
        PreparedInput::Structured(messages) => messages
            .iter()
            .map(|msg| (msg.role, msg.flatten("\n")))
            .collect(),
        PreparedInput::Plain(turns) => turns.into_iter().map(|t| (t.role, t.content)).collect(),
    }
}

#[async_trait]
impl InferenceEngine for MistralEngine {
    type Model = MistralModel;

    async fn load_model(&self, model_id: &str, key: &ModelKey) -> Result<MistralModel, InferenceError> {
        let _redirect = stdout_redirect::StdoutRedirect::to_stderr();

        let (model, source, gguf) = match self.resolve_source(model_id) {
            ModelSource::GgufFile(path) => {
                let dir = path
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| ".".to_string());
                let file = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .ok_or_else(|| InferenceError::Load(format!("Invalid model path: {}", path.display())))?;

                log::info!("Loading GGUF for {} from dir: {}, file: {}", key, dir, file);
                let model = GgufModelBuilder::new(&dir, vec![file])
                    .build()
                    .await
                    .map_err(|e| InferenceError::Load(format!("{:?}", e)))?;
                (model, path.to_string_lossy().to_string(), true)
            }
            ModelSource::Folder(path) => {
                let source = path.to_string_lossy().to_string();
                log::info!("Loading model folder for {}: {}", key, source);
                let model = TextModelBuilder::new(&source)
                    .build()
                    .await
                    .map_err(|e| InferenceError::Load(format!("{:?}", e)))?;
                (model, source, false)
            }
            ModelSource::Hub(id) => {
                log::info!("Loading hub model for {}: {}", key, id);
                let model = TextModelBuilder::new(&id)
                    .build()
                    .await
                    .map_err(|e| InferenceError::Load(format!("{:?}", e)))?;
                (model, id, false)
            }
        };

        Ok(MistralModel { model, source, gguf })
    }

    /// GGUF templates come from file metadata and expect flat strings; for
    /// other models the template is opaque from here
    fn template_support(&self, model: &MistralModel) -> TemplateSupport {
        if model.gguf {
            TemplateSupport::Plain
        } else {
            TemplateSupport::Unknown
        }
    }

    fn render_template(
        &self,
        model: &MistralModel,
        strategy: TemplateStrategy,
        history: &[ChatMessage],
    ) -> Result<PreparedInput, InferenceError> {
        match strategy {
            TemplateStrategy::Structured if model.gguf => Err(InferenceError::UnsupportedTemplate),
            TemplateStrategy::Structured => Ok(PreparedInput::structured(history)),
            TemplateStrategy::Plain => Ok(PreparedInput::plain(history)),
        }
    }

    fn supports_stochastic_sampling(&self) -> bool {
        // Metal sampling falls back to a slow path; decode greedily there
        !cfg!(feature = "metal")
    }

    async fn stream_generate(
        &self,
        model: Arc<MistralModel>,
        input: PreparedInput,
        params: SamplingParams,
        stop: StopPredicate,
        sink: FragmentSender,
    ) -> Result<(), InferenceError> {
        let mut request = RequestBuilder::new();
        for (role, content) in request_turns(input) {
            request = request.add_message(message_role(role), &content);
        }
        request = request.set_sampler_max_len(params.max_new_tokens as usize);
        request = if params.do_sample {
            request.set_sampler_temperature(params.temperature as f64)
        } else {
            request.set_deterministic_sampler()
        };

        let mut stream = model
            .model
            .stream_chat_request(request)
            .await
            .map_err(|e| InferenceError::Generation(format!("Failed to start streaming: {:?}", e)))?;

        while let Some(response) = stream.next().await {
            if stop() {
                log::debug!("Stop requested, ending stream for {}", model.source);
                break;
            }
            match response {
                Response::Chunk(chunk) => {
                    for choice in &chunk.choices {
                        if let Some(ref content) = choice.delta.content {
                            if sink.send(content.clone()).is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Response::Done(_) => break,
                Response::InternalError(e) => {
                    return Err(InferenceError::Generation(format!("Internal error during streaming: {:?}", e)));
                }
                Response::ValidationError(e) => {
                    return Err(InferenceError::Generation(format!("Validation error: {:?}", e)));
                }
                Response::ModelError(msg, _) => {
                    return Err(InferenceError::Generation(format!("Model error: {}", msg)));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(models_dir: &Path) -> MistralEngine {
        MistralEngine::new(&RunnerConfig {
            models_dir: models_dir.to_path_buf(),
            ..RunnerConfig::default()
        })
    }

    #[test]
    fn test_resolve_prefers_gguf_in_folder() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("org/model");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("config.json"), b"{}").unwrap();
        std::fs::write(repo.join("model-q4.GGUF"), b"").unwrap();

        match engine(dir.path()).resolve_source("org/model") {
            ModelSource::GgufFile(path) => assert!(path.ends_with("model-q4.GGUF")),
            _ => panic!("Expected a GGUF file"),
        }
    }

    #[test]
    fn test_structured_parts_become_lines() {
        let history = [ChatMessage::system(["a", "b"]), ChatMessage::user("hi")];

        assert_eq!(
            request_turns(PreparedInput::structured(&history)),
            vec![(Role::System, "a\nb".to_string()), (Role::User, "hi".to_string())]
        );
        assert_eq!(
            request_turns(PreparedInput::plain(&history)),
            vec![(Role::System, "a b".to_string()), (Role::User, "hi".to_string())]
        );
    }

    #[test]
    fn test_resolve_folder_and_hub() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("org/safetensors")).unwrap();
        let engine = engine(dir.path());

        assert!(matches!(engine.resolve_source("org/safetensors"), ModelSource::Folder(_)));
        assert!(matches!(engine.resolve_source("org/not-here"), ModelSource::Hub(id) if id == "org/not-here"));
    }
}
