//! Generation types: conversation messages, model keys, template strategies

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Typed piece of message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// A message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    pub fn system<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Role::System, parts.into_iter().map(ContentPart::text).collect())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().map(|part| match part {
            ContentPart::Text { text } => text.as_str(),
        })
    }

    /// Content collapsed into one string, parts joined by `separator`
    pub fn flatten(&self, separator: &str) -> String {
        self.text_parts().collect::<Vec<_>>().join(separator)
    }
}

/// Normalized cache key for a model identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey(String);

/// Model families whose chat templates only accept flat string content
const PLAIN_TEMPLATE_FAMILIES: &[&str] = &["qwen"];

impl ModelKey {
    /// Last path segment, lowercased, with `-` and whitespace folded into
    /// single underscores
    pub fn normalize(model_id: &str) -> Self {
        let last = model_id
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or("");

        let mut key = String::with_capacity(last.len());
        for c in last.to_lowercase().chars() {
            let c = if c == '-' || c.is_whitespace() { '_' } else { c };
            if c == '_' && key.ends_with('_') {
                continue;
            }
            key.push(c);
        }
        ModelKey(key.trim_matches('_').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substring check used only when the engine cannot say which template
    /// shape a model accepts
    pub fn prefers_plain_template(&self) -> bool {
        PLAIN_TEMPLATE_FAMILIES.iter().any(|family| self.0.contains(family))
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input-preparation strategy chosen once per model load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStrategy {
    /// Content as a list of typed parts
    Structured,
    /// Content as a flat string
    Plain,
}

/// What a loaded model reports about its chat template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSupport {
    Structured,
    Plain,
    Unknown,
}

/// A turn with flattened content
#[derive(Debug, Clone, PartialEq)]
pub struct PlainTurn {
    pub role: Role,
    pub content: String,
}

/// Conversation rendered for the engine
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    Structured(Vec<ChatMessage>),
    Plain(Vec<PlainTurn>),
}

impl PreparedInput {
    pub fn structured(history: &[ChatMessage]) -> Self {
        PreparedInput::Structured(history.to_vec())
    }

    /// Parts joined with a single space
    pub fn plain(history: &[ChatMessage]) -> Self {
        PreparedInput::Plain(
            history
                .iter()
                .map(|msg| PlainTurn {
                    role: msg.role,
                    content: msg.flatten(" "),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        match self {
            PreparedInput::Structured(msgs) => msgs.len(),
            PreparedInput::Plain(turns) => turns.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sampling settings for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    /// False means greedy decoding
    pub do_sample: bool,
}

impl SamplingParams {
    /// Greedy when temperature is zero or the device cannot sample efficiently
    pub fn new(max_new_tokens: u32, temperature: f32, stochastic_supported: bool) -> Self {
        Self {
            max_new_tokens,
            temperature,
            do_sample: temperature > 0.0 && stochastic_supported,
        }
    }
}

/// Consulted by the engine between tokens; true means stop now
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
