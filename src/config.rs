//! Runner configuration, read once from the environment at startup

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default system preamble seeded into a fresh conversation.
/// Each entry becomes one text part of the system turn.
pub const DEFAULT_SYSTEM_PREAMBLE: &[&str] = &[
    "You are a helpful, concise, and direct assistant.",
    "Always respond exclusively in the same language used by the user. Do not translate, explain, or repeat the answer in any other language. Do not add translations in parentheses.",
    "If you are unsure about an answer, clearly say that you do not know instead of guessing.",
    "You were developed by Lucas Mengarda as an open-source local AI project. Never claim a different origin.",
    "You are running locally on the user's machine.",
];

/// How conversation history is shared between generation calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryScope {
    /// One running conversation, carried across model switches
    #[default]
    Shared,
    /// A separate conversation per normalized model key
    PerModel,
}

impl FromStr for HistoryScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared" | "global" => Ok(HistoryScope::Shared),
            "per_model" | "per-model" | "model" => Ok(HistoryScope::PerModel),
            other => Err(format!("unknown history scope '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base directory for downloads without an explicit local_dir, and for
    /// resolving model ids to local folders
    pub models_dir: PathBuf,
    /// Hub base URL (no trailing slash)
    pub hub_endpoint: String,
    /// Bearer token used when a download command carries none
    pub default_token: Option<String>,
    pub connect_timeout: Duration,
    /// Socket read timeout for downloads
    pub read_timeout: Duration,
    pub history_scope: HistoryScope,
    pub system_preamble: Vec<String>,
    /// How long a cancelled generation worker may take to wind down
    pub cancel_grace: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            models_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cerebro")
                .join("models"),
            hub_endpoint: "https://huggingface.co".to_string(),
            default_token: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            history_scope: HistoryScope::Shared,
            system_preamble: DEFAULT_SYSTEM_PREAMBLE
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cancel_grace: Duration::from_millis(1000),
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

impl RunnerConfig {
    /// Build a config from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("CEREBRO_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = get("HF_ENDPOINT") {
            config.hub_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        config.default_token = get("HF_TOKEN").or_else(|| get("HUGGING_FACE_HUB_TOKEN"));

        if let Some(secs) = parse_or_warn::<u64>(get("CEREBRO_CONNECT_TIMEOUT_SECS"), "CEREBRO_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_or_warn::<u64>(get("CEREBRO_READ_TIMEOUT_SECS"), "CEREBRO_READ_TIMEOUT_SECS") {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(scope) = parse_or_warn::<HistoryScope>(get("CEREBRO_HISTORY_SCOPE"), "CEREBRO_HISTORY_SCOPE") {
            config.history_scope = scope;
        }
        if let Some(prompt) = get("CEREBRO_SYSTEM_PROMPT") {
            config.system_preamble = vec![prompt];
        }
        if let Some(ms) = parse_or_warn::<u64>(get("CEREBRO_CANCEL_GRACE_MS"), "CEREBRO_CANCEL_GRACE_MS") {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_or_warn::<u64>(get("CEREBRO_SHUTDOWN_GRACE_MS"), "CEREBRO_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        config
    }
}

fn parse_or_warn<T>(value: Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = value?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
