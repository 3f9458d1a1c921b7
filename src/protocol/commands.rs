//! Incoming commands: parsing and field validation

use std::path::PathBuf;

use serde_json::{Map, Value};

use super::events::Event;
use crate::error::ProtocolError;

pub const DEFAULT_MAX_NEW_TOKENS: u32 = 256;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadCommand {
    pub download_id: String,
    pub repo_id: String,
    pub revision: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateCommand {
    pub generation_id: String,
    pub model: String,
    pub prompt: String,
    pub max_new_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Shutdown,
    /// Cancel a generation. A missing id makes this a no-op.
    Cancel { generation_id: Option<String> },
    /// Cancel a download. A missing id makes this a no-op.
    DownloadCancel { download_id: Option<String> },
    Download(DownloadCommand),
    Generate(GenerateCommand),
}

/// A command line that was refused, along with whatever ids could be
/// recovered so the error event can be routed to the right job in the UI
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    General(ProtocolError),
    Download {
        download_id: Option<String>,
        repo_id: Option<String>,
        error: ProtocolError,
    },
    Generate {
        generation_id: Option<String>,
        error: ProtocolError,
    },
}

impl Rejection {
    pub fn error(&self) -> &ProtocolError {
        match self {
            Rejection::General(error) => error,
            Rejection::Download { error, .. } => error,
            Rejection::Generate { error, .. } => error,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Rejection::General(error) => Event::error(None, error.to_string()),
            Rejection::Download {
                download_id,
                repo_id,
                error,
            } => Event::download_error(download_id.as_deref(), repo_id.as_deref(), error.to_string()),
            Rejection::Generate {
                generation_id,
                error,
            } => Event::error(generation_id.as_deref(), error.to_string()),
        }
    }
}

impl Command {
    /// Parse and validate one input line
    pub fn parse(line: &str) -> Result<Command, Rejection> {
        let value: Value = serde_json::from_str(line)
            .map_err(|_| Rejection::General(ProtocolError::InvalidJson))?;
        let Value::Object(msg) = value else {
            return Err(Rejection::General(ProtocolError::InvalidJson));
        };

        match msg.get("type").and_then(Value::as_str) {
            Some("shutdown") => Ok(Command::Shutdown),
            Some("cancel") => Ok(Command::Cancel {
                generation_id: string_field(&msg, "generation_id"),
            }),
            Some("download_cancel") => Ok(Command::DownloadCancel {
                download_id: string_field(&msg, "download_id"),
            }),
            Some("download") => parse_download(&msg).map(Command::Download),
            Some("generate") => parse_generate(&msg).map(Command::Generate),
            other => {
                let shown = match (other, msg.get("type")) {
                    (Some(t), _) => t.to_string(),
                    (None, Some(v)) => v.to_string(),
                    (None, None) => "null".to_string(),
                };
                Err(Rejection::General(ProtocolError::UnknownType(shown)))
            }
        }
    }
}

fn string_field(msg: &Map<String, Value>, key: &str) -> Option<String> {
    msg.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty_string_field(msg: &Map<String, Value>, key: &str) -> Option<String> {
    string_field(msg, key).filter(|s| !s.is_empty())
}

fn parse_download(msg: &Map<String, Value>) -> Result<DownloadCommand, Rejection> {
    let repo_id = non_empty_string_field(msg, "repo_id");

    let Some(download_id) = non_empty_string_field(msg, "download_id") else {
        return Err(Rejection::Download {
            download_id: None,
            repo_id,
            error: ProtocolError::MissingField("download_id"),
        });
    };
    let Some(repo_id) = repo_id else {
        return Err(Rejection::Download {
            download_id: Some(download_id),
            repo_id: None,
            error: ProtocolError::MissingField("repo_id"),
        });
    };

    // Optional fields of the wrong type are treated as absent
    Ok(DownloadCommand {
        download_id,
        repo_id,
        revision: non_empty_string_field(msg, "revision"),
        local_dir: non_empty_string_field(msg, "local_dir").map(PathBuf::from),
        token: non_empty_string_field(msg, "token"),
    })
}

fn parse_generate(msg: &Map<String, Value>) -> Result<GenerateCommand, Rejection> {
    let Some(generation_id) = string_field(msg, "generation_id") else {
        return Err(Rejection::Generate {
            generation_id: None,
            error: ProtocolError::MissingField("generation_id"),
        });
    };
    let reject = |error: ProtocolError| Rejection::Generate {
        generation_id: Some(generation_id.clone()),
        error,
    };

    let model = non_empty_string_field(msg, "model")
        .ok_or_else(|| reject(ProtocolError::MissingField("model")))?;
    let prompt =
        string_field(msg, "prompt").ok_or_else(|| reject(ProtocolError::MissingField("prompt")))?;

    let max_new_tokens = match msg.get("max_new_tokens") {
        None | Some(Value::Null) => DEFAULT_MAX_NEW_TOKENS,
        Some(v) => token_budget(v).ok_or_else(|| reject(ProtocolError::InvalidField("max_new_tokens")))?,
    };
    let temperature = match msg.get("temperature") {
        None | Some(Value::Null) => DEFAULT_TEMPERATURE,
        Some(v) => v
            .as_f64()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(|t| t as f32)
            .ok_or_else(|| reject(ProtocolError::InvalidField("temperature")))?,
    };

    Ok(GenerateCommand {
        generation_id,
        model,
        prompt,
        max_new_tokens,
        temperature,
    })
}

/// Accepts non-negative integers, including integral floats like `16.0`
fn token_budget(value: &Value) -> Option<u32> {
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).ok();
    }
    let f = value.as_f64()?;
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_with_defaults() {
        let cmd = Command::parse(r#"{"type":"generate","generation_id":"g1","model":"demo/model","prompt":"hi"}"#)
            .unwrap();
        assert_eq!(
            cmd,
            Command::Generate(GenerateCommand {
                generation_id: "g1".to_string(),
                model: "demo/model".to_string(),
                prompt: "hi".to_string(),
                max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
            })
        );
    }

    #[test]
    fn test_parse_generate_explicit_sampling() {
        let cmd = Command::parse(
            r#"{"type":"generate","generation_id":"g1","model":"m","prompt":"","max_new_tokens":16.0,"temperature":0}"#,
        )
        .unwrap();
        match cmd {
            Command::Generate(g) => {
                assert_eq!(g.max_new_tokens, 16);
                assert_eq!(g.temperature, 0.0);
                assert_eq!(g.prompt, "");
            }
            other => panic!("Expected Generate, got {:?}", other),
        }
    }

    #[test]
    fn test_generate_missing_fields_name_the_field() {
        let err = Command::parse(r#"{"type":"generate","model":"m","prompt":"p"}"#).unwrap_err();
        assert_eq!(err.into_event(), Event::error(None, "Missing generation_id"));

        let err = Command::parse(r#"{"type":"generate","generation_id":"g","prompt":"p"}"#).unwrap_err();
        assert_eq!(err.into_event(), Event::error(Some("g"), "Missing model"));

        let err = Command::parse(r#"{"type":"generate","generation_id":"g","model":"m","prompt":3}"#).unwrap_err();
        assert_eq!(err.into_event(), Event::error(Some("g"), "Missing prompt"));

        let err = Command::parse(
            r#"{"type":"generate","generation_id":"g","model":"m","prompt":"p","max_new_tokens":-1}"#,
        )
        .unwrap_err();
        assert_eq!(err.error(), &ProtocolError::InvalidField("max_new_tokens"));
    }

    #[test]
    fn test_parse_download() {
        let cmd = Command::parse(
            r#"{"type":"download","download_id":"d1","repo_id":"org/repo","revision":7,"local_dir":"/tmp/x","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Download(DownloadCommand {
                download_id: "d1".to_string(),
                repo_id: "org/repo".to_string(),
                revision: None,
                local_dir: Some(PathBuf::from("/tmp/x")),
                token: Some("t".to_string()),
            })
        );
    }

    #[test]
    fn test_download_missing_fields() {
        let err = Command::parse(r#"{"type":"download","repo_id":"org/repo"}"#).unwrap_err();
        assert_eq!(
            err.into_event(),
            Event::download_error(None, Some("org/repo"), "Missing download_id")
        );

        let err = Command::parse(r#"{"type":"download","download_id":"d1","repo_id":""}"#).unwrap_err();
        assert_eq!(
            err.into_event(),
            Event::download_error(Some("d1"), None, "Missing repo_id")
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        let err = Command::parse(r#"{"type":"dance"}"#).unwrap_err();
        assert_eq!(err.into_event(), Event::error(None, "Unknown type: dance"));

        let err = Command::parse("{not json").unwrap_err();
        assert_eq!(err.into_event(), Event::error(None, "Invalid JSON"));

        let err = Command::parse("[1,2]").unwrap_err();
        assert_eq!(err.error(), &ProtocolError::InvalidJson);
    }

    #[test]
    fn test_cancel_without_id_is_accepted() {
        assert_eq!(
            Command::parse(r#"{"type":"cancel","generation_id":5}"#).unwrap(),
            Command::Cancel { generation_id: None }
        );
        assert_eq!(
            Command::parse(r#"{"type":"download_cancel","download_id":"d"}"#).unwrap(),
            Command::DownloadCancel {
                download_id: Some("d".to_string())
            }
        );
    }
}
