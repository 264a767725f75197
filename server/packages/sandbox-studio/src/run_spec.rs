//! Turns raw run arguments into a validated [`ExecutionSpec`].
//!
//! Arguments arrive either as `key=value` tokens (CLI) or as a JSON body
//! (HTTP). Both go through the same [`FIELDS`] table so they validate
//! identically. A `systemPromptFile` is only located here; its contents are
//! read from the sandbox by [`load_system_prompt`] once a run has a handle.

use std::collections::BTreeMap;

use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;
use utoipa::ToSchema;

use crate::sandbox::SandboxHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Path inside the sandbox.
    Path,
    /// JSON array of strings.
    JsonList,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: &'static str,
}

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "prompt",
        kind: FieldKind::Text,
        required: true,
        default: "",
    },
    FieldSpec {
        name: "cwd",
        kind: FieldKind::Path,
        required: false,
        default: "configured default working directory",
    },
    FieldSpec {
        name: "model",
        kind: FieldKind::Text,
        required: false,
        default: "configured default model",
    },
    FieldSpec {
        name: "systemPrompt",
        kind: FieldKind::Text,
        required: false,
        default: "none",
    },
    FieldSpec {
        name: "systemPromptFile",
        kind: FieldKind::Path,
        required: false,
        default: "none; overrides systemPrompt",
    },
    FieldSpec {
        name: "imageUrls",
        kind: FieldKind::JsonList,
        required: false,
        default: "[]",
    },
    FieldSpec {
        name: "withDeployHook",
        kind: FieldKind::Bool,
        required: false,
        default: "false",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SystemPromptSource {
    Inline,
    File { path: String },
}

/// A validated, immutable description of one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_source: Option<SystemPromptSource>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub image_urls: Vec<String>,
    pub with_deploy_hook: bool,
}

/// Run trigger body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    /// JSON array of URL strings, or a string holding one.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub image_urls: Option<Value>,
    #[serde(default)]
    pub with_deploy_hook: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolverDefaults {
    pub cwd: String,
}

impl Default for ResolverDefaults {
    fn default() -> Self {
        Self {
            cwd: "/home/user/app".to_string(),
        }
    }
}

/// Resolves `key=value` tokens. Keys may be camelCase or kebab-case and
/// values may be double-quoted.
pub fn resolve_tokens<I, S>(tokens: I, defaults: &ResolverDefaults) -> Result<ExecutionSpec, SandboxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut raw = BTreeMap::new();
    for token in tokens {
        let token = token.as_ref();
        let Some((key, value)) = token.split_once('=') else {
            return Err(SandboxError::validation(token, "expected key=value"));
        };
        let field = lookup(key.trim())?;
        raw.insert(field.name, unquote(value.trim()).to_string());
    }
    build(raw, defaults)
}

pub fn resolve_request(
    request: &RunRequest,
    defaults: &ResolverDefaults,
) -> Result<ExecutionSpec, SandboxError> {
    let mut raw = BTreeMap::new();
    let text_fields = [
        ("prompt", &request.prompt),
        ("cwd", &request.cwd),
        ("model", &request.model),
        ("systemPrompt", &request.system_prompt),
        ("systemPromptFile", &request.system_prompt_file),
    ];
    for (name, value) in text_fields {
        if let Some(value) = value {
            raw.insert(name, value.clone());
        }
    }
    match &request.image_urls {
        Some(Value::String(text)) => {
            raw.insert("imageUrls", text.clone());
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            raw.insert("imageUrls", other.to_string());
        }
    }
    if let Some(flag) = request.with_deploy_hook {
        raw.insert("withDeployHook", flag.to_string());
    }
    build(raw, defaults)
}

fn lookup(key: &str) -> Result<&'static FieldSpec, SandboxError> {
    let normalized = kebab_to_camel(key);
    FIELDS
        .iter()
        .find(|field| field.name == normalized)
        .ok_or_else(|| SandboxError::validation(key, "unknown argument"))
}

fn kebab_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '-' || ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

fn build(
    mut raw: BTreeMap<&'static str, String>,
    defaults: &ResolverDefaults,
) -> Result<ExecutionSpec, SandboxError> {
    for field in FIELDS {
        let present = raw
            .get(field.name)
            .is_some_and(|value| !value.trim().is_empty());
        if field.required && !present {
            return Err(SandboxError::validation(field.name, "is required"));
        }
    }

    let prompt = raw.remove("prompt").unwrap_or_default().trim().to_string();
    let cwd = non_empty(raw.remove("cwd")).unwrap_or_else(|| defaults.cwd.clone());
    if !cwd.starts_with('/') {
        return Err(SandboxError::validation("cwd", "must be an absolute path"));
    }
    let model = non_empty(raw.remove("model"));
    let with_deploy_hook = match raw.remove("withDeployHook") {
        Some(value) => parse_bool("withDeployHook", &value)?,
        None => false,
    };
    let image_urls = match raw.remove("imageUrls") {
        Some(value) => parse_image_urls(&value),
        None => Vec::new(),
    };

    let inline = non_empty(raw.remove("systemPrompt"));
    let file = non_empty(raw.remove("systemPromptFile"));
    let (system_prompt, system_prompt_source) = match (file, inline) {
        (Some(path), inline) => {
            if inline.is_some() {
                info!(path = %path, "systemPromptFile given; ignoring inline systemPrompt");
            }
            let path = prompt_file_path(&cwd, &path)?;
            (None, Some(SystemPromptSource::File { path }))
        }
        (None, Some(inline)) => (Some(inline), Some(SystemPromptSource::Inline)),
        (None, None) => (None, None),
    };

    Ok(ExecutionSpec {
        prompt,
        system_prompt,
        system_prompt_source,
        cwd,
        model,
        image_urls,
        with_deploy_hook,
    })
}

/// Resolves a prompt file against `cwd`. The result must stay inside `cwd`.
fn prompt_file_path(cwd: &str, path: &str) -> Result<String, SandboxError> {
    let joined = SandboxHandle::resolve_path(cwd, path);
    let mut parts: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }
    let normalized = format!("/{}", parts.join("/"));
    let root = cwd.trim_end_matches('/');
    let inside = normalized
        .strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'));
    if inside {
        Ok(normalized)
    } else {
        Err(SandboxError::validation(
            "systemPromptFile",
            format!("{path} is outside the working directory {cwd}"),
        ))
    }
}

/// The system prompt for a run. File sources are read from the sandbox.
pub async fn load_system_prompt(
    spec: &ExecutionSpec,
    sandbox: &SandboxHandle,
) -> Result<Option<String>, SandboxError> {
    let Some(SystemPromptSource::File { path }) = &spec.system_prompt_source else {
        return Ok(spec.system_prompt.clone());
    };
    let bytes = sandbox.read_file(path).await.map_err(|err| {
        SandboxError::validation("systemPromptFile", format!("cannot read {path}: {err}"))
    })?;
    let contents = String::from_utf8(bytes).map_err(|_| {
        SandboxError::validation("systemPromptFile", format!("{path} is not valid UTF-8"))
    })?;
    Ok(Some(contents))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(field: &str, value: &str) -> Result<bool, SandboxError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(SandboxError::validation(
            field,
            format!("expected a boolean, got {other:?}"),
        )),
    }
}

/// Unparseable input degrades to an empty list; invalid entries are dropped.
fn parse_image_urls(value: &str) -> Vec<String> {
    let urls: Vec<String> = match serde_json::from_str(value) {
        Ok(urls) => urls,
        Err(err) => {
            warn!(error = %err, "imageUrls is not a JSON array of strings; ignoring attachments");
            return Vec::new();
        }
    };
    urls.into_iter()
        .filter(|url| match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => true,
            _ => {
                warn!(url = %url, "dropping image url");
                false
            }
        })
        .collect()
}
