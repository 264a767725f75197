use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use sandbox_studio_error::SandboxError;
use tracing::debug;
use url::Url;

/// Durable storage for published bundle artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Stores `bytes` under `key` and returns its public url.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, SandboxError>;

    fn public_url(&self, key: &str) -> String;
}

/// `PUT {upload_base}/{key}` with a bearer token; objects are served from
/// `public_base`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    upload_base: Url,
    public_base: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        upload_base: &str,
        public_base: Option<&str>,
        token: Option<String>,
    ) -> Result<Self, SandboxError> {
        let upload_base = Url::parse(&with_trailing_slash(upload_base)).map_err(|err| {
            SandboxError::configuration(format!("invalid object store url {upload_base}: {err}"))
        })?;
        let public_base = with_trailing_slash(public_base.unwrap_or(upload_base.as_str()));
        Ok(Self {
            client: Client::new(),
            upload_base,
            public_base,
            token,
        })
    }
}

fn with_trailing_slash(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, SandboxError> {
        let url = self
            .upload_base
            .join(key.trim_start_matches('/'))
            .map_err(|err| SandboxError::validation("key", format!("{key}: {err}")))?;
        let mut request = self
            .client
            .put(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SandboxError::transient(format!("object store: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => SandboxError::configuration(format!("object store rejected credentials ({status})")),
                code if code >= 500 => SandboxError::transient(format!("object store returned {status}")),
                _ => SandboxError::internal(format!("object store returned {status}: {body}")),
            });
        }
        debug!(key = %key, url = %url, "object stored");
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}{}", self.public_base, key.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug)]
pub struct MemoryObjectStore {
    public_base: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    fail: Mutex<Option<SandboxError>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory://objects/")
    }
}

impl MemoryObjectStore {
    pub fn new(public_base: &str) -> Self {
        Self {
            public_base: with_trailing_slash(public_base),
            objects: Mutex::new(BTreeMap::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Every subsequent `put` fails with `err` until cleared.
    pub fn fail_with(&self, err: Option<SandboxError>) {
        *self
            .fail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = err;
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, SandboxError> {
        if let Some(err) = self
            .fail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Err(err);
        }
        self.objects().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}{}", self.public_base, key.trim_start_matches('/'))
    }
}

/// Content type for a published file, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
