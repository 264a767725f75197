use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sandbox_studio_error::SandboxError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{CommandOutput, CommandRequest, LineStream, SandboxInfo, SandboxProvider};

const API_KEY_HEADER: &str = "X-API-Key";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sandbox provider backed by a REST control plane.
#[derive(Debug, Clone)]
pub struct HttpSandboxProvider {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PauseResponse {
    sandbox_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileContents {
    content_base64: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<String>,
}

impl HttpSandboxProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, SandboxError> {
        let mut base_url = Url::parse(base_url).map_err(|err| {
            SandboxError::configuration(format!("invalid sandbox API url {base_url}: {err}"))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|err| SandboxError::configuration(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, sandbox_id: &str, suffix: &str) -> Result<Url, SandboxError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SandboxError::configuration("sandbox API url cannot be a base"))?
            .pop_if_empty()
            .push("sandboxes")
            .push(sandbox_id)
            .extend(suffix.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    async fn send(&self, sandbox_id: &str, builder: RequestBuilder) -> Result<Response, SandboxError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(sandbox_id, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        sandbox_id: &str,
        builder: RequestBuilder,
    ) -> Result<T, SandboxError> {
        let response = self.send(sandbox_id, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| SandboxError::internal(format!("sandbox API response: {err}")))
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        let url = self.endpoint(sandbox_id, "")?;
        self.send_json(sandbox_id, self.client.get(url)).await
    }

    async fn pause(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        let url = self.endpoint(sandbox_id, "pause")?;
        let response: PauseResponse = self.send_json(sandbox_id, self.client.post(url)).await?;
        Ok(response.sandbox_id)
    }

    async fn resume(&self, sandbox_id: &str) -> Result<SandboxInfo, SandboxError> {
        let url = self.endpoint(sandbox_id, "resume")?;
        self.send_json(sandbox_id, self.client.post(url)).await
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandOutput, SandboxError> {
        let url = self.endpoint(sandbox_id, "commands")?;
        let mut builder = self.client.post(url).json(request);
        if let Some(timeout_ms) = request.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        debug!(sandbox_id = %sandbox_id, command = %request.command, "sandbox exec");
        self.send_json(sandbox_id, builder).await
    }

    async fn exec_stream(
        &self,
        sandbox_id: &str,
        request: &CommandRequest,
    ) -> Result<LineStream, SandboxError> {
        let url = self.endpoint(sandbox_id, "commands/stream")?;
        debug!(sandbox_id = %sandbox_id, command = %request.command, "sandbox exec stream");
        let response = self
            .send(sandbox_id, self.client.post(url).json(request))
            .await?;
        let bytes = response.bytes_stream().map_err(map_reqwest_error);
        Ok(split_lines(bytes))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let url = self.endpoint(sandbox_id, "files")?;
        let builder = self.client.get(url).query(&[("path", path)]);
        let contents: FileContents = match self.send_json(sandbox_id, builder).await {
            Err(SandboxError::NotFound { .. }) => {
                return Err(SandboxError::not_found("file", path));
            }
            other => other?,
        };
        base64::engine::general_purpose::STANDARD
            .decode(contents.content_base64.as_bytes())
            .map_err(|err| SandboxError::internal(format!("file {path} is not base64: {err}")))
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        let url = self.endpoint(sandbox_id, "files")?;
        let body = FileContents {
            content_base64: base64::engine::general_purpose::STANDARD.encode(contents),
        };
        self.send(
            sandbox_id,
            self.client.put(url).query(&[("path", path)]).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn list_files(&self, sandbox_id: &str, dir: &str) -> Result<Vec<String>, SandboxError> {
        let url = self.endpoint(sandbox_id, "files/list")?;
        let builder = self.client.get(url).query(&[("path", dir)]);
        let list: FileList = self.send_json(sandbox_id, builder).await?;
        Ok(list.files)
    }
}

async fn check_status(sandbox_id: &str, response: Response) -> Result<Response, SandboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_status(sandbox_id, status, &body))
}

fn map_status(sandbox_id: &str, status: StatusCode, body: &str) -> SandboxError {
    match status {
        StatusCode::NOT_FOUND => SandboxError::not_found("sandbox", sandbox_id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SandboxError::configuration(format!(
            "sandbox API rejected credentials ({status})"
        )),
        StatusCode::CONFLICT => SandboxError::conflict(body.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SandboxError::transient(format!("sandbox API returned {status}"))
        }
        status if status.is_server_error() => {
            SandboxError::transient(format!("sandbox API returned {status}: {body}"))
        }
        status => SandboxError::internal(format!("sandbox API returned {status}: {body}")),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SandboxError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        SandboxError::transient(err.to_string())
    } else {
        SandboxError::internal(err.to_string())
    }
}

/// Re-chunks a byte stream into newline-terminated lines. A trailing partial
/// line is emitted when the stream ends.
pub(crate) fn split_lines<S, B>(bytes: S) -> LineStream
where
    S: futures::Stream<Item = Result<B, SandboxError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    let lines = stream::unfold(state, |(mut bytes, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1])
                    .trim_end_matches('\r')
                    .to_string();
                return Some((Ok(text), (bytes, buffer, done)));
            }
            if done {
                if buffer.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&buffer).to_string();
                buffer.clear();
                return Some((Ok(text), (bytes, buffer, done)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    done = true;
                    buffer.clear();
                    return Some((Err(err), (bytes, buffer, done)));
                }
                None => done = true,
            }
        }
    });
    Box::pin(lines)
}
