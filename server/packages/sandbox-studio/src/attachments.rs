//! Image attachment download into the sandbox.

use reqwest::header::LOCATION;
use reqwest::{redirect, Client, Response, StatusCode};
use sandbox_studio_error::SandboxError;
use tracing::{debug, info};
use url::Url;

use crate::sandbox::SandboxHandle;

/// Outside every project tree so checkpoints never stage attachments.
pub const ATTACHMENTS_DIR: &str = "/tmp/sandbox-studio/attachments";

/// Client used for attachment fetches. Redirects are handled by hand so only
/// one hop is followed.
pub fn attachment_client() -> Result<Client, SandboxError> {
    Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .map_err(|err| SandboxError::configuration(format!("http client: {err}")))
}

/// Downloads every url in order and writes it below
/// `ATTACHMENTS_DIR/<run_id>/`. Returns the sandbox paths in the same order.
pub async fn download_images(
    client: &Client,
    sandbox: &SandboxHandle,
    run_id: &str,
    urls: &[String],
) -> Result<Vec<String>, SandboxError> {
    let mut paths = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let bytes = fetch(client, url).await?;
        let path = format!("{ATTACHMENTS_DIR}/{run_id}/{index}-{}", file_name(url));
        sandbox.write_file(&path, &bytes).await?;
        debug!(url = %url, path = %path, bytes = bytes.len(), "attachment stored");
        paths.push(path);
    }
    if !paths.is_empty() {
        info!(run_id = %run_id, count = paths.len(), "attachments downloaded");
    }
    Ok(paths)
}

async fn fetch(client: &Client, url: &str) -> Result<Vec<u8>, SandboxError> {
    let parsed = Url::parse(url)
        .map_err(|err| SandboxError::validation("imageUrls", format!("{url}: {err}")))?;
    let response = get(client, parsed.clone()).await?;
    let response = if response.status().is_redirection() {
        let next = redirect_target(&parsed, &response)?;
        debug!(from = %parsed, to = %next, "following attachment redirect");
        get(client, next).await?
    } else {
        response
    };
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(url, status));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| SandboxError::transient(format!("{url}: {err}")))?;
    Ok(bytes.to_vec())
}

async fn get(client: &Client, url: Url) -> Result<Response, SandboxError> {
    client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| SandboxError::transient(format!("{url}: {err}")))
}

fn redirect_target(base: &Url, response: &Response) -> Result<Url, SandboxError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            SandboxError::validation("imageUrls", format!("{base}: redirect without location"))
        })?;
    base.join(location)
        .map_err(|err| SandboxError::validation("imageUrls", format!("{base}: {err}")))
}

fn status_error(url: &str, status: StatusCode) -> SandboxError {
    if status.is_server_error() {
        SandboxError::transient(format!("{url} returned {status}"))
    } else {
        SandboxError::validation("imageUrls", format!("{url} returned {status}"))
    }
}

fn file_name(url: &str) -> String {
    let name = Url::parse(url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        "image".to_string()
    } else {
        cleaned
    }
}
