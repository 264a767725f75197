use std::collections::BTreeMap;

use sandbox_studio_error::SandboxError;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

use crate::sandbox::SandboxHandle;

pub const ASSET_MANIFEST_PATH: &str = ".studio/assets.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AssetEntry {
    #[serde(default)]
    pub url: Option<String>,
}

/// Which local files have been published, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AssetManifest {
    #[serde(default)]
    pub assets: BTreeMap<String, AssetEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublishedAsset {
    pub path: String,
    pub url: String,
}

impl AssetManifest {
    /// Reads the manifest below `cwd`. A missing file is an empty manifest;
    /// an unparseable one is logged and treated the same way.
    pub async fn load(sandbox: &SandboxHandle, cwd: &str) -> Result<Self, SandboxError> {
        let path = SandboxHandle::resolve_path(cwd, ASSET_MANIFEST_PATH);
        let bytes = match sandbox.read_file(&path).await {
            Ok(bytes) => bytes,
            Err(SandboxError::NotFound { .. }) => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(manifest),
            Err(err) => {
                warn!(sandbox_id = %sandbox.id, path = %path, error = %err, "ignoring corrupt asset manifest");
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, sandbox: &SandboxHandle, cwd: &str) -> Result<(), SandboxError> {
        let path = SandboxHandle::resolve_path(cwd, ASSET_MANIFEST_PATH);
        let bytes = serde_json::to_vec_pretty(self)?;
        sandbox.write_file(&path, &bytes).await
    }

    pub fn publish(&mut self, path: &str, url: &str) {
        self.assets.insert(
            path.to_string(),
            AssetEntry {
                url: Some(url.to_string()),
            },
        );
    }

    /// Entries that have a durable url, in path order.
    pub fn published(&self) -> Vec<PublishedAsset> {
        self.assets
            .iter()
            .filter_map(|(path, entry)| {
                entry.url.as_ref().map(|url| PublishedAsset {
                    path: path.clone(),
                    url: url.clone(),
                })
            })
            .collect()
    }
}
