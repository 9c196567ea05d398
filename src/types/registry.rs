use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Declaration, DeclarationRegistry, FetchError};

const DEFAULT_TYPES_ENTRY: &str = "index.d.ts";

/// Declaration registry backed by an npm CDN (jsDelivr-style URL layout:
/// `<base>/<package>/<file>`).
pub struct HttpDeclarationRegistry {
    http_client: Arc<reqwest::Client>,
    base_url: String,
}

impl HttpDeclarationRegistry {
    pub fn new(http_client: Arc<reqwest::Client>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET a registry path as text. A 404 is `Ok(None)`.
    async fn get_text(&self, path: &str) -> Result<Option<String>, FetchError> {
        let url = self.url(path);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Http(format!("GET {url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Http(format!("reading {url}: {e}")))?;
        Ok(Some(body))
    }

    /// Entry declaration for `package`, from its `types`/`typings` field.
    /// `None` if the package is missing or ships no types.
    async fn declared_entry(&self, package: &str) -> Result<Option<String>, FetchError> {
        let Some(body) = self.get_text(&format!("{package}/package.json")).await? else {
            return Ok(None);
        };
        let manifest: Value = serde_json::from_str(&body)
            .map_err(|e| FetchError::Decode(format!("{package}/package.json: {e}")))?;
        Ok(types_field(&manifest).map(|entry| {
            format!("{package}/{}", entry.trim_start_matches("./"))
        }))
    }

    async fn fetch_entry(&self, resolved_path: String) -> Result<Option<Declaration>, FetchError> {
        Ok(self.get_text(&resolved_path).await?.map(|code| Declaration {
            code,
            resolved_path,
        }))
    }
}

#[async_trait]
impl DeclarationRegistry for HttpDeclarationRegistry {
    async fn fetch(&self, specifier: &str) -> Result<Option<Declaration>, FetchError> {
        if let Some(entry) = self.declared_entry(specifier).await? {
            if let Some(decl) = self.fetch_entry(entry).await? {
                return Ok(Some(decl));
            }
        }
        if specifier.starts_with("@types/") {
            return Ok(None);
        }

        let fallback = definitely_typed_name(specifier);
        tracing::debug!(specifier, fallback = %fallback, "no bundled types; trying DefinitelyTyped");
        let entry = match self.declared_entry(&fallback).await? {
            Some(entry) => entry,
            None => format!("{fallback}/{DEFAULT_TYPES_ENTRY}"),
        };
        self.fetch_entry(entry).await
    }

    async fn fetch_path(&self, resolved_path: &str) -> Result<Option<Declaration>, FetchError> {
        self.fetch_entry(resolved_path.to_string()).await
    }
}

fn types_field(manifest: &Value) -> Option<&str> {
    manifest["types"]
        .as_str()
        .or_else(|| manifest["typings"].as_str())
        .filter(|s| !s.is_empty())
}

/// `lodash` → `@types/lodash`, `@scope/pkg` → `@types/scope__pkg`.
fn definitely_typed_name(package: &str) -> String {
    match package.strip_prefix('@').and_then(|p| p.split_once('/')) {
        Some((scope, name)) => format!("@types/{scope}__{name}"),
        None => format!("@types/{package}"),
    }
}
