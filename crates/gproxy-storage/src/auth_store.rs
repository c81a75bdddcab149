//! File-backed Auth Store (spec §4.B): each auth is one JSON file under a
//! configured base directory, the document body being exactly the auth's
//! `Metadata` map. Provider and file name are reconstructed at load time
//! from the path: the first path segment under the base directory names the
//! provider, and the file stem (sans `.json`) is the id when `Metadata`
//! itself doesn't carry one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gproxy_provider_core::Auth;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum AuthStoreError {
    #[error("auth id must not be empty or whitespace")]
    EmptyId,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed auth document at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Auth>, AuthStoreError>;
    async fn save(&self, auth: &Auth) -> Result<String, AuthStoreError>;
    async fn delete(&self, id: &str) -> Result<(), AuthStoreError>;
}

pub struct FileAuthStore {
    base_dir: PathBuf,
}

impl FileAuthStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, provider: &str, file_name: &str) -> PathBuf {
        self.base_dir.join(provider).join(file_name)
    }

    async fn walk(dir: PathBuf, out: &mut Vec<PathBuf>) -> Result<(), AuthStoreError> {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut subdirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                subdirs.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
        for subdir in subdirs {
            Box::pin(Self::walk(subdir, out)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn list(&self) -> Result<Vec<Auth>, AuthStoreError> {
        let mut paths = Vec::new();
        Self::walk(self.base_dir.clone(), &mut paths).await?;

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable auth file");
                    continue;
                }
            };
            let document: Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping malformed auth file");
                    continue;
                }
            };
            let Value::Object(map) = document else {
                tracing::warn!(path = %path.display(), "skipping non-object auth document");
                continue;
            };
            let Some(auth) = auth_from_document(&self.base_dir, &path, map) else {
                continue;
            };
            out.push(auth);
        }
        Ok(out)
    }

    async fn save(&self, auth: &Auth) -> Result<String, AuthStoreError> {
        if auth.id.trim().is_empty() {
            return Err(AuthStoreError::EmptyId);
        }
        let file_name = auth
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.json", auth.id));
        let path = self.path_for(&auth.provider, &file_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let document = metadata_document(auth);
        let body = serde_json::to_vec_pretty(&document).expect("metadata map always serializes");

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(auth.id.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), AuthStoreError> {
        if id.trim().is_empty() {
            return Err(AuthStoreError::EmptyId);
        }
        let mut paths = Vec::new();
        Self::walk(self.base_dir.clone(), &mut paths).await?;
        for path in paths {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem == id {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) | Err(_) if !path.exists() => {}
                    Err(err) => return Err(err.into()),
                }
                return Ok(());
            }
        }
        Ok(())
    }
}

/// The persisted document is exactly the `Metadata` map, plus a small set of
/// well-known keys used to round-trip fields that aren't themselves
/// metadata (`id`, `label`, `prefix`, `disabled`, `proxy_url`, flat
/// `Attributes`) so `Save`/`List` round-trip losslessly.
fn metadata_document(auth: &Auth) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (k, v) in &auth.metadata {
        map.insert(k.clone(), v.clone());
    }
    map.insert("id".to_string(), Value::String(auth.id.clone()));
    if let Some(label) = &auth.label {
        map.insert("label".to_string(), Value::String(label.clone()));
    }
    if let Some(prefix) = &auth.prefix {
        map.insert("prefix".to_string(), Value::String(prefix.clone()));
    }
    if auth.disabled {
        map.insert("disabled".to_string(), Value::Bool(true));
    }
    if let Some(proxy) = &auth.proxy_url {
        map.insert("proxy_url".to_string(), Value::String(proxy.clone()));
    }
    if !auth.attributes.is_empty() {
        let attrs = auth
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        map.insert("attributes".to_string(), Value::Object(attrs));
    }
    map
}

fn auth_from_document(
    base_dir: &Path,
    path: &Path,
    mut map: serde_json::Map<String, Value>,
) -> Option<Auth> {
    let provider = path
        .strip_prefix(base_dir)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or("unknown")
        .to_string();

    let file_name = path.file_name()?.to_str()?.to_string();

    let id = map
        .remove("id")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("auth")
                .to_string()
        });
    let label = map
        .remove("label")
        .and_then(|v| v.as_str().map(str::to_string));
    let prefix = map
        .remove("prefix")
        .and_then(|v| v.as_str().map(str::to_string));
    let disabled = map
        .remove("disabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let proxy_url = map
        .remove("proxy_url")
        .and_then(|v| v.as_str().map(str::to_string));
    let attributes: HashMap<String, String> = map
        .remove("attributes")
        .and_then(|v| v.as_object().cloned())
        .map(|obj| {
            obj.into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut auth = Auth::new(provider);
    auth.id = id;
    auth.label = label;
    auth.prefix = prefix;
    auth.disabled = disabled;
    auth.proxy_url = proxy_url;
    auth.attributes = attributes;
    auth.file_name = Some(file_name);
    auth.metadata = map.into_iter().collect();
    auth.ensure_index();
    Some(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_then_list_round_trips_provider_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());

        let mut auth = Auth::new("geminicli");
        auth.id = "auth-1".to_string();
        auth.metadata.insert(
            "access_token".to_string(),
            json!("tok_abc"),
        );
        auth.metadata.insert("project_id".to_string(), json!("proj-1"));

        let id = store.save(&auth).await.unwrap();
        assert_eq!(id, "auth-1");

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].provider, "geminicli");
        assert_eq!(listed[0].id, "auth-1");
        assert_eq!(
            listed[0].metadata.get("access_token").unwrap(),
            "tok_abc"
        );
    }

    #[tokio::test]
    async fn save_is_atomic_via_tmp_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());
        let mut auth = Auth::new("claude");
        auth.id = "a1".to_string();
        store.save(&auth).await.unwrap();

        let path = dir.path().join("claude").join("a1.json");
        assert!(path.exists());
        let tmp_path = dir.path().join("claude").join("a1.json.tmp");
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn list_skips_malformed_and_non_json_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("claude"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("claude").join("broken.json"), b"not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("claude").join("readme.txt"), b"hi")
            .await
            .unwrap();

        let store = FileAuthStore::new(dir.path());
        let listed = store.list().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_matching_file_and_is_noop_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());
        let mut auth = Auth::new("claude");
        auth.id = "a1".to_string();
        store.save(&auth).await.unwrap();

        store.delete("a1").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        store.delete("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn delete_rejects_empty_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());
        assert!(matches!(
            store.delete("  ").await,
            Err(AuthStoreError::EmptyId)
        ));
    }
}
