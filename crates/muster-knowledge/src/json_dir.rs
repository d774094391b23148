//! Directory-of-JSON-files backing
//!
//! `registry` lives at `<root>/registry.json`, `memory/001` at
//! `<root>/memory/001.json`. Writes go to a temporary sibling first and are
//! renamed into place, so readers never observe a half-written file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::DocumentStore;

pub struct JsonDirStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store dir {}", root.display()))?;
        info!("Opening JSON document store at {}", root.display());
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a document key to its file path
    fn path_for(&self, key: &str) -> PathBuf {
        match key.split_once('/') {
            Some((namespace, name)) => self
                .root
                .join(sanitize(namespace))
                .join(format!("{}.json", sanitize(name))),
            None => self.root.join(format!("{}.json", sanitize(key))),
        }
    }
}

/// Make a key segment safe to use as a single file name.
///
/// Percent-encodes `%`, path separators, NUL and a leading `.`, so distinct
/// segments always map to distinct file names.
fn sanitize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, c) in segment.chars().enumerate() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '\0' => out.push_str("%00"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

#[async_trait]
impl DocumentStore for JsonDirStore {
    fn backend_name(&self) -> &str {
        "json"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Invalid JSON in {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn save(&self, key: &str, doc: &Value) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let body = serde_json::to_string_pretty(doc).context("Failed to encode document")?;
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));

        tokio::fs::write(&tmp, body.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
        }

        debug!("Saved document {} to {}", key, path.display());
        Ok(())
    }
}
