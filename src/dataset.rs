//! Iterable providers of dataset items. Richer remote-backed loaders are
//! external collaborators; this crate ships only the minimal sources
//! needed for programmatic use and tests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::types::Item;

/// Provides `get_items()`; a `name` used as the dataset identity embedded
/// in every checkpoint row.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn name(&self) -> &str;
    async fn get_items(&self) -> Result<Vec<Item>>;
}

/// A dataset backed by an in-memory `Vec<Item>`, for programmatic callers
/// and tests.
pub struct InMemoryDataset {
    name: String,
    items: Vec<Item>,
}

impl InMemoryDataset {
    pub fn new(name: impl Into<String>, items: Vec<Item>) -> Self {
        Self { name: name.into(), items }
    }
}

#[async_trait]
impl DatasetSource for InMemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_items(&self) -> Result<Vec<Item>> {
        Ok(self.items.clone())
    }
}

/// A dataset backed by a file of one JSON object per line, each
/// deserializing to an [`Item`].
pub struct JsonlDataset {
    name: String,
    path: PathBuf,
}

impl JsonlDataset {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl DatasetSource for JsonlDataset {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(dataset_name = %self.name, path = %self.path.display()))]
    async fn get_items(&self) -> Result<Vec<Item>> {
        load_jsonl(&self.path).await
    }
}

async fn load_jsonl(path: &Path) -> Result<Vec<Item>> {
    let content = tokio::fs::read_to_string(path).await.with_context(|| format!("reading dataset file {}", path.display()))?;
    debug!(bytes = content.len(), "Dataset file read");

    let mut items = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: Item = serde_json::from_str(line).with_context(|| format!("parsing dataset line {} of {}", line_no + 1, path.display()))?;
        items.push(item);
    }

    info!(total_items = items.len(), "Dataset loaded successfully");
    Ok(items)
}
