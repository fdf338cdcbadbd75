//! In-process entry points, registered by entry-file name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{JobError, RuntimeFault};
use crate::execution::{ExecutionContext, RunOutcome};
use crate::runner::{EntryPoint, LoadTarget, PackageLoader};

struct FnEntry<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EntryPoint for FnEntry<F>
where
    F: Fn(Arc<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunOutcome, RuntimeFault>> + Send + 'static,
{
    async fn run(&self, ctx: Arc<ExecutionContext>) -> Result<RunOutcome, RuntimeFault> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as an entry point.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn EntryPoint>
where
    F: Fn(Arc<ExecutionContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunOutcome, RuntimeFault>> + Send + 'static,
{
    Arc::new(FnEntry { f })
}

/// Registry of in-process entry points.
///
/// Entries are keyed by the entry file's path relative to the package root
/// (`main.py`, `src/run.sh`). A bare file name also matches at any depth.
#[derive(Default)]
pub struct NativeLoader {
    entries: RwLock<HashMap<String, Arc<dyn EntryPoint>>>,
}

impl NativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, entry: Arc<dyn EntryPoint>) {
        let name = name.into();
        tracing::debug!(entry = %name, "Registered native entry point");
        self.entries.write().await.insert(name, entry);
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PackageLoader for NativeLoader {
    async fn load(&self, target: &LoadTarget) -> Result<Arc<dyn EntryPoint>, JobError> {
        if !target.entry_file.is_file() {
            return Err(JobError::LoadFailure {
                path: target.entry_file.clone(),
                reason: "entry file does not exist".to_string(),
            });
        }

        let relative = target.relative_entry();
        let entries = self.entries.read().await;
        let file_name = target
            .entry_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        entries
            .get(&relative)
            .or_else(|| entries.get(&file_name))
            .cloned()
            .ok_or_else(|| JobError::LoadFailure {
                path: target.entry_file.clone(),
                reason: format!("no entry function registered for {relative}"),
            })
    }
}
