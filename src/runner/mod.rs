//! Loading and running package entry points.
//!
//! A [`PackageLoader`] turns a located entry file into an [`EntryPoint`];
//! the executor only ever talks to that narrow contract.

pub mod native;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{JobError, RuntimeFault};
use crate::execution::{ExecutionContext, RunOutcome};
use crate::package::PackageDescriptor;

pub use native::NativeLoader;
pub use process::ProcessLoader;

/// What a loader is asked to load.
#[derive(Debug, Clone)]
pub struct LoadTarget {
    /// Entry file inside the package directory.
    pub entry_file: PathBuf,
    pub package_dir: PathBuf,
    pub descriptor: Option<PackageDescriptor>,
}

impl LoadTarget {
    /// Entry file relative to the package directory, `/`-separated.
    pub fn relative_entry(&self) -> String {
        let rel = self
            .entry_file
            .strip_prefix(&self.package_dir)
            .unwrap_or(&self.entry_file);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A loaded, runnable entry point.
#[async_trait]
pub trait EntryPoint: Send + Sync {
    /// Run to completion. Faults raised by package code come back as
    /// [`RuntimeFault`].
    async fn run(&self, ctx: Arc<ExecutionContext>) -> Result<RunOutcome, RuntimeFault>;
}

/// Loads entry points from package files.
#[async_trait]
pub trait PackageLoader: Send + Sync {
    /// Missing files or entry functions are `JobError::LoadFailure`.
    async fn load(&self, target: &LoadTarget) -> Result<Arc<dyn EntryPoint>, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_entry_uses_forward_slashes() {
        let target = LoadTarget {
            entry_file: PathBuf::from("/cache/bot@1/src/main.py"),
            package_dir: PathBuf::from("/cache/bot@1"),
            descriptor: None,
        };
        assert_eq!(target.relative_entry(), "src/main.py");
    }
}
