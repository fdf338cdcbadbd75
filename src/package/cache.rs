//! Local versioned package cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! index.json                   metadata index, rewritten after every change
//! {package_id}@{generation}/   one directory per cached package
//! .staging/                    downloads being extracted and installed
//! ```
//!
//! A redownload never touches the directory a running job is reading from:
//! the new copy gets a fresh generation directory and the old one is retired.
//! Retired directories are deleted once the last [`PackageLease`] on them is
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::api::ServerApi;
use crate::error::PackageError;
use crate::package::archive;
use crate::package::deps::DependencyInstaller;
use crate::package::descriptor::{self, PackageDescriptor, VerifyReport};

const INDEX_FILE: &str = "index.json";
const STAGING_DIR: &str = ".staging";

/// Metadata kept for one cached package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCacheEntry {
    pub package_id: String,
    /// Version from the package descriptor, or the requested one.
    pub version: Option<String>,
    pub path: PathBuf,
    pub generation: u64,
    /// Last time the server was consulted for this package.
    pub last_check: DateTime<Utc>,
    pub downloaded_at: DateTime<Utc>,
}

impl PackageCacheEntry {
    /// Fresh means served without asking the server again.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (now - self.last_check).to_std() {
            Ok(elapsed) => elapsed < ttl,
            // last_check ahead of now (clock moved backwards)
            Err(_) => true,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if max_age.is_zero() {
            return true;
        }
        (now - self.last_check)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= max_age)
    }
}

#[derive(Debug, Default)]
struct LeaseSlot {
    count: usize,
    retired: bool,
}

/// Reference counts for package directories handed out to executions.
#[derive(Debug, Default)]
struct LeaseTable {
    slots: parking_lot::Mutex<HashMap<PathBuf, LeaseSlot>>,
}

impl LeaseTable {
    fn acquire(&self, path: &Path) {
        self.slots
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .count += 1;
    }

    fn release(&self, path: &Path) {
        let remove = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(path) else {
                return;
            };
            slot.count = slot.count.saturating_sub(1);
            if slot.count > 0 {
                return;
            }
            slots.remove(path).is_some_and(|slot| slot.retired)
        };
        if remove {
            discard_dir(path.to_path_buf());
        }
    }

    /// Mark a leased directory for deletion on last release. Returns `false`
    /// if nobody holds it, in which case the caller deletes it.
    fn retire(&self, path: &Path) -> bool {
        match self.slots.lock().get_mut(path) {
            Some(slot) => {
                slot.retired = true;
                true
            }
            None => false,
        }
    }

    fn count(&self, path: &Path) -> usize {
        self.slots.lock().get(path).map_or(0, |slot| slot.count)
    }
}

/// Delete a directory from a synchronous context.
fn discard_dir(path: PathBuf) {
    let remove = move || {
        if let Err(e) = std::fs::remove_dir_all(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove retired package directory");
        } else {
            tracing::debug!(path = %path.display(), "Removed retired package directory");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

/// A package directory pinned for the duration of one execution.
#[derive(Debug)]
pub struct PackageLease {
    package_id: String,
    version: Option<String>,
    path: PathBuf,
    table: Arc<LeaseTable>,
}

impl PackageLease {
    fn new(entry: &PackageCacheEntry, table: &Arc<LeaseTable>) -> Self {
        table.acquire(&entry.path);
        Self {
            package_id: entry.package_id.clone(),
            version: entry.version.clone(),
            path: entry.path.clone(),
            table: Arc::clone(table),
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PackageLease {
    fn drop(&mut self) {
        self.table.release(&self.path);
    }
}

/// Versioned on-disk cache of downloaded packages.
pub struct PackageCache {
    root: PathBuf,
    api: Arc<dyn ServerApi>,
    installer: DependencyInstaller,
    ttl: Duration,
    index: tokio::sync::Mutex<BTreeMap<String, PackageCacheEntry>>,
    /// Serializes downloads of the same package.
    resolving: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    leases: Arc<LeaseTable>,
    next_generation: AtomicU64,
}

impl PackageCache {
    /// Open (or create) the cache at `root`.
    ///
    /// Loads the metadata index, drops entries whose directory is gone and
    /// removes directories the index does not know about.
    pub async fn open(
        root: impl Into<PathBuf>,
        api: Arc<dyn ServerApi>,
        installer: DependencyInstaller,
        ttl: Duration,
    ) -> Result<Self, PackageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let index_path = root.join(INDEX_FILE);
        let mut index: BTreeMap<String, PackageCacheEntry> = match fs::read_to_string(&index_path)
            .await
        {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %index_path.display(), error = %e, "Package index is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        index.retain(|_, entry| entry.path.is_dir());

        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging).await?;
        }

        let mut read_dir = fs::read_dir(&root).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let path = dirent.path();
            if dirent.file_type().await?.is_dir() && !index.values().any(|e| e.path == path) {
                tracing::debug!(path = %path.display(), "Removing orphaned package directory");
                fs::remove_dir_all(&path).await?;
            }
        }

        let next_generation = index.values().map(|e| e.generation).max().unwrap_or(0) + 1;
        tracing::info!(root = %root.display(), packages = index.len(), "Package cache opened");

        let cache = Self {
            root,
            api,
            installer,
            ttl,
            index: tokio::sync::Mutex::new(index),
            resolving: parking_lot::Mutex::new(HashMap::new()),
            leases: Arc::new(LeaseTable::default()),
            next_generation: AtomicU64::new(next_generation),
        };
        cache.persist(&*cache.index.lock().await).await?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Make a package available locally and pin it.
    ///
    /// Without `force`, an explicit version matching the cached copy, or a
    /// fresh entry when no version is requested, is served with no network
    /// access. Everything else downloads a new copy; on failure the previous
    /// copy stays as it was.
    pub async fn resolve(
        &self,
        package_id: &str,
        version: Option<&str>,
        force: bool,
    ) -> Result<PackageLease, PackageError> {
        self.resolve_at(package_id, version, force, Utc::now()).await
    }

    pub(crate) async fn resolve_at(
        &self,
        package_id: &str,
        version: Option<&str>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<PackageLease, PackageError> {
        let lock = self.package_lock(package_id);
        let _guard = lock.lock().await;

        if !force {
            let index = self.index.lock().await;
            if let Some(entry) = index.get(package_id) {
                let hit = match version {
                    Some(v) => entry.version.as_deref() == Some(v),
                    None => entry.is_fresh(now, self.ttl),
                };
                if hit && entry.path.is_dir() {
                    tracing::debug!(package_id, version = ?entry.version, "Package served from cache");
                    return Ok(PackageLease::new(entry, &self.leases));
                }
            }
        }

        self.download(package_id, version, now).await
    }

    fn package_lock(&self, package_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.resolving
                .lock()
                .entry(package_id.to_string())
                .or_default(),
        )
    }

    async fn download(
        &self,
        package_id: &str,
        version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PackageLease, PackageError> {
        tracing::info!(package_id, version = ?version, "Downloading package");
        let bytes = self
            .api
            .download_package(package_id, version)
            .await
            .map_err(|e| PackageError::Unavailable {
                package_id: package_id.to_string(),
                reason: e.to_string(),
            })?;

        let staging = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        let staged = self.stage(package_id, bytes, &staging).await;
        let (package_root, descriptor) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let path = self
            .root
            .join(format!("{}@{generation}", dir_name(package_id)));
        let moved = fs::rename(&package_root, &path).await;
        let _ = fs::remove_dir_all(&staging).await;
        moved?;

        let resolved_version = descriptor
            .and_then(|d| d.version)
            .or_else(|| version.map(str::to_string));
        if let (Some(requested), Some(actual)) = (version, resolved_version.as_deref())
            && requested != actual
        {
            tracing::warn!(package_id, requested, actual, "Downloaded package version differs from request");
        }

        let entry = PackageCacheEntry {
            package_id: package_id.to_string(),
            version: resolved_version,
            path,
            generation,
            last_check: now,
            downloaded_at: Utc::now(),
        };

        let mut index = self.index.lock().await;
        let previous = index.insert(package_id.to_string(), entry.clone());
        if let Err(e) = self.persist(&index).await {
            match previous {
                Some(previous) => index.insert(package_id.to_string(), previous),
                None => index.remove(package_id),
            };
            drop(index);
            let _ = fs::remove_dir_all(&entry.path).await;
            tracing::warn!(package_id, error = %e, "Failed to persist cache index, keeping previous copy");
            return Err(e);
        }
        let lease = PackageLease::new(&entry, &self.leases);
        if let Some(previous) = previous {
            self.retire_dir(&previous.path).await;
        }
        drop(index);

        tracing::info!(package_id, version = ?entry.version, path = %entry.path.display(), "Package cached");
        Ok(lease)
    }

    /// Extract and install dependencies in the staging area.
    async fn stage(
        &self,
        package_id: &str,
        bytes: Vec<u8>,
        staging: &Path,
    ) -> Result<(PathBuf, Option<PackageDescriptor>), PackageError> {
        archive::extract(bytes, staging.to_path_buf()).await?;
        let package_root = archive::package_root(staging);
        self.installer.install(&package_root).await?;

        let descriptor = match PackageDescriptor::load(&package_root).await {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(package_id, error = %e, "Package has no usable descriptor");
                None
            }
        };
        Ok((package_root, descriptor))
    }

    /// Remove entries not checked within `max_age`. `Duration::ZERO` clears
    /// the cache. Directories still leased are deleted on release.
    pub async fn evict(&self, max_age: Duration) -> Result<usize, PackageError> {
        self.evict_at(max_age, Utc::now()).await
    }

    pub(crate) async fn evict_at(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, PackageError> {
        let mut index = self.index.lock().await;
        let expired: Vec<String> = index
            .values()
            .filter(|e| e.is_expired(now, max_age))
            .map(|e| e.package_id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::with_capacity(expired.len());
        for package_id in &expired {
            if let Some(entry) = index.remove(package_id) {
                removed.push(entry);
            }
        }
        self.persist(&index).await?;
        for entry in &removed {
            self.retire_dir(&entry.path).await;
        }

        tracing::info!(count = removed.len(), max_age_secs = max_age.as_secs(), "Evicted cached packages");
        Ok(removed.len())
    }

    async fn retire_dir(&self, path: &Path) {
        if self.leases.retire(path) {
            tracing::debug!(path = %path.display(), "Package directory in use, deferring removal");
            return;
        }
        if let Err(e) = fs::remove_dir_all(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove package directory");
        }
    }

    /// Check a package directory. Advisory.
    pub async fn verify(&self, path: &Path) -> VerifyReport {
        descriptor::verify(path).await
    }

    /// Install dependencies for a package directory.
    pub async fn install_dependencies(&self, path: &Path) -> Result<(), PackageError> {
        self.installer.install(path).await
    }

    pub async fn entry(&self, package_id: &str) -> Option<PackageCacheEntry> {
        self.index.lock().await.get(package_id).cloned()
    }

    pub async fn entries(&self) -> Vec<PackageCacheEntry> {
        self.index.lock().await.values().cloned().collect()
    }

    /// Number of live leases on a package directory.
    pub fn lease_count(&self, path: &Path) -> usize {
        self.leases.count(path)
    }

    async fn persist(&self, index: &BTreeMap<String, PackageCacheEntry>) -> Result<(), PackageError> {
        let json = serde_json::to_vec_pretty(index).map_err(|e| PackageError::Descriptor {
            path: self.root.join(INDEX_FILE),
            reason: e.to_string(),
        })?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }
}

/// File-system safe directory name for a package id.
fn dir_name(package_id: &str) -> String {
    package_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
