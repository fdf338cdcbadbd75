//! Package cache: download, extraction, dependency install and lookup of
//! automation packages.

pub mod archive;
pub mod cache;
pub mod deps;
pub mod descriptor;

pub use cache::{PackageCache, PackageCacheEntry, PackageLease};
pub use deps::{DEPENDENCY_MANIFEST, DependencyInstaller};
pub use descriptor::{PackageDescriptor, VerifyReport, locate_entry_point, verify};
