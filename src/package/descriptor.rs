//! Package descriptor, verification and entry-point lookup.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::fs;

use crate::error::{JobError, PackageError};

/// Descriptor file at the root of every package.
pub const DESCRIPTOR_FILE: &str = "manifest.json";

/// Conventional entry-point file names, tried in order.
pub const DEFAULT_ENTRY_POINTS: &[&str] = &["main.sh", "main.py", "main.js"];

/// Extensions considered runnable when discovering an entry point.
pub const SCRIPT_EXTENSIONS: &[&str] = &["sh", "py", "js"];

/// Directory dependency installs write into. Never searched for entry points.
pub const DEPS_DIR: &str = ".deps";

/// Parsed `manifest.json`.
///
/// Text fields also accept JSON numbers and booleans, so `"version": 2`
/// reads as `"2"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: Option<String>,
    pub version: Option<String>,
    pub entry_point: Option<String>,
    pub description: Option<String>,
}

impl PackageDescriptor {
    /// Read and parse the descriptor in `dir`. Fields of an unusable type
    /// are logged and left empty.
    pub async fn load(dir: &Path) -> Result<Self, PackageError> {
        let (descriptor, invalid) = Self::load_checked(dir).await?;
        for field in invalid {
            tracing::warn!(dir = %dir.display(), field, "Ignoring descriptor field with unusable type");
        }
        Ok(descriptor)
    }

    /// Like [`load`](Self::load), also returning the names of fields that
    /// were present but not a string, number or boolean.
    pub async fn load_checked(dir: &Path) -> Result<(Self, Vec<&'static str>), PackageError> {
        let path = dir.join(DESCRIPTOR_FILE);
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|e| PackageError::Descriptor {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Self::parse(&path, &raw)
    }

    fn parse(path: &Path, raw: &str) -> Result<(Self, Vec<&'static str>), PackageError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| PackageError::Descriptor {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let Value::Object(fields) = value else {
            return Err(PackageError::Descriptor {
                path: path.to_path_buf(),
                reason: "descriptor must be a JSON object".to_string(),
            });
        };

        let mut invalid = Vec::new();
        let descriptor = Self {
            name: text_field(&fields, "name", &mut invalid),
            version: text_field(&fields, "version", &mut invalid),
            entry_point: text_field(&fields, "entry_point", &mut invalid),
            description: text_field(&fields, "description", &mut invalid),
        };
        Ok((descriptor, invalid))
    }
}

fn text_field(
    fields: &Map<String, Value>,
    key: &'static str,
    invalid: &mut Vec<&'static str>,
) -> Option<String> {
    match fields.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => {
            invalid.push(key);
            None
        }
    }
}

/// Outcome of [`verify`]. Advisory: the caller decides whether to proceed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

/// Check a package directory for a usable descriptor.
///
/// A missing or unparsable descriptor stops the check immediately; all other
/// problems, including fields of the wrong type, are collected.
pub async fn verify(dir: &Path) -> VerifyReport {
    let path = dir.join(DESCRIPTOR_FILE);
    if !path.exists() {
        return VerifyReport {
            ok: false,
            issues: vec![format!("{DESCRIPTOR_FILE} not found")],
        };
    }

    let (descriptor, invalid) = match PackageDescriptor::load_checked(dir).await {
        Ok(parsed) => parsed,
        Err(e) => {
            return VerifyReport {
                ok: false,
                issues: vec![e.to_string()],
            };
        }
    };

    let mut issues: Vec<String> = invalid
        .iter()
        .map(|field| format!("field {field} must be a string or number"))
        .collect();
    let missing = |key: &'static str, field: &Option<String>| {
        !invalid.contains(&key) && field.as_deref().is_none_or(|v| v.trim().is_empty())
    };
    if missing("name", &descriptor.name) {
        issues.push("missing required field: name".to_string());
    }
    if missing("version", &descriptor.version) {
        issues.push("missing required field: version".to_string());
    }
    match descriptor.entry_point.as_deref() {
        Some(entry) if !entry.trim().is_empty() => {
            if !dir.join(entry).is_file() {
                issues.push(format!("entry point {entry} does not exist"));
            }
        }
        _ if invalid.contains(&"entry_point") => {}
        _ => issues.push("missing required field: entry_point".to_string()),
    }

    VerifyReport {
        ok: issues.is_empty(),
        issues,
    }
}

/// Find the file to execute for a package.
///
/// Precedence: the descriptor's `entry_point`, then the conventional default
/// names, then the first script found by a depth-first walk with entries
/// visited in name order.
pub async fn locate_entry_point(
    dir: &Path,
    descriptor: Option<&PackageDescriptor>,
) -> Result<PathBuf, JobError> {
    if let Some(entry) = descriptor.and_then(|d| d.entry_point.as_deref())
        && !entry.trim().is_empty()
    {
        let path = dir.join(entry);
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(entry, dir = %dir.display(), "Declared entry point missing, falling back");
    }

    for name in DEFAULT_ENTRY_POINTS {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    discover_script(dir)
        .await
        .map_err(|e| JobError::LoadFailure {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| JobError::LoadFailure {
            path: dir.to_path_buf(),
            reason: "no entry point found in package".to_string(),
        })
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext))
}

/// Depth-first search for the first script file.
fn discover_script<'a>(
    dir: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<Option<PathBuf>>> + Send + 'a>>
{
    Box::pin(async move {
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == DEPS_DIR {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if let Some(found) = discover_script(&path).await? {
                    return Ok(Some(found));
                }
            } else if file_type.is_file() && is_script(&path) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn verify_accepts_complete_package() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            DESCRIPTOR_FILE,
            r#"{"name":"invoice-bot","version":"1.2.0","entry_point":"run.sh"}"#,
        );
        write(dir.path(), "run.sh", "echo hi");

        let report = verify(dir.path()).await;
        assert!(report.ok, "{:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn verify_collects_every_issue() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), DESCRIPTOR_FILE, r#"{"entry_point":"gone.sh"}"#);

        let report = verify(dir.path()).await;
        assert!(!report.ok);
        assert_eq!(report.issues.len(), 3, "{:?}", report.issues);
        assert!(report.issues.iter().any(|i| i.contains("name")));
        assert!(report.issues.iter().any(|i| i.contains("version")));
        assert!(report.issues.iter().any(|i| i.contains("gone.sh")));
    }

    #[tokio::test]
    async fn verify_stops_on_missing_descriptor() {
        let dir = TempDir::new().unwrap();
        let report = verify(dir.path()).await;
        assert!(!report.ok);
        assert_eq!(report.issues, vec![format!("{DESCRIPTOR_FILE} not found")]);
    }

    #[tokio::test]
    async fn verify_stops_on_unparsable_descriptor() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), DESCRIPTOR_FILE, "name = 'toml?'");
        let report = verify(dir.path()).await;
        assert!(!report.ok);
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn numeric_version_keeps_descriptor_usable() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            DESCRIPTOR_FILE,
            r#"{"name":"bot","version":2,"entry_point":"run.sh"}"#,
        );
        write(dir.path(), "run.sh", "");
        write(dir.path(), "main.sh", "");

        let descriptor = PackageDescriptor::load(dir.path()).await.unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("2"));

        let path = locate_entry_point(dir.path(), Some(&descriptor)).await.unwrap();
        assert_eq!(path, dir.path().join("run.sh"));

        let report = verify(dir.path()).await;
        assert!(report.ok, "{:?}", report.issues);
    }

    #[tokio::test]
    async fn verify_collects_wrongly_typed_fields() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            DESCRIPTOR_FILE,
            r#"{"name":"bot","version":[1,0],"entry_point":"gone.sh"}"#,
        );

        let report = verify(dir.path()).await;
        assert!(!report.ok);
        assert_eq!(
            report.issues,
            vec![
                "field version must be a string or number".to_string(),
                "entry point gone.sh does not exist".to_string(),
            ]
        );

        let descriptor = PackageDescriptor::load(dir.path()).await.unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("bot"));
        assert_eq!(descriptor.version, None);
    }

    #[tokio::test]
    async fn entry_point_prefers_descriptor() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "custom/start.sh", "");
        write(dir.path(), "main.sh", "");
        let descriptor = PackageDescriptor {
            entry_point: Some("custom/start.sh".into()),
            ..Default::default()
        };

        let path = locate_entry_point(dir.path(), Some(&descriptor)).await.unwrap();
        assert_eq!(path, dir.path().join("custom/start.sh"));
    }

    #[tokio::test]
    async fn entry_point_falls_back_to_default_name() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a_helper.sh", "");
        write(dir.path(), "main.py", "");

        let path = locate_entry_point(dir.path(), None).await.unwrap();
        assert_eq!(path, dir.path().join("main.py"));
    }

    #[tokio::test]
    async fn entry_point_discovers_first_script_depth_first() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "README.md", "");
        write(dir.path(), ".hidden/evil.sh", "");
        write(dir.path(), ".deps/lib/site.py", "");
        write(dir.path(), "b/second.sh", "");
        write(dir.path(), "a/nested/first.py", "");

        let path = locate_entry_point(dir.path(), Some(&PackageDescriptor::default()))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("a/nested/first.py"));
    }

    #[tokio::test]
    async fn entry_point_missing_is_load_failure() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "notes.txt", "");
        let err = locate_entry_point(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, JobError::LoadFailure { .. }));
    }
}
