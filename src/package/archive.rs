//! Package archive extraction (gzip-compressed tar).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::PackageError;
use crate::package::descriptor::DESCRIPTOR_FILE;

/// Unpack `bytes` into `dest` on the blocking pool.
pub async fn extract(bytes: Vec<u8>, dest: PathBuf) -> Result<(), PackageError> {
    tokio::task::spawn_blocking(move || extract_blocking(&bytes, &dest))
        .await
        .map_err(|e| PackageError::Archive(format!("extraction task panicked: {e}")))?
}

fn extract_blocking(bytes: &[u8], dest: &Path) -> Result<(), PackageError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let entries = archive
        .entries()
        .map_err(|e| PackageError::Archive(e.to_string()))?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| PackageError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| PackageError::Archive(format!("{path}: {e}")))?;
        if !unpacked {
            return Err(PackageError::Archive(format!(
                "entry {path} escapes the package directory"
            )));
        }
        count += 1;
    }

    if count == 0 {
        return Err(PackageError::Archive("archive is empty".to_string()));
    }
    Ok(())
}

/// Directory inside an extracted archive that holds the descriptor.
///
/// Archives built from a folder usually wrap everything in one top-level
/// directory; that directory becomes the package root.
pub fn package_root(extracted: &Path) -> PathBuf {
    if extracted.join(DESCRIPTOR_FILE).exists() {
        return extracted.to_path_buf();
    }
    let Ok(read_dir) = std::fs::read_dir(extracted) else {
        return extracted.to_path_buf();
    };
    let children: Vec<PathBuf> = read_dir.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    match children.as_slice() {
        [only] if only.is_dir() && only.join(DESCRIPTOR_FILE).exists() => only.clone(),
        _ => extracted.to_path_buf(),
    }
}

/// Build a `.tar.gz` from `(path, contents)` pairs.
#[cfg(test)]
pub(crate) fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn extracts_files() {
        let dir = TempDir::new().unwrap();
        let bytes = build_archive(&[
            (DESCRIPTOR_FILE, r#"{"name":"p","version":"1"}"#),
            ("lib/util.sh", "echo util"),
        ]);

        extract(bytes, dir.path().to_path_buf()).await.unwrap();
        assert!(dir.path().join(DESCRIPTOR_FILE).exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib/util.sh")).unwrap(),
            "echo util"
        );
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = extract(b"definitely not gzip".to_vec(), dir.path().to_path_buf())
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::Archive(_)));
    }

    #[tokio::test]
    async fn single_wrapping_directory_is_unwrapped() {
        let dir = TempDir::new().unwrap();
        let bytes = build_archive(&[
            ("bot-1.0/manifest.json", r#"{"name":"bot","version":"1.0"}"#),
            ("bot-1.0/main.sh", "echo"),
        ]);
        extract(bytes, dir.path().to_path_buf()).await.unwrap();

        assert_eq!(package_root(dir.path()), dir.path().join("bot-1.0"));
    }

    #[test]
    fn flat_archive_root_is_itself() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DESCRIPTOR_FILE), "{}").unwrap();
        assert_eq!(package_root(dir.path()), dir.path());
    }
}
