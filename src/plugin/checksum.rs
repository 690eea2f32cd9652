//! SHA-256 verification of plugin executables.
//!
//! The launcher resolves a command to one canonical path, hashes that file
//! and executes the same path.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{DbError, Result};

/// Resolve `command` the way `execvp` would and canonicalize the result.
///
/// A command containing a path separator is taken relative to the current
/// directory; a bare name is looked up on `PATH`.
pub async fn resolve_executable(command: &str) -> Result<PathBuf> {
    resolve_executable_in(command, std::env::var_os("PATH").as_deref()).await
}

pub(crate) async fn resolve_executable_in(
    command: &str,
    search_path: Option<&OsStr>,
) -> Result<PathBuf> {
    if command.is_empty() {
        return Err(DbError::config("plugin command is empty"));
    }

    if Path::new(command).components().count() > 1 || command.contains('/') {
        return tokio::fs::canonicalize(command).await.map_err(|e| {
            DbError::config(format!("failed to resolve plugin executable '{}': {}", command, e))
        });
    }

    for dir in search_path.map(std::env::split_paths).into_iter().flatten() {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(command);
        if is_executable_file(&candidate).await {
            return tokio::fs::canonicalize(&candidate).await.map_err(|e| {
                DbError::config(format!(
                    "failed to resolve plugin executable '{}': {}",
                    candidate.display(),
                    e
                ))
            });
        }
    }

    Err(DbError::config(format!(
        "plugin executable '{}' was not found on PATH",
        command
    )))
}

async fn is_executable_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        #[cfg(unix)]
        Ok(meta) => {
            use std::os::unix::fs::PermissionsExt;
            meta.is_file() && meta.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

/// Hex-encoded SHA-256 of the file at `path`.
pub async fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        DbError::config(format!("failed to read plugin executable '{}': {}", path.display(), e))
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Compare the executable's digest against `expected_hex` (case-insensitive).
pub async fn verify(path: impl AsRef<Path>, expected_hex: &str) -> Result<()> {
    let path = path.as_ref();
    let expected = hex::decode(expected_hex.trim())
        .map_err(|e| DbError::config(format!("invalid plugin checksum: {}", e)))?;
    if expected.len() != 32 {
        return Err(DbError::config(format!(
            "invalid plugin checksum: expected 32 bytes, got {}",
            expected.len()
        )));
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| {
        DbError::config(format!("failed to read plugin executable '{}': {}", path.display(), e))
    })?;
    let actual = Sha256::digest(&bytes);

    if actual.as_slice() != expected.as_slice() {
        tracing::error!(
            command = %path.display(),
            expected = %hex::encode(&expected),
            actual = %hex::encode(actual),
            "Plugin checksum mismatch"
        );
        return Err(DbError::integrity(format!(
            "checksum mismatch for plugin '{}'",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_sha256_file() {
        let file = fixture(b"hello world");
        assert_eq!(sha256_file(file.path()).await.unwrap(), HELLO);
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive() {
        let file = fixture(b"hello world");
        verify(file.path(), HELLO).await.unwrap();
        verify(file.path(), &HELLO.to_uppercase()).await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatch_is_integrity_error() {
        let file = fixture(b"hello world!");
        let err = verify(file.path(), HELLO).await.unwrap_err();
        assert!(matches!(err, DbError::Integrity { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_checksum_or_path() {
        let file = fixture(b"hello world");
        for bad in ["zz", "00ff", ""] {
            let err = verify(file.path(), bad).await.unwrap_err();
            assert!(matches!(err, DbError::Configuration { .. }), "{bad}");
        }

        let err = verify("/nonexistent/dbplugin", HELLO).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    fn write_file(path: &Path, contents: &[u8], mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, contents).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[tokio::test]
    async fn test_bare_name_resolves_through_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let skipped = dir.path().join("skipped");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&skipped).unwrap();
        std::fs::create_dir_all(&bin).unwrap();
        write_file(&skipped.join("plug"), b"not executable", 0o644);
        write_file(&bin.join("plug"), b"#!/bin/sh\nexit 0\n", 0o755);

        let search = std::env::join_paths([&skipped, &bin]).unwrap();
        let resolved = resolve_executable_in("plug", Some(&search)).await.unwrap();
        assert_eq!(resolved, std::fs::canonicalize(bin.join("plug")).unwrap());
        assert!(resolved.is_absolute());

        let err = resolve_executable_in("missing", Some(&search)).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        let err = resolve_executable_in("plug", None).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_path_with_separator_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir_all(&nested).unwrap();
        write_file(&dir.path().join("plug"), b"bytes", 0o644);

        let indirect = nested.join("..").join("plug");
        let resolved = resolve_executable_in(indirect.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(dir.path().join("plug")).unwrap());

        let err = resolve_executable_in("", None).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        let err = resolve_executable_in("/nonexistent/dbplugin", None).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }
}
