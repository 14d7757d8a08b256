//! Per-execution on-disk blob storage.
//!
//! Layout: `{base}/executions/{execution_id}/{inputs|outputs}/{stored name}`
//! where the stored name is `{stem}_{unix_ts}_{4-byte-hex}{ext}` so
//! concurrent writes of the same logical name cannot collide. A SHA-256
//! checksum is computed while writing and the MIME type is sniffed from the
//! leading bytes. A failed copy removes the partial file before the error
//! surfaces; half-written blobs are never observable outside the writer.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const SNIFF_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to open file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to delete {path}: {source}")]
    Delete { path: PathBuf, source: io::Error },
}

/// Record returned for every stored blob.
#[derive(Clone, Debug)]
pub struct StoredFile {
    /// The logical name the blob was stored under.
    pub original_name: String,
    pub stored_path: PathBuf,
    pub size: i64,
    pub mime_type: String,
    /// Hex-encoded SHA-256 of the content.
    pub checksum: String,
}

/// Content-addressed-ish blob store, sharded per execution.
#[derive(Clone, Debug)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding everything recorded for one execution.
    pub fn execution_path(&self, execution_id: i64) -> PathBuf {
        self.base_path
            .join("executions")
            .join(execution_id.to_string())
    }

    pub fn store_input(
        &self,
        execution_id: i64,
        name: &str,
        reader: impl Read,
    ) -> Result<StoredFile, FileStoreError> {
        self.store(execution_id, "inputs", name, reader)
    }

    pub fn store_output(
        &self,
        execution_id: i64,
        name: &str,
        reader: impl Read,
    ) -> Result<StoredFile, FileStoreError> {
        self.store(execution_id, "outputs", name, reader)
    }

    fn store(
        &self,
        execution_id: i64,
        subdir: &str,
        name: &str,
        mut reader: impl Read,
    ) -> Result<StoredFile, FileStoreError> {
        let dir = self.execution_path(execution_id).join(subdir);
        fs::create_dir_all(&dir).map_err(|source| FileStoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let stored_path = dir.join(unique_filename(name));
        match self.copy_hashed(&stored_path, &mut reader) {
            Ok((size, checksum, head)) => {
                let mime_type = sniff_mime(&head);
                tracing::debug!(
                    execution_id,
                    original_name = name,
                    stored_path = %stored_path.display(),
                    size,
                    mime_type,
                    "stored file"
                );
                Ok(StoredFile {
                    original_name: name.to_string(),
                    stored_path,
                    size,
                    mime_type,
                    checksum,
                })
            }
            Err(source) => {
                // Leave no partial blob behind.
                let _ = fs::remove_file(&stored_path);
                Err(FileStoreError::Write {
                    path: stored_path,
                    source,
                })
            }
        }
    }

    fn copy_hashed(
        &self,
        path: &Path,
        reader: &mut impl Read,
    ) -> io::Result<(i64, String, Vec<u8>)> {
        let mut file = fs::File::create(path)?;
        let mut hasher = Sha256::new();
        let mut head = Vec::with_capacity(SNIFF_LEN);
        let mut size: i64 = 0;
        let mut buf = [0u8; 8192];

        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            let chunk = &buf[..read];
            file.write_all(chunk)?;
            hasher.update(chunk);
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            size += read as i64;
        }
        file.flush()?;

        Ok((size, format!("{:x}", hasher.finalize()), head))
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<fs::File, FileStoreError> {
        let path = path.as_ref();
        fs::File::open(path).map_err(|source| FileStoreError::Open {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Removes every blob recorded for the execution.
    pub fn delete_execution(&self, execution_id: i64) -> Result<(), FileStoreError> {
        let path = self.execution_path(execution_id);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&path).map_err(|source| FileStoreError::Delete {
            path: path.clone(),
            source,
        })?;
        tracing::info!(execution_id, path = %path.display(), "deleted execution directory");
        Ok(())
    }
}

fn unique_filename(original: &str) -> String {
    let (stem, ext) = match original.rfind('.') {
        Some(idx) if idx > 0 => original.split_at(idx),
        _ => (original, ""),
    };
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!("{stem}_{timestamp}_{}{ext}", hex::encode(suffix))
}

fn sniff_mime(head: &[u8]) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    if head.is_empty() || std::str::from_utf8(head).is_ok() {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path());
        (dir, storage)
    }

    #[test]
    fn stores_under_execution_shard_with_unique_name() {
        let (_dir, storage) = storage();
        let stored = storage
            .store_input(7, "greeting.txt", "hello world".as_bytes())
            .unwrap();

        assert_eq!(stored.original_name, "greeting.txt");
        assert_eq!(stored.size, 11);
        assert!(stored.stored_path.starts_with(storage.execution_path(7).join("inputs")));
        let name = stored.stored_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("greeting_"));
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn checksum_matches_content() {
        let (_dir, storage) = storage();
        let stored = storage.store_output(1, "out.txt", "hello world".as_bytes()).unwrap();
        // sha256("hello world")
        assert_eq!(
            stored.checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn sniffs_text_and_binary() {
        let (_dir, storage) = storage();
        let text = storage.store_input(1, "a.txt", "plain words".as_bytes()).unwrap();
        assert!(text.mime_type.starts_with("text/plain"));

        let png_magic = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        let binary = storage.store_input(1, "b.png", &png_magic[..]).unwrap();
        assert_eq!(binary.mime_type, "image/png");
    }

    #[test]
    fn failed_copy_leaves_no_partial_file() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("stream broke"))
            }
        }

        let (_dir, storage) = storage();
        let err = storage.store_input(3, "broken.bin", Failing).unwrap_err();
        assert!(matches!(err, FileStoreError::Write { .. }));
        let inputs_dir = storage.execution_path(3).join("inputs");
        let leftovers: Vec<_> = fs::read_dir(inputs_dir).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn delete_execution_removes_everything() {
        let (_dir, storage) = storage();
        storage.store_input(9, "in.txt", "in".as_bytes()).unwrap();
        storage.store_output(9, "out.txt", "out".as_bytes()).unwrap();

        storage.delete_execution(9).unwrap();
        assert!(!storage.execution_path(9).exists());

        // Deleting an absent execution is a no-op.
        storage.delete_execution(9).unwrap();
    }
}
