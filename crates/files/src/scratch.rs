//! Raw payload evidence written by transport hops.
//!
//! Each payload is written before any parsing happens, so whatever arrived on the wire survives a
//! crash in the handler. Files are named `<UTC timestamp>-<sha256 prefix>.hl7`.

use crate::store::write_synced;
use crate::{io_context, FilesResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const HASH_PREFIX_LEN: usize = 12;

/// Metadata about a recorded payload.
#[derive(Debug, Clone, Serialize)]
pub struct ScratchRecord {
    pub path: PathBuf,
    /// Full SHA-256 of the payload, hex encoded.
    pub hash: String,
    pub size_bytes: u64,
    pub received_at: DateTime<Utc>,
}

/// Append-only directory of raw payloads.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    dir: PathBuf,
}

impl ScratchStore {
    /// Opens the scratch directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the directory cannot be created.
    pub fn new(dir: &Path) -> FilesResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| io_context(e, format!("failed to create {}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably records `payload`.
    ///
    /// The payload is written to a hidden temporary file, synced, and renamed into place.
    /// Recording the same payload twice in the same instant yields one file.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the write or rename fails.
    pub fn record(&self, payload: &[u8]) -> FilesResult<ScratchRecord> {
        let received_at = Utc::now();
        let hash = hex::encode(Sha256::digest(payload));
        let file_name = format!(
            "{}-{}.hl7",
            received_at.format("%Y%m%dT%H%M%S%6f"),
            &hash[..HASH_PREFIX_LEN]
        );

        let path = self.dir.join(&file_name);
        let tmp = self.dir.join(format!(".{}.tmp", file_name));
        write_synced(&tmp, payload)?;
        fs::rename(&tmp, &path)
            .map_err(|e| io_context(e, format!("failed to record {}", path.display())))?;

        tracing::debug!(path = %path.display(), size = payload.len(), "payload recorded");
        Ok(ScratchRecord {
            path,
            hash,
            size_bytes: payload.len() as u64,
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_writes_payload_verbatim() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let scratch = ScratchStore::new(&temp_dir.path().join("scratch")).unwrap();

        let payload = b"MSH|^~\\&|A|B|C|D|20240101||ADT^A01|1|P|2.4\rPID|1";
        let record = scratch.record(payload).unwrap();

        assert_eq!(fs::read(&record.path).unwrap(), payload);
        assert_eq!(record.size_bytes, payload.len() as u64);
        assert_eq!(record.hash.len(), 64);
        let file_name = record.path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.ends_with(&format!("-{}.hl7", &record.hash[..12])));
    }

    #[test]
    fn test_record_accepts_non_utf8_and_empty_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = ScratchStore::new(temp_dir.path()).unwrap();

        let binary = scratch.record(&[0xff, 0x00, 0x0b]).unwrap();
        assert_eq!(fs::read(binary.path).unwrap(), vec![0xff, 0x00, 0x0b]);
        let empty = scratch.record(b"").unwrap();
        assert_eq!(empty.size_bytes, 0);
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = ScratchStore::new(temp_dir.path()).unwrap();
        scratch.record(b"one").unwrap();
        scratch.record(b"two").unwrap();

        let leftovers = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_record_serialises_to_json() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = ScratchStore::new(temp_dir.path()).unwrap();
        let record = scratch.record(b"x").unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["size_bytes"], 1);
    }
}
