//! Content-addressed persistence of finished studies.
//!
//! A study is bincode-encoded and stored under `reports/objects/<ab>/<rest>`,
//! named by the SHA-256 of its bytes. `reports/<label>.snap` points at the
//! latest object and at the one it replaced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode, config, decode_from_slice, encode_to_vec};
use tracing::{debug, info};

use crate::atomic_file::write_atomic;
use crate::checksum::content_hash;
use crate::error::SnapshotError;
use crate::pipeline::StudyResult;

pub const REPORTS_DIR: &str = "reports";
const OBJECTS_DIR: &str = "objects";
const SNAPSHOT_EXT: &str = "snap";

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotRef {
    pub label: String,
    pub object_hash: String,
    pub parent_hash: Option<String>,
    pub timestamp: u64,
}

pub fn snapshot_path(root: &Path, label: &str) -> PathBuf {
    root.join(REPORTS_DIR).join(format!("{label}.{SNAPSHOT_EXT}"))
}

fn object_path(root: &Path, hash: &str) -> PathBuf {
    let (prefix, fname) = hash.split_at(hash.len().min(2));
    root.join(REPORTS_DIR).join(OBJECTS_DIR).join(prefix).join(fname)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_object<T: Encode>(root: &Path, data: &T) -> Result<String, SnapshotError> {
    let sdata = encode_to_vec(data, config::standard())?;
    let hash = content_hash(&sdata);
    let path = object_path(root, &hash);
    if path.exists() {
        debug!(%hash, "object already stored");
    } else {
        write_atomic(&path, &sdata).map_err(io_error(&path))?;
    }
    Ok(hash)
}

fn read_object<T: Decode<()>>(root: &Path, hash: &str) -> Result<T, SnapshotError> {
    let path = object_path(root, hash);
    let sdata = fs::read(&path).map_err(io_error(&path))?;
    let found = content_hash(&sdata);
    if found != hash {
        return Err(SnapshotError::HashMismatch {
            expected: hash.to_string(),
            found,
        });
    }
    Ok(decode_from_slice(&sdata, config::standard())?.0)
}

pub fn read_ref(root: &Path, label: &str) -> Result<SnapshotRef, SnapshotError> {
    let path = snapshot_path(root, label);
    let bytes = fs::read(&path).map_err(io_error(&path))?;
    Ok(decode_from_slice(&bytes, config::standard())?.0)
}

/// Stores `study` and repoints `reports/<label>.snap` at it.
pub fn write_snapshot(root: &Path, study: &StudyResult) -> Result<SnapshotRef, SnapshotError> {
    let object_hash = write_object(root, study)?;
    let previous = match read_ref(root, &study.label) {
        Ok(prev) => Some(prev),
        Err(SnapshotError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    let parent_hash = match previous {
        Some(prev) if prev.object_hash == object_hash => prev.parent_hash,
        Some(prev) => Some(prev.object_hash),
        None => None,
    };

    let snap = SnapshotRef {
        label: study.label.clone(),
        object_hash,
        parent_hash,
        timestamp: chrono::Utc::now().timestamp().max(0) as u64,
    };
    let path = snapshot_path(root, &study.label);
    write_atomic(&path, &encode_to_vec(&snap, config::standard())?).map_err(io_error(&path))?;
    info!(label = %snap.label, hash = %snap.object_hash, path = %path.display(), "snapshot written");
    Ok(snap)
}

/// Loads the latest study for `label`, verifying its content hash.
pub fn read_snapshot(root: &Path, label: &str) -> Result<(SnapshotRef, StudyResult), SnapshotError> {
    let snap = read_ref(root, label)?;
    let study = read_object(root, &snap.object_hash)?;
    Ok((snap, study))
}

/// Loads an earlier study by object hash, e.g. a ref's `parent_hash`.
pub fn read_study(root: &Path, hash: &str) -> Result<StudyResult, SnapshotError> {
    read_object(root, hash)
}
