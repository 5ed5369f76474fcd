//! On-disk layout of a run directory and atomic persistence helpers.
//!
//! ```text
//! <run_dir>/registry.json          batch lifecycle records
//! <run_dir>/costs.json             cost ledger
//! <run_dir>/results/batch_NNN.jsonl  downloaded payloads, one per completed batch
//! <run_dir>/merged.csv, missing.txt, annotated.csv  merge outputs
//! ```
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    /// Open (and create if needed) a run directory.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("results"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn costs_path(&self) -> PathBuf {
        self.root.join("costs.json")
    }

    pub fn merged_path(&self) -> PathBuf {
        self.root.join("merged.csv")
    }

    pub fn missing_path(&self) -> PathBuf {
        self.root.join("missing.txt")
    }

    pub fn annotated_path(&self) -> PathBuf {
        self.root.join("annotated.csv")
    }

    /// Relative location of a batch's payload, as recorded in the registry
    pub fn result_location(seq: u32) -> PathBuf {
        PathBuf::from("results").join(format!("batch_{seq:03}.jsonl"))
    }

    pub fn resolve(&self, location: &Path) -> PathBuf {
        if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.root.join(location)
        }
    }

    /// Store a downloaded payload, replacing any earlier attempt's file.
    pub fn write_payload(&self, seq: u32, payload: &str) -> Result<PathBuf> {
        let location = Self::result_location(seq);
        write_atomic(&self.resolve(&location), payload.as_bytes())?;
        Ok(location)
    }

    pub fn read_payload(&self, location: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(self.resolve(location))
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!("Persisted {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Load JSON from `path`; `Ok(None)` when the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
