use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::params::ItemColumns;

/// Errors encountered when reading the row source
#[derive(Debug, Error)]
pub enum SourceReadError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed CSV in {path}: {source}")]
    Malformed { path: PathBuf, source: csv::Error },
    #[error("column `{column}` not found in {path}")]
    MissingColumn { path: PathBuf, column: String },
}

/// One unit of work, identified by its 0-based data row index in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: usize,
    pub image_path: String,
    pub prompt: String,
}

/// Read every data row of `path` as a work item, in file order.
pub fn read_rows(path: &Path, columns: &ItemColumns) -> Result<Vec<WorkItem>, SourceReadError> {
    let file = File::open(path).map_err(|source| SourceReadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let malformed = |source| SourceReadError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let headers = reader.headers().map_err(malformed)?.clone();
    let find = |column: &str| {
        headers
            .iter()
            .position(|h| h.trim() == column)
            .ok_or_else(|| SourceReadError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };
    let image_col = find(&columns.image)?;
    let prompt_col = find(&columns.prompt)?;
    debug!(image_col, prompt_col, "Located work item columns");

    let mut items = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(malformed)?;
        items.push(WorkItem {
            index,
            image_path: record.get(image_col).unwrap_or_default().to_string(),
            prompt: record.get(prompt_col).unwrap_or_default().to_string(),
        });
    }

    info!("Read {} work items from {:?}", items.len(), path);
    Ok(items)
}
