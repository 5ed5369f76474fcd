//! Writers for merge outputs: the merged table, the missing-index list and
//! the source CSV annotated with per-row results.
//!
//! All outputs are rendered in memory and written atomically, so rerunning a
//! merge over unchanged inputs produces byte-identical files.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::info;

use crate::core::merge::MergedTable;
use crate::error::Result;
use crate::io::store::write_atomic;

pub const RESPONSE_COLUMN: &str = "AI_Response";
pub const STATUS_COLUMN: &str = "Processing_Status";

/// `original_index,content`, one row per merged result in index order.
pub fn write_merged(path: &Path, table: &MergedTable) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["original_index", "content"])?;
    for row in &table.rows {
        writer.write_record([row.original_index.to_string().as_str(), row.content.as_str()])?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    write_atomic(path, &bytes)?;
    info!("Wrote {} merged rows to {:?}", table.len(), path);
    Ok(())
}

/// One 0-based index per line.
pub fn write_missing(path: &Path, missing: &[usize]) -> Result<()> {
    let mut text = String::new();
    for index in missing {
        text.push_str(&index.to_string());
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())?;
    info!("Wrote {} missing indices to {:?}", missing.len(), path);
    Ok(())
}

/// Copy `source` to `path` with two extra columns: the merged response and
/// `Completed`/`Missing` for each data row.
pub fn write_annotated(source: &Path, path: &Path, table: &MergedTable) -> Result<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(File::open(source)?));
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    let mut headers = reader.headers()?.clone();
    headers.push_field(RESPONSE_COLUMN);
    headers.push_field(STATUS_COLUMN);
    writer.write_record(&headers)?;

    let mut completed = 0usize;
    for (index, record) in reader.records().enumerate() {
        let mut record = record?;
        match table.get(index) {
            Some(row) => {
                completed += 1;
                record.push_field(&row.content);
                record.push_field("Completed");
            }
            None => {
                record.push_field("");
                record.push_field("Missing");
            }
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    write_atomic(path, &bytes)?;
    info!("Annotated {:?} ({} rows completed) -> {:?}", source, completed, path);
    Ok(())
}
