// src/utils/manifest.rs: record resolution from the sample manifest

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config::defs::{PipelineError, Record};

/// Resolves one manifest row from a 1-based task index.
///
/// Pure lookup: no side effects, and deterministic for an unmodified
/// manifest. The manifest is a header line followed by one row per sample
/// with at least three fields (sample_id, input_a, input_b).
///
/// # Arguments
/// * `manifest_path` - Tabular manifest file.
/// * `task_index` - 1-based row index, usually the scheduler array index.
///
/// # Returns
/// The resolved Record, with both input paths verified readable.
pub fn resolve(manifest_path: &Path, task_index: usize) -> Result<Record, PipelineError> {
    let contents = fs::read_to_string(manifest_path)
        .map_err(|_| PipelineError::ManifestUnreadable(manifest_path.to_path_buf()))?;

    let rows: Vec<&str> = contents
        .lines()
        .skip(1) // header
        .filter(|l| !l.trim().is_empty())
        .collect();

    if rows.is_empty() {
        return Err(PipelineError::EmptyManifest(manifest_path.to_path_buf()));
    }
    if task_index == 0 || task_index > rows.len() {
        return Err(PipelineError::IndexOutOfRange {
            index: task_index,
            rows: rows.len(),
        });
    }

    let fields: Vec<&str> = rows[task_index - 1]
        .split('\t')
        .flat_map(|f| f.split_whitespace())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.len() < 3 {
        return Err(PipelineError::MalformedRecord {
            index: task_index,
            reason: format!("expected 3 non-empty fields, found {}", fields.len()),
        });
    }

    let record = Record {
        sample_id: fields[0].to_string(),
        input_a: PathBuf::from(fields[1]),
        input_b: PathBuf::from(fields[2]),
    };

    for path in [&record.input_a, &record.input_b] {
        File::open(path).map_err(|_| PipelineError::InputUnavailable {
            sample_id: record.sample_id.clone(),
            path: path.clone(),
        })?;
    }

    Ok(record)
}
