// src/utils/checkpoint.rs: durable storage IS the checkpoint ledger.
//
// A stage is complete for a sample iff every required durable artifact
// exists non-empty under the stage's durable subdirectory. There is no other
// completion record, so these checks are the whole of the skip logic.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::defs::{PipelineError, RunConfig, Stage, PIGZ_TAG, TAR_TAG};
use crate::utils::command::{pigz, run_tool, tar};
use crate::utils::file::{copy_then_rename, non_empty};

pub fn stage_dir(durable_sample_dir: &Path, stage: Stage) -> PathBuf {
    durable_sample_dir.join(stage.dir_name())
}

/// Sole skip condition: all required durable artifacts present and non-empty.
/// Read-only; never creates directories or files.
pub fn is_stage_complete(durable_sample_dir: &Path, sample_id: &str, stage: Stage) -> bool {
    let dir = stage_dir(durable_sample_dir, stage);
    stage
        .required_durable_artifacts(sample_id)
        .iter()
        .all(|name| non_empty(&dir.join(name)))
}

/// Gate for running `stage` when its upstream output is in neither scratch
/// nor durable storage. This is operator error (a stage flag is missing),
/// not a retryable condition.
pub fn upstream_guard(
    durable_sample_dir: &Path,
    sample_id: &str,
    stage: Stage,
    upstream_in_scratch: bool,
) -> Result<(), PipelineError> {
    let Some(upstream) = stage.upstream() else {
        return Ok(());
    };
    if upstream_in_scratch || is_stage_complete(durable_sample_dir, sample_id, upstream) {
        return Ok(());
    }
    Err(PipelineError::MissingUpstreamArtifact {
        stage,
        upstream,
        sample_id: sample_id.to_string(),
        flag: upstream.flag_name(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    AlreadyPublished,
}

/// Copies one completed stage from scratch into durable storage.
///
/// Idempotent: a destination already holding all required artifacts makes
/// this a no-op, protecting re-entrant runs from double publication. Bulky
/// sequence/label files are pigz-compressed first (originals kept), and
/// auxiliary logs are packaged into a single archive so durable file counts
/// stay bounded. Any failure is fatal but leaves the scratch copy untouched
/// for manual recovery.
pub async fn publish_stage(
    config: &RunConfig,
    stage: Stage,
    scratch_stage_dir: &Path,
) -> Result<PublishOutcome, PipelineError> {
    let sample_id = &config.record.sample_id;
    if is_stage_complete(&config.durable_sample_dir, sample_id, stage) {
        info!("{}: stage {} already durable, skipping publish", sample_id, stage);
        return Ok(PublishOutcome::AlreadyPublished);
    }

    let dest = stage_dir(&config.durable_sample_dir, stage);
    std::fs::create_dir_all(&dest).map_err(|e| PipelineError::PublishFailed {
        stage,
        sample_id: sample_id.clone(),
        reason: format!("cannot create {}: {e}", dest.display()),
    })?;

    for name in stage.expected_scratch_artifacts(sample_id) {
        let src = scratch_stage_dir.join(&name);
        let publish_err = |reason: String| PipelineError::PublishFailed {
            stage,
            sample_id: sample_id.clone(),
            reason,
        };

        if stage.compressed_on_publish(&name) {
            let gz_name = format!("{name}.gz");
            let gz_src = scratch_stage_dir.join(&gz_name);
            if !non_empty(&gz_src) {
                run_tool(PIGZ_TAG, &pigz::compress_args(&src, config.threads))
                    .await
                    .map_err(|e| publish_err(e.to_string()))?;
            }
            copy_then_rename(&gz_src, &dest.join(&gz_name))
                .await
                .map_err(|e| publish_err(e.to_string()))?;
        } else {
            copy_then_rename(&src, &dest.join(&name))
                .await
                .map_err(|e| publish_err(e.to_string()))?;
        }
    }

    publish_report_archive(config, stage, scratch_stage_dir, &dest).await?;

    info!("{}: stage {} published to {}", sample_id, stage, dest.display());
    Ok(PublishOutcome::Published)
}

/// Bundles auxiliary per-stage reports (tool logs) into one tar.gz in the
/// durable stage directory. Absence of logs is not an error.
async fn publish_report_archive(
    config: &RunConfig,
    stage: Stage,
    scratch_stage_dir: &Path,
    dest: &Path,
) -> Result<(), PipelineError> {
    let sample_id = &config.record.sample_id;
    let logs: Vec<String> = match std::fs::read_dir(scratch_stage_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".log"))
            .collect(),
        Err(_) => Vec::new(),
    };
    if logs.is_empty() {
        return Ok(());
    }

    let archive_name = stage.report_archive_name(sample_id);
    let archive_scratch = scratch_stage_dir.join(&archive_name);
    run_tool(TAR_TAG, &tar::archive_args(&archive_scratch, scratch_stage_dir, &logs))
        .await
        .map_err(|e| PipelineError::PublishFailed {
            stage,
            sample_id: sample_id.clone(),
            reason: format!("report archive: {e}"),
        })?;
    copy_then_rename(&archive_scratch, &dest.join(&archive_name))
        .await
        .map_err(|e| PipelineError::PublishFailed {
            stage,
            sample_id: sample_id.clone(),
            reason: format!("report archive copy: {e}"),
        })?;
    Ok(())
}

/// Refills scratch with named durable artifacts of `stage` when a later
/// stage needs output a skipped stage never produced locally. Gzipped
/// artifacts are decompressed after the copy so downstream tools see the
/// same paths a fresh stage run would have left.
pub async fn pull_artifacts(
    config: &RunConfig,
    stage: Stage,
    names: &[String],
    dest_dir: &Path,
) -> Result<Vec<PathBuf>, PipelineError> {
    let sample_id = &config.record.sample_id;
    let src_dir = stage_dir(&config.durable_sample_dir, stage);
    std::fs::create_dir_all(dest_dir).map_err(|e| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason: format!("cannot create {}: {e}", dest_dir.display()),
    })?;

    let mut pulled = Vec::with_capacity(names.len());
    for name in names {
        let src = src_dir.join(name);
        if !non_empty(&src) {
            warn!("{}: durable pull-through missing {}", sample_id, src.display());
            return Err(PipelineError::StagingFailed {
                sample_id: sample_id.clone(),
                reason: format!("durable artifact vanished: {}", src.display()),
            });
        }
        let dest = dest_dir.join(name);
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| PipelineError::StagingFailed {
                sample_id: sample_id.clone(),
                reason: format!("pull of {name}: {e}"),
            })?;
        if name.ends_with(".gz") {
            run_tool(PIGZ_TAG, &pigz::decompress_args(&dest, config.threads))
                .await
                .map_err(|e| PipelineError::StagingFailed {
                    sample_id: sample_id.clone(),
                    reason: e.to_string(),
                })?;
            pulled.push(dest.with_extension(""));
        } else {
            pulled.push(dest);
        }
    }
    Ok(pulled)
}
