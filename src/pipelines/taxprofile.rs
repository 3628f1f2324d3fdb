// src/pipelines/taxprofile.rs: per-sample stage-checkpointed pipeline.
//
// Each stage runs at most once per sample across all submissions: durable
// storage is the checkpoint, so a stage whose durable artifacts already
// exist non-empty is skipped without any tool invocation. Durable publish of
// stage K completes before stage K+1 starts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use log::{debug, info};

use crate::config::defs::{
    PipelineError, RunConfig, Stage, BRACKEN_TAG, KNEADDATA_TAG, KRAKEN2_TAG, PIGZ_TAG,
};
use crate::utils::checkpoint::{is_stage_complete, publish_stage, pull_artifacts, upstream_guard};
use crate::utils::command::{bracken, check_versions, kneaddata, kraken2, pigz, run_tool, tools_for_stages};
use crate::utils::file::{copy_dir_recursive, copy_into, is_gzipped, non_empty, remove_matching};

/// Per-stage state, driven strictly forward. `Failed` aborts the whole
/// sample; the batch scheduler's resubmission is the only retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    SkippedComplete,
    Staging,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::SkippedComplete => "skipped-complete",
            StageState::Staging => "staging",
            StageState::Running => "running",
            StageState::Done => "done",
            StageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Initial disposition of a requested stage against the durable checkpoint.
pub fn plan_stage(durable_sample_dir: &Path, sample_id: &str, stage: Stage) -> StageState {
    if is_stage_complete(durable_sample_dir, sample_id, stage) {
        StageState::SkippedComplete
    } else {
        StageState::Pending
    }
}

/// What the run leaves behind for the cleanup dispatcher: which stages
/// reached a durable-complete state and where their scratch copies live.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub completed: Vec<(Stage, PathBuf)>,
}

/// Scratch-resident inputs threaded from one stage to the next.
#[derive(Debug, Default)]
struct ScratchArtifacts {
    paired: Option<(PathBuf, PathBuf)>,
    kraken_report: Option<PathBuf>,
    staged_kraken_db: Option<PathBuf>,
}

fn set_state(
    states: &mut HashMap<Stage, StageState>,
    sample_id: &str,
    stage: Stage,
    state: StageState,
) {
    info!("{}: stage {} -> {}", sample_id, stage, state);
    states.insert(stage, state);
}

/// Run function for the per-sample taxonomic profiling pipeline.
///
/// # Arguments
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// RunOutcome listing durable-complete stages, for the cleanup dispatcher.
pub async fn run(config: Arc<RunConfig>) -> Result<RunOutcome, PipelineError> {
    let sample_id = config.record.sample_id.clone();
    let mut states: HashMap<Stage, StageState> = HashMap::new();
    let mut scratch = ScratchArtifacts::default();
    let mut outcome = RunOutcome::default();

    // Plan every requested stage against the durable checkpoint up front. A
    // fully-durable invocation must spawn zero processes, so the tool
    // preflight and the working directory wait until something is pending.
    let mut pending = Vec::new();
    for stage in Stage::ordered() {
        if !config.stages.contains(&stage) {
            continue;
        }
        let planned = plan_stage(&config.durable_sample_dir, &sample_id, stage);
        set_state(&mut states, &sample_id, stage, planned);
        if planned == StageState::Pending {
            pending.push(stage);
        }
    }
    if pending.is_empty() {
        info!("{}: all requested stages already durable", sample_id);
        return Ok(outcome);
    }

    check_versions(tools_for_stages(&pending))
        .await
        .map_err(PipelineError::Other)?;

    std::fs::create_dir_all(&config.work_dir).map_err(|e| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason: format!("cannot create working dir {}: {e}", config.work_dir.display()),
    })?;

    for stage in pending {
        let result = match stage {
            Stage::Decontamination => run_decontamination(&config, &mut states, &mut scratch).await,
            Stage::Classification => run_classification(&config, &mut states, &mut scratch).await,
            Stage::AbundanceEstimation => run_abundance(&config, &mut states, &mut scratch).await,
        };

        match result {
            Ok(stage_scratch_dir) => {
                outcome.completed.push((stage, stage_scratch_dir));
                set_state(&mut states, &sample_id, stage, StageState::Done);
            }
            Err(e) => {
                set_state(&mut states, &sample_id, stage, StageState::Failed);
                return Err(e);
            }
        }
    }

    Ok(outcome)
}

/// Copies the raw paired inputs into the stage scratch dir and decompresses
/// them, the two decompressions running concurrently. Expansion consumes
/// scratch quota; sizing is the submitter's responsibility.
async fn stage_raw_inputs(
    config: &RunConfig,
    stage_dir: &Path,
) -> Result<(PathBuf, PathBuf), PipelineError> {
    let sample_id = &config.record.sample_id;
    let staging_err = |reason: String| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason,
    };

    let mut staged = Vec::with_capacity(2);
    for src in [&config.record.input_a, &config.record.input_b] {
        let local = copy_into(src, stage_dir)
            .await
            .map_err(|e| staging_err(format!("copy of {}: {e}", src.display())))?;
        staged.push(local);
    }

    // Each staged file is carried through decompression individually so the
    // manifest's (input_a, input_b) pairing survives whatever the local
    // filenames happen to sort as.
    let mut jobs = Vec::with_capacity(2);
    for local in staged {
        // pigz splits the thread allocation across the two inputs
        let threads = (config.threads / 2).max(1);
        let gzipped = is_gzipped(&local).map_err(|e| staging_err(e.to_string()))?;
        jobs.push(async move {
            if gzipped {
                run_tool(PIGZ_TAG, &pigz::decompress_args(&local, threads)).await?;
                Ok::<PathBuf, PipelineError>(local.with_extension(""))
            } else {
                Ok(local)
            }
        });
    }
    let ordered = try_join_all(jobs)
        .await
        .map_err(|e| staging_err(e.to_string()))?;

    let mut iter = ordered.into_iter();
    let r1 = iter.next().ok_or_else(|| staging_err("no staged inputs".to_string()))?;
    let r2 = iter.next().ok_or_else(|| staging_err("missing second input".to_string()))?;
    Ok((r1, r2))
}

/// Read-only snapshot of a shared versioned reference database into scratch.
async fn stage_reference_db(
    config: &RunConfig,
    src: &Path,
    label: &str,
) -> Result<PathBuf, PipelineError> {
    let dest = config.work_dir.join("db").join(label);
    if dest.is_dir() {
        debug!("{}: reference db {} already staged", config.record.sample_id, label);
        return Ok(dest);
    }
    info!("{}: staging reference db {} -> {}", config.record.sample_id, src.display(), dest.display());
    copy_dir_recursive(src, &dest).map_err(|e| PipelineError::StagingFailed {
        sample_id: config.record.sample_id.clone(),
        reason: format!("reference db {label}: {e}"),
    })?;
    Ok(dest)
}

/// Post-invocation check: a zero tool exit is not trusted. Every expected
/// scratch artifact must exist non-empty or the stage is treated as failed.
fn verify_scratch_outputs(
    stage: Stage,
    sample_id: &str,
    stage_dir: &Path,
) -> Result<(), PipelineError> {
    for name in stage.expected_scratch_artifacts(sample_id) {
        if !non_empty(&stage_dir.join(&name)) {
            return Err(PipelineError::StageOutputMissing {
                stage,
                sample_id: sample_id.to_string(),
                artifact: name,
            });
        }
    }
    Ok(())
}

async fn run_decontamination(
    config: &RunConfig,
    states: &mut HashMap<Stage, StageState>,
    scratch: &mut ScratchArtifacts,
) -> Result<PathBuf, PipelineError> {
    let stage = Stage::Decontamination;
    let sample_id = config.record.sample_id.clone();
    let stage_dir = config.work_dir.join(stage.dir_name());
    std::fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason: e.to_string(),
    })?;

    set_state(states, &sample_id, stage, StageState::Staging);
    let (raw_r1, raw_r2) = stage_raw_inputs(config, &stage_dir).await?;
    let host_db = stage_reference_db(config, &config.host_db, "host").await?;

    set_state(states, &sample_id, stage, StageState::Running);
    let args = kneaddata::arg_generator(&raw_r1, &raw_r2, &host_db, &stage_dir, &sample_id, config.threads);
    run_tool(KNEADDATA_TAG, &args).await?;
    verify_scratch_outputs(stage, &sample_id, &stage_dir)?;

    // Contaminant-read byproducts are not needed downstream; dropping them
    // bounds scratch usage at the cost of stage-boundary-only resume.
    let removed = remove_matching(&stage_dir, "contam").unwrap_or(0);
    debug!("{}: removed {} contaminant byproducts", sample_id, removed);

    // Raw staged inputs are superseded by the decontaminated outputs.
    for raw in [&raw_r1, &raw_r2] {
        let _ = std::fs::remove_file(raw);
    }

    publish_stage(config, stage, &stage_dir).await?;

    scratch.paired = Some((
        stage_dir.join(format!("{sample_id}_paired_1.fastq")),
        stage_dir.join(format!("{sample_id}_paired_2.fastq")),
    ));
    Ok(stage_dir)
}

async fn run_classification(
    config: &RunConfig,
    states: &mut HashMap<Stage, StageState>,
    scratch: &mut ScratchArtifacts,
) -> Result<PathBuf, PipelineError> {
    let stage = Stage::Classification;
    let sample_id = config.record.sample_id.clone();
    let stage_dir = config.work_dir.join(stage.dir_name());
    std::fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason: e.to_string(),
    })?;

    upstream_guard(&config.durable_sample_dir, &sample_id, stage, scratch.paired.is_some())?;

    set_state(states, &sample_id, stage, StageState::Staging);
    let (r1, r2) = match scratch.paired.take() {
        Some(paired) => paired,
        None => {
            // Upstream was skipped as already durable: refill scratch from
            // the checkpoint.
            let names = vec![
                format!("{sample_id}_paired_1.fastq.gz"),
                format!("{sample_id}_paired_2.fastq.gz"),
            ];
            // pull_artifacts yields paths in the order of `names`.
            let pulled =
                pull_artifacts(config, Stage::Decontamination, &names, &stage_dir).await?;
            let mut iter = pulled.into_iter();
            match (iter.next(), iter.next()) {
                (Some(r1), Some(r2)) => (r1, r2),
                _ => {
                    return Err(PipelineError::StagingFailed {
                        sample_id: sample_id.clone(),
                        reason: "pull-through yielded fewer than two paired reads".to_string(),
                    })
                }
            }
        }
    };

    let kraken_db = match &scratch.staged_kraken_db {
        Some(db) => db.clone(),
        None => {
            let db = stage_reference_db(config, &config.kraken_db, "kraken2").await?;
            scratch.staged_kraken_db = Some(db.clone());
            db
        }
    };

    set_state(states, &sample_id, stage, StageState::Running);
    let report = stage_dir.join(format!("{sample_id}_kraken2_report.txt"));
    let output = stage_dir.join(format!("{sample_id}_kraken2_output.txt"));
    let args = kraken2::arg_generator(&kraken_db, &report, &output, &r1, &r2, config.threads);
    run_tool(KRAKEN2_TAG, &args).await?;
    verify_scratch_outputs(stage, &sample_id, &stage_dir)?;

    publish_stage(config, stage, &stage_dir).await?;

    scratch.kraken_report = Some(report);
    Ok(stage_dir)
}

async fn run_abundance(
    config: &RunConfig,
    states: &mut HashMap<Stage, StageState>,
    scratch: &mut ScratchArtifacts,
) -> Result<PathBuf, PipelineError> {
    let stage = Stage::AbundanceEstimation;
    let sample_id = config.record.sample_id.clone();
    let stage_dir = config.work_dir.join(stage.dir_name());
    std::fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::StagingFailed {
        sample_id: sample_id.clone(),
        reason: e.to_string(),
    })?;

    upstream_guard(&config.durable_sample_dir, &sample_id, stage, scratch.kraken_report.is_some())?;

    set_state(states, &sample_id, stage, StageState::Staging);
    let kraken_report = match scratch.kraken_report.take() {
        Some(report) => report,
        None => {
            let names = vec![format!("{sample_id}_kraken2_report.txt")];
            let pulled = pull_artifacts(config, Stage::Classification, &names, &stage_dir).await?;
            pulled
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::StagingFailed {
                    sample_id: sample_id.clone(),
                    reason: "pull-through yielded no classification report".to_string(),
                })?
        }
    };

    // Bracken's k-mer distribution tables live inside the kraken2 db dir; it
    // may already be staged from the classification stage.
    let kraken_db = match &scratch.staged_kraken_db {
        Some(db) => db.clone(),
        None => {
            let db = stage_reference_db(config, &config.kraken_db, "kraken2").await?;
            scratch.staged_kraken_db = Some(db.clone());
            db
        }
    };

    set_state(states, &sample_id, stage, StageState::Running);
    // Two re-estimations over the same classification report; the stage is
    // complete only when both succeed.
    for (level, tag) in [("S", "species"), ("G", "genus")] {
        let output = stage_dir.join(format!("{sample_id}_bracken_{tag}.tsv"));
        let new_report = stage_dir.join(format!("{sample_id}_bracken_{tag}_report.txt"));
        let args = bracken::arg_generator(&kraken_db, &kraken_report, &output, &new_report, level);
        run_tool(BRACKEN_TAG, &args).await?;
    }
    verify_scratch_outputs(stage, &sample_id, &stage_dir)?;

    publish_stage(config, stage, &stage_dir).await?;
    Ok(stage_dir)
}
