// src/pipelines/cleanup.rs: unconditional end-of-job finalizer.
//
// Runs on every exit path (normal, fatal error, interrupt). The early_exit
// decision is passed in explicitly rather than read from shared mutable
// state: an early exit discards scratch and publishes nothing, so durable
// storage only ever contains artifacts from stages that completed wholly.

use std::time::Duration;

use log::{error, info, warn};
use tokio::time::sleep;

use crate::config::defs::{
    PipelineError, RunConfig, RSYNC_TAG, SACCT_TAG, TRANSFER_ATTEMPTS, TRANSFER_RETRY_SECS,
};
use crate::pipelines::taxprofile::RunOutcome;
use crate::utils::checkpoint::publish_stage;
use crate::utils::command::{rsync, run_tool, run_tool_capture};

/// Finalizes the job. Never panics and never returns an error that would
/// mask the pipeline result; every step is logged and the working directory
/// is released no matter what happened before.
pub async fn finalize(config: &RunConfig, outcome: &RunOutcome, early_exit: bool) {
    let sample_id = &config.record.sample_id;

    if early_exit {
        warn!("{}: early exit, discarding scratch without publish", sample_id);
        discard_workdir(config);
        return;
    }

    // Safety net for the per-stage publishes that already ran in the
    // orchestrator: idempotent, so a fully published stage is a no-op here.
    for (stage, scratch_dir) in &outcome.completed {
        if let Err(e) = publish_stage(config, *stage, scratch_dir).await {
            error!("{}: late publish of stage {} failed: {}", sample_id, stage, e);
        }
    }

    if let Err(e) = snapshot_accounting(config).await {
        warn!("{}: accounting snapshot skipped: {}", sample_id, e);
    }

    discard_workdir(config);

    if let Some(transfer) = &config.transfer {
        // Best-effort and decoupled from the compute result: the remote
        // ingress throttles concurrent transfers, so failures here are
        // logged and retried without touching the primary exit code.
        if let Err(e) = dispatch_transfer(config, transfer).await {
            error!("{}", e);
        }
    }
}

fn discard_workdir(config: &RunConfig) {
    match std::fs::remove_dir_all(&config.work_dir) {
        Ok(()) => info!(
            "{}: released scratch {}",
            config.record.sample_id,
            config.work_dir.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "{}: could not release scratch {}: {}",
            config.record.sample_id,
            config.work_dir.display(),
            e
        ),
    }
}

/// Snapshots scheduler accounting for the task into the durable sample
/// directory for audit. Only meaningful under the scheduler; absent job ids
/// are skipped quietly.
async fn snapshot_accounting(config: &RunConfig) -> Result<(), PipelineError> {
    let Some(job_id) = &config.job_id else {
        return Ok(());
    };
    let args = vec![
        "-j".to_string(),
        job_id.clone(),
        "--format=JobID,JobName,Elapsed,MaxRSS,State,ExitCode".to_string(),
    ];
    let report = run_tool_capture(SACCT_TAG, &args).await?;
    let dest = config
        .durable_sample_dir
        .join(format!("{}_job_accounting.txt", config.record.sample_id));
    std::fs::create_dir_all(&config.durable_sample_dir)
        .and_then(|_| std::fs::write(&dest, report))
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("accounting write: {e}")))?;
    info!("{}: accounting snapshot at {}", config.record.sample_id, dest.display());
    Ok(())
}

/// Hands the durable sample directory to the remote-publish collaborator
/// through the relay host, with bounded retries. Each sample's transfer is
/// independent; nothing upstream waits on it.
async fn dispatch_transfer(
    config: &RunConfig,
    transfer: &crate::config::defs::TransferConfig,
) -> Result<(), PipelineError> {
    let sample_id = &config.record.sample_id;
    let dest = format!("{}/", transfer.dest_subpath.trim_end_matches('/'));
    let args = rsync::transfer_args(
        &config.durable_sample_dir,
        &transfer.relay_host,
        &transfer.remote,
        &dest,
    );

    let mut last_error = String::new();
    for attempt in 1..=TRANSFER_ATTEMPTS {
        match run_tool(RSYNC_TAG, &args).await {
            Ok(()) => {
                info!(
                    "{}: transferred durable outputs to {}:{} (attempt {})",
                    sample_id, transfer.remote, dest, attempt
                );
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                warn!("{}: transfer attempt {} failed: {}", sample_id, attempt, last_error);
                if attempt < TRANSFER_ATTEMPTS {
                    sleep(Duration::from_secs(TRANSFER_RETRY_SECS)).await;
                }
            }
        }
    }
    Err(PipelineError::TransferFailed {
        sample_id: sample_id.clone(),
        reason: format!("{TRANSFER_ATTEMPTS} attempts exhausted: {last_error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use crate::config::defs::{Record, Stage};

    fn test_config(work_dir: PathBuf, durable: PathBuf) -> RunConfig {
        RunConfig {
            record: Record {
                sample_id: "S1".to_string(),
                input_a: PathBuf::from("/data/S1_R1.fastq.gz"),
                input_b: PathBuf::from("/data/S1_R2.fastq.gz"),
            },
            stages: vec![Stage::Decontamination],
            work_dir,
            durable_sample_dir: durable,
            host_db: PathBuf::from("/db/host"),
            kraken_db: PathBuf::from("/db/k2"),
            threads: 1,
            study: "study".to_string(),
            job_id: None,
            transfer: None,
            verbose: false,
        }
    }

    #[tokio::test]
    async fn early_exit_discards_scratch_and_publishes_nothing() {
        let scratch = TempDir::new().unwrap();
        let durable = TempDir::new().unwrap();
        let work_dir = scratch.path().join("S1");
        std::fs::create_dir_all(work_dir.join("decontamination")).unwrap();
        std::fs::write(work_dir.join("decontamination/S1_paired_1.fastq"), b"@r1\n").unwrap();

        let config = test_config(work_dir.clone(), durable.path().join("S1"));
        let outcome = RunOutcome {
            completed: vec![(Stage::Decontamination, work_dir.join("decontamination"))],
        };

        finalize(&config, &outcome, true).await;

        assert!(!work_dir.exists());
        // No durable sample dir was ever created.
        assert!(!durable.path().join("S1").exists());
    }

    #[tokio::test]
    async fn clean_exit_releases_scratch() {
        let scratch = TempDir::new().unwrap();
        let durable = TempDir::new().unwrap();
        let work_dir = scratch.path().join("S1");
        std::fs::create_dir_all(&work_dir).unwrap();

        let config = test_config(work_dir.clone(), durable.path().join("S1"));
        finalize(&config, &RunOutcome::default(), false).await;

        assert!(!work_dir.exists());
    }

    #[tokio::test]
    async fn missing_workdir_is_not_an_error() {
        let durable = TempDir::new().unwrap();
        let config = test_config(
            PathBuf::from("/nonexistent/scratch/S1"),
            durable.path().join("S1"),
        );
        finalize(&config, &RunOutcome::default(), false).await;
    }
}
