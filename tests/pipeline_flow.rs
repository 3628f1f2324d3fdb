// Re-submission flow over a fake durable tree, exercising the checkpoint
// logic (skip, pull-through, idempotent publish) without invoking any of the
// external stage tools.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use taxprof_pipelines::config::defs::{PipelineError, Record, RunConfig, Stage};
use taxprof_pipelines::pipelines::taxprofile::{self, plan_stage, StageState};
use taxprof_pipelines::utils::checkpoint::{
    is_stage_complete, publish_stage, pull_artifacts, stage_dir, upstream_guard, PublishOutcome,
};
use taxprof_pipelines::utils::manifest;

fn seed_stage(durable: &Path, sample_id: &str, stage: Stage) {
    let dir = stage_dir(durable, stage);
    std::fs::create_dir_all(&dir).unwrap();
    for name in stage.required_durable_artifacts(sample_id) {
        File::create(dir.join(name)).unwrap().write_all(b"data").unwrap();
    }
}

fn config_for(durable: &Path, record: Record) -> RunConfig {
    RunConfig {
        record,
        stages: Stage::ordered().to_vec(),
        work_dir: PathBuf::from("/scratch/unused"),
        durable_sample_dir: durable.to_path_buf(),
        host_db: PathBuf::from("/db/host"),
        kraken_db: PathBuf::from("/db/k2"),
        threads: 1,
        study: "trial".to_string(),
        job_id: None,
        transfer: None,
        verbose: false,
    }
}

#[tokio::test]
async fn resubmission_skips_pulls_and_republishes_idempotently() -> Result<()> {
    let data = TempDir::new()?;
    let durable = TempDir::new()?;
    let scratch = TempDir::new()?;

    // Manifest with one sample, resolved the way an array task would.
    let r1 = data.path().join("S1_R1.fastq.gz");
    let r2 = data.path().join("S1_R2.fastq.gz");
    File::create(&r1)?.write_all(b"raw")?;
    File::create(&r2)?.write_all(b"raw")?;
    let manifest_path = data.path().join("samples.tsv");
    writeln!(File::create(&manifest_path)?, "sample_id\tinput_a\tinput_b")?;
    let mut f = std::fs::OpenOptions::new().append(true).open(&manifest_path)?;
    writeln!(f, "S1\t{}\t{}", r1.display(), r2.display())?;

    let record = manifest::resolve(&manifest_path, 1)?;
    assert_eq!(record.sample_id, "S1");
    let config = config_for(durable.path(), record);

    // Invocation 1 equivalent: decontamination ran and was published.
    seed_stage(durable.path(), "S1", Stage::Decontamination);

    // Invocation 2: decontamination plans as skipped, zero tool work.
    assert_eq!(
        plan_stage(durable.path(), "S1", Stage::Decontamination),
        StageState::SkippedComplete
    );

    // Invocation 3: classification is pending but its upstream is durable,
    // so the guard passes even with empty scratch.
    assert_eq!(
        plan_stage(durable.path(), "S1", Stage::Classification),
        StageState::Pending
    );
    upstream_guard(durable.path(), "S1", Stage::Classification, false)?;

    // Simulate the classification stage having completed, then the abundance
    // pull-through of its report into fresh scratch.
    seed_stage(durable.path(), "S1", Stage::Classification);
    let names = vec!["S1_kraken2_report.txt".to_string()];
    let pulled = pull_artifacts(&config, Stage::Classification, &names, scratch.path()).await?;
    assert_eq!(pulled, vec![scratch.path().join("S1_kraken2_report.txt")]);

    // Abundance outputs land in scratch and publish once; the second publish
    // is a no-op because durable storage is already complete.
    for name in Stage::AbundanceEstimation.expected_scratch_artifacts("S1") {
        File::create(scratch.path().join(name))?.write_all(b"taxon\t1\n")?;
    }
    let first = publish_stage(&config, Stage::AbundanceEstimation, scratch.path()).await?;
    assert_eq!(first, PublishOutcome::Published);
    assert!(is_stage_complete(durable.path(), "S1", Stage::AbundanceEstimation));
    let second = publish_stage(&config, Stage::AbundanceEstimation, scratch.path()).await?;
    assert_eq!(second, PublishOutcome::AlreadyPublished);

    Ok(())
}

#[tokio::test]
async fn fully_durable_run_spawns_no_processes() -> Result<()> {
    let durable = TempDir::new()?;
    let scratch = TempDir::new()?;
    for stage in Stage::ordered() {
        seed_stage(durable.path(), "S1", stage);
    }

    let mut config = config_for(
        durable.path(),
        Record {
            sample_id: "S1".to_string(),
            input_a: PathBuf::from("/data/S1_R1.fastq.gz"),
            input_b: PathBuf::from("/data/S1_R2.fastq.gz"),
        },
    );
    let work_dir = scratch.path().join("S1");
    config.work_dir = work_dir.clone();

    // None of the stage tools exist in this environment, so this only
    // succeeds if the skip path invokes nothing at all, preflight included.
    let outcome = taxprofile::run(std::sync::Arc::new(config)).await?;
    assert!(outcome.completed.is_empty());
    // No scratch was claimed either.
    assert!(!work_dir.exists());

    Ok(())
}

#[tokio::test]
async fn later_stage_without_any_upstream_is_a_configuration_error() -> Result<()> {
    let durable = TempDir::new()?;

    let err = upstream_guard(durable.path(), "S1", Stage::AbundanceEstimation, false).unwrap_err();
    match &err {
        PipelineError::MissingUpstreamArtifact { upstream, flag, .. } => {
            assert_eq!(*upstream, Stage::Classification);
            assert_eq!(*flag, "--classify");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Distinct from success and from the fatal tool-failure codes.
    assert_eq!(err.exit_code(), 8);

    Ok(())
}

#[test]
fn interrupted_stage_leaves_no_partial_durable_artifact() {
    // The publish destination only ever receives fully copied files via a
    // rename; a stage interrupted mid-copy leaves at most a .part sibling,
    // which the completeness check never matches.
    let durable = TempDir::new().unwrap();
    let dir = stage_dir(durable.path(), Stage::Classification);
    std::fs::create_dir_all(&dir).unwrap();
    File::create(dir.join("S1_kraken2_report.txt"))
        .unwrap()
        .write_all(b"root\t100\n")
        .unwrap();
    File::create(dir.join("S1_kraken2_output.txt.gz.part"))
        .unwrap()
        .write_all(b"partial")
        .unwrap();

    assert!(!is_stage_complete(durable.path(), "S1", Stage::Classification));
}
