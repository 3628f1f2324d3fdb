use std::path::PathBuf;
use std::collections::HashMap;
use lazy_static::lazy_static;
use thiserror::Error;

// External software
pub const GZIP_EXT: &str = "gz";
pub const KNEADDATA_TAG: &str = "kneaddata";
pub const KRAKEN2_TAG: &str = "kraken2";
pub const BRACKEN_TAG: &str = "bracken";
pub const PIGZ_TAG: &str = "pigz";
pub const TAR_TAG: &str = "tar";
pub const RSYNC_TAG: &str = "rsync";
pub const SACCT_TAG: &str = "sacct";

lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, f32> = {
        let mut m = HashMap::new();
        m.insert(KNEADDATA_TAG, 0.12);
        m.insert(KRAKEN2_TAG, 2.1);
        m.insert(BRACKEN_TAG, 2.9);
        m.insert(PIGZ_TAG, 2.8);

        m
    };
}

// Static Parameters
// Tool tuning is fixed configuration: it is never re-derived at runtime, so a
// re-run of a stage stays compatible with the durable tree of a prior run.
pub const KNEADDATA_TRIM_OPTIONS: &str = "SLIDINGWINDOW:4:20 MINLEN:50";
pub const KRAKEN2_CONFIDENCE: f64 = 0.1;
pub const BRACKEN_READ_LEN: usize = 150;
pub const BRACKEN_THRESHOLD: usize = 10;

// Environment integration (read once in main, never inside component logic)
pub const ARRAY_TASK_ID_VAR: &str = "SLURM_ARRAY_TASK_ID";
pub const TASK_ID_OVERRIDE_VAR: &str = "TAXPROF_TASK_ID";
pub const CPUS_PER_TASK_VAR: &str = "SLURM_CPUS_PER_TASK";
pub const JOB_ID_VAR: &str = "SLURM_JOB_ID";
pub const SCRATCH_DIR_VAR: &str = "SLURM_TMPDIR";

pub const TRANSFER_ATTEMPTS: usize = 3;
pub const TRANSFER_RETRY_SECS: u64 = 30;

/// One manifest row: the unit of work for a single array task.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub sample_id: String,
    pub input_a: PathBuf,
    pub input_b: PathBuf,
}

/// Ordered pipeline stages. The variant order is the dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Decontamination,
    Classification,
    AbundanceEstimation,
}

impl Stage {
    pub fn ordered() -> [Stage; 3] {
        [
            Stage::Decontamination,
            Stage::Classification,
            Stage::AbundanceEstimation,
        ]
    }

    /// Durable-storage subdirectory this stage writes into.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Decontamination => "decontamination",
            Stage::Classification => "classification",
            Stage::AbundanceEstimation => "abundance",
        }
    }

    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Decontamination => None,
            Stage::Classification => Some(Stage::Decontamination),
            Stage::AbundanceEstimation => Some(Stage::Classification),
        }
    }

    /// CLI flag that requests this stage, used in operator guidance.
    pub fn flag_name(&self) -> &'static str {
        match self {
            Stage::Decontamination => "--decontam",
            Stage::Classification => "--classify",
            Stage::AbundanceEstimation => "--abundance",
        }
    }

    /// Artifacts the external tool must leave in scratch for the stage to
    /// count as having run at all. Names are fixed tool output contracts.
    pub fn expected_scratch_artifacts(&self, sample_id: &str) -> Vec<String> {
        match self {
            Stage::Decontamination => vec![
                format!("{sample_id}_paired_1.fastq"),
                format!("{sample_id}_paired_2.fastq"),
                format!("{sample_id}_unmatched_1.fastq"),
                format!("{sample_id}_unmatched_2.fastq"),
            ],
            Stage::Classification => vec![
                format!("{sample_id}_kraken2_report.txt"),
                format!("{sample_id}_kraken2_output.txt"),
            ],
            Stage::AbundanceEstimation => vec![
                format!("{sample_id}_bracken_species.tsv"),
                format!("{sample_id}_bracken_species_report.txt"),
                format!("{sample_id}_bracken_genus.tsv"),
                format!("{sample_id}_bracken_genus_report.txt"),
            ],
        }
    }

    /// Artifacts that must exist non-empty in durable storage for the stage
    /// to be considered complete. Durable storage is the only checkpoint
    /// ledger; this list is the whole of the skip condition.
    pub fn required_durable_artifacts(&self, sample_id: &str) -> Vec<String> {
        match self {
            Stage::Decontamination => vec![
                format!("{sample_id}_paired_1.fastq.gz"),
                format!("{sample_id}_paired_2.fastq.gz"),
                format!("{sample_id}_unmatched_1.fastq.gz"),
                format!("{sample_id}_unmatched_2.fastq.gz"),
            ],
            Stage::Classification => vec![
                format!("{sample_id}_kraken2_report.txt"),
                format!("{sample_id}_kraken2_output.txt.gz"),
            ],
            Stage::AbundanceEstimation => vec![
                format!("{sample_id}_bracken_species.tsv"),
                format!("{sample_id}_bracken_species_report.txt"),
                format!("{sample_id}_bracken_genus.tsv"),
                format!("{sample_id}_bracken_genus_report.txt"),
            ],
        }
    }

    /// Whether a scratch artifact is gzipped before publication (bulky
    /// per-record sequence or label files).
    pub fn compressed_on_publish(&self, name: &str) -> bool {
        match self {
            Stage::Decontamination => name.ends_with(".fastq"),
            Stage::Classification => name.ends_with("_kraken2_output.txt"),
            Stage::AbundanceEstimation => false,
        }
    }

    /// Name of the per-stage auxiliary report archive.
    pub fn report_archive_name(&self, sample_id: &str) -> String {
        format!("{sample_id}_{}_reports.tar.gz", self.dir_name())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Remote-publish collaborator wiring. Transfers go through a relay host and
/// are best-effort: their failure never changes the compute exit code.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub relay_host: String,
    pub remote: String,
    pub dest_subpath: String,
}

/// Process-lifetime run context, built once in main from flags and
/// environment. Components take this by reference and never read ambient
/// global state themselves.
pub struct RunConfig {
    pub record: Record,
    pub stages: Vec<Stage>,
    pub work_dir: PathBuf,
    pub durable_sample_dir: PathBuf,
    pub host_db: PathBuf,
    pub kraken_db: PathBuf,
    pub threads: usize,
    pub study: String,
    pub job_id: Option<String>,
    pub transfer: Option<TransferConfig>,
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("cannot open manifest {0}")]
    ManifestUnreadable(PathBuf),
    #[error("manifest {0} has a header but no data rows")]
    EmptyManifest(PathBuf),
    #[error("task index {index} outside manifest range 1..={rows}")]
    IndexOutOfRange { index: usize, rows: usize },
    #[error("manifest row {index} is malformed: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("input file for sample {sample_id} is not readable: {path}")]
    InputUnavailable { sample_id: String, path: PathBuf },
    #[error("staging failed for sample {sample_id}: {reason}")]
    StagingFailed { sample_id: String, reason: String },
    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },
    #[error("stage {stage} for sample {sample_id} left no usable {artifact}")]
    StageOutputMissing {
        stage: Stage,
        sample_id: String,
        artifact: String,
    },
    #[error(
        "stage {stage} requested for sample {sample_id} but upstream stage {upstream} \
         has no durable output; rerun with {flag} first"
    )]
    MissingUpstreamArtifact {
        stage: Stage,
        upstream: Stage,
        sample_id: String,
        flag: &'static str,
    },
    #[error("publish of stage {stage} for sample {sample_id} failed: {reason} (scratch copy preserved)")]
    PublishFailed {
        stage: Stage,
        sample_id: String,
        reason: String,
    },
    #[error("remote transfer failed for sample {sample_id}: {reason}")]
    TransferFailed { sample_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Distinct process exit code per failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::InvalidConfig(_)
            | PipelineError::ManifestUnreadable(_)
            | PipelineError::EmptyManifest(_)
            | PipelineError::IndexOutOfRange { .. } => 2,
            PipelineError::MalformedRecord { .. } => 3,
            PipelineError::InputUnavailable { .. } => 4,
            PipelineError::StagingFailed { .. } => 5,
            PipelineError::ToolExecution { .. } => 6,
            PipelineError::StageOutputMissing { .. } => 7,
            PipelineError::MissingUpstreamArtifact { .. } => 8,
            PipelineError::PublishFailed { .. } => 9,
            PipelineError::TransferFailed { .. } | PipelineError::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_dependencies() {
        let stages = Stage::ordered();
        assert_eq!(stages[0].upstream(), None);
        assert_eq!(stages[1].upstream(), Some(stages[0]));
        assert_eq!(stages[2].upstream(), Some(stages[1]));
    }

    #[test]
    fn durable_names_preserve_tool_contracts() {
        let durable = Stage::Decontamination.required_durable_artifacts("S1");
        assert!(durable.contains(&"S1_paired_1.fastq.gz".to_string()));
        assert!(durable.contains(&"S1_unmatched_2.fastq.gz".to_string()));

        let durable = Stage::Classification.required_durable_artifacts("S1");
        assert!(durable.contains(&"S1_kraken2_report.txt".to_string()));
        assert!(durable.contains(&"S1_kraken2_output.txt.gz".to_string()));
    }

    #[test]
    fn only_bulky_files_are_compressed() {
        assert!(Stage::Decontamination.compressed_on_publish("S1_paired_1.fastq"));
        assert!(Stage::Classification.compressed_on_publish("S1_kraken2_output.txt"));
        assert!(!Stage::Classification.compressed_on_publish("S1_kraken2_report.txt"));
        assert!(!Stage::AbundanceEstimation.compressed_on_publish("S1_bracken_species.tsv"));
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let errs = [
            PipelineError::InvalidConfig("x".into()).exit_code(),
            PipelineError::MalformedRecord { index: 1, reason: "x".into() }.exit_code(),
            PipelineError::InputUnavailable { sample_id: "S1".into(), path: "/x".into() }.exit_code(),
            PipelineError::StagingFailed { sample_id: "S1".into(), reason: "x".into() }.exit_code(),
            PipelineError::ToolExecution { tool: "t".into(), error: "x".into() }.exit_code(),
            PipelineError::StageOutputMissing {
                stage: Stage::Decontamination,
                sample_id: "S1".into(),
                artifact: "a".into(),
            }
            .exit_code(),
        ];
        let mut sorted = errs.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), errs.len());
        assert!(errs.iter().all(|c| *c != 0));
    }
}
