/// Functions and structs for building and running external tool command lines

use anyhow::{anyhow, Result};
use log::{debug, info};
use tokio::process::Command;

use crate::config::defs::{PipelineError, BRACKEN_TAG, KNEADDATA_TAG, KRAKEN2_TAG, PIGZ_TAG};

/// Spawns `tool` with `args` and waits for it, inheriting stderr so tool
/// diagnostics land in the job log. Non-zero exit maps to ToolExecution.
/// All paths in `args` must already be fully qualified; nothing here depends
/// on the current working directory.
pub async fn run_tool(tool: &str, args: &[String]) -> Result<(), PipelineError> {
    debug!("invoking {} {}", tool, args.join(" "));
    // kill_on_drop: when the pipeline future is dropped on interrupt, the
    // in-flight tool must die with it, not keep writing into a working
    // directory the finalizer is about to remove.
    let status = Command::new(tool)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("failed to spawn: {e}. Is {tool} installed?"),
        })?;

    if !status.success() {
        return Err(PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("exited with {status}"),
        });
    }
    Ok(())
}

/// Runs `tool` and captures stdout (scheduler accounting snapshots).
pub async fn run_tool_capture(tool: &str, args: &[String]) -> Result<String, PipelineError> {
    let output = Command::new(tool)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("failed to spawn: {e}"),
        })?;
    if !output.status.success() {
        return Err(PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("exited with {}", output.status),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn presence_check(tool: &str, version_flag: &str) -> Result<String> {
    let output = Command::new(tool)
        .arg(version_flag)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", tool, e, tool))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if first_line.is_empty() {
        return Err(anyhow!("No output from {} {}", tool, version_flag));
    }
    Ok(first_line)
}

/// Verifies each listed tool is on PATH before the first stage runs, logging
/// the reported version line.
pub async fn check_versions(tools: Vec<&str>) -> Result<()> {
    for tool in tools {
        let flag = match tool {
            BRACKEN_TAG => "-v",
            _ => "--version",
        };
        let version = presence_check(tool, flag).await?;
        info!("{}: {}", tool, version);
    }
    Ok(())
}

pub mod kneaddata {
    use std::path::Path;

    use crate::config::defs::KNEADDATA_TRIM_OPTIONS;

    pub fn arg_generator(
        r1: &Path,
        r2: &Path,
        host_db: &Path,
        out_dir: &Path,
        sample_id: &str,
        threads: usize,
    ) -> Vec<String> {
        vec![
            "--input1".to_string(),
            r1.to_string_lossy().to_string(),
            "--input2".to_string(),
            r2.to_string_lossy().to_string(),
            "--reference-db".to_string(),
            host_db.to_string_lossy().to_string(),
            "--output".to_string(),
            out_dir.to_string_lossy().to_string(),
            "--output-prefix".to_string(),
            sample_id.to_string(),
            "--threads".to_string(),
            threads.to_string(),
            "--trimmomatic-options".to_string(),
            KNEADDATA_TRIM_OPTIONS.to_string(),
            "--bypass-trf".to_string(),
        ]
    }
}

pub mod kraken2 {
    use std::path::Path;

    use crate::config::defs::KRAKEN2_CONFIDENCE;

    pub fn arg_generator(
        db: &Path,
        report: &Path,
        output: &Path,
        r1: &Path,
        r2: &Path,
        threads: usize,
    ) -> Vec<String> {
        vec![
            "--db".to_string(),
            db.to_string_lossy().to_string(),
            "--threads".to_string(),
            threads.to_string(),
            "--confidence".to_string(),
            KRAKEN2_CONFIDENCE.to_string(),
            "--paired".to_string(),
            "--report".to_string(),
            report.to_string_lossy().to_string(),
            "--output".to_string(),
            output.to_string_lossy().to_string(),
            r1.to_string_lossy().to_string(),
            r2.to_string_lossy().to_string(),
        ]
    }
}

pub mod bracken {
    use std::path::Path;

    use crate::config::defs::{BRACKEN_READ_LEN, BRACKEN_THRESHOLD};

    /// One bracken re-estimation at taxonomic `level` ("S" or "G") over an
    /// existing kraken2 report.
    pub fn arg_generator(
        db: &Path,
        kraken_report: &Path,
        output: &Path,
        new_report: &Path,
        level: &str,
    ) -> Vec<String> {
        vec![
            "-d".to_string(),
            db.to_string_lossy().to_string(),
            "-i".to_string(),
            kraken_report.to_string_lossy().to_string(),
            "-o".to_string(),
            output.to_string_lossy().to_string(),
            "-w".to_string(),
            new_report.to_string_lossy().to_string(),
            "-r".to_string(),
            BRACKEN_READ_LEN.to_string(),
            "-l".to_string(),
            level.to_string(),
            "-t".to_string(),
            BRACKEN_THRESHOLD.to_string(),
        ]
    }
}

pub mod pigz {
    use std::path::Path;

    /// Decompresses in place (drops the .gz), parallelized to the thread
    /// allocation.
    pub fn decompress_args(path: &Path, threads: usize) -> Vec<String> {
        vec![
            "-d".to_string(),
            "-f".to_string(),
            "-p".to_string(),
            threads.to_string(),
            path.to_string_lossy().to_string(),
        ]
    }

    /// Compresses in place, keeping the original so a failed publish leaves
    /// the scratch copy intact.
    pub fn compress_args(path: &Path, threads: usize) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-k".to_string(),
            "-p".to_string(),
            threads.to_string(),
            path.to_string_lossy().to_string(),
        ]
    }
}

pub mod tar {
    use std::path::Path;

    /// Packages `files` (relative to `base_dir`) into a gzipped archive.
    pub fn archive_args(archive: &Path, base_dir: &Path, files: &[String]) -> Vec<String> {
        let mut args = vec![
            "-czf".to_string(),
            archive.to_string_lossy().to_string(),
            "-C".to_string(),
            base_dir.to_string_lossy().to_string(),
        ];
        args.extend(files.iter().cloned());
        args
    }
}

pub mod rsync {
    use std::path::Path;

    /// Pushes a durable sample directory to the remote store through the
    /// relay host over an authenticated channel.
    pub fn transfer_args(sample_dir: &Path, relay_host: &str, remote: &str, dest: &str) -> Vec<String> {
        vec![
            "-az".to_string(),
            "-e".to_string(),
            format!("ssh -J {relay_host}"),
            sample_dir.to_string_lossy().to_string(),
            format!("{remote}:{dest}"),
        ]
    }
}

/// Convenience: which tools a stage list needs, for the startup presence check.
pub fn tools_for_stages(stages: &[crate::config::defs::Stage]) -> Vec<&'static str> {
    use crate::config::defs::Stage;
    let mut tools = vec![PIGZ_TAG];
    for stage in stages {
        tools.push(match stage {
            Stage::Decontamination => KNEADDATA_TAG,
            Stage::Classification => KRAKEN2_TAG,
            Stage::AbundanceEstimation => BRACKEN_TAG,
        });
    }
    tools
}
