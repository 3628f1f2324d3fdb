mod pipelines;
mod utils;
mod config;
mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use std::{env, fs};
use std::io::Write;

use anyhow::Result;
use log::{LevelFilter, debug, error, info, warn};
use env_logger::Builder;
use tokio::signal;

use crate::cli::parse;
use crate::config::defs::{PipelineError, Record, RunConfig, Stage, TransferConfig};
use crate::pipelines::{cleanup, taxprofile};
use crate::pipelines::taxprofile::RunOutcome;
use crate::utils::manifest;
use crate::utils::system::{detect_job_id, detect_task_index, detect_threads, get_scratch_root};

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n TaxProf\n-------------\n");

    let cwd = env::current_dir()?;
    info!("The current directory is {:?}", cwd);

    let config = match build_run_config(&args, &cwd) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };
    info!(
        "Sample {} (study {}): stages {:?}, {} threads, scratch {}, durable {}",
        config.record.sample_id,
        config.study,
        config.stages.iter().map(|s| s.dir_name()).collect::<Vec<_>>(),
        config.threads,
        config.work_dir.display(),
        config.durable_sample_dir.display()
    );

    // The pipeline races the interrupt signal; either way the finalizer runs
    // before the process exits, so scratch is always released and durable
    // storage never sees a partially produced stage.
    let pipeline_result = tokio::select! {
        result = taxprofile::run(config.clone()) => result,
        _ = signal::ctrl_c() => {
            warn!("{}: interrupted, aborting sample", config.record.sample_id);
            Err(PipelineError::Other(anyhow::anyhow!("interrupted")))
        }
    };

    match pipeline_result {
        Ok(outcome) => {
            cleanup::finalize(&config, &outcome, false).await;
            println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
            Ok(())
        }
        Err(e) => {
            error!(
                "Pipeline failed for sample {}: {} at {} milliseconds.",
                config.record.sample_id,
                e,
                run_start.elapsed().as_millis()
            );
            cleanup::finalize(&config, &RunOutcome::default(), true).await;
            std::process::exit(e.exit_code());
        }
    }
}

/// Builds the immutable run context from flags and environment. This is the
/// only place ambient state (env vars, cwd) is consulted.
fn build_run_config(args: &cli::Arguments, cwd: &PathBuf) -> Result<RunConfig, PipelineError> {
    let stages = requested_stages(args)?;

    let task_index = detect_task_index(args.task_index)?;
    let threads = detect_threads(args.threads);
    debug!("task index {}, {} threads", task_index, threads);

    let manifest_path = absolute(&args.manifest, cwd);
    let record: Record = manifest::resolve(&manifest_path, task_index)?;

    let scratch_root = get_scratch_root();
    let work_dir = scratch_root.join(&record.sample_id);

    let durable_base = match (&args.durable_root, args.scratch_output) {
        (_, true) => scratch_root.join("durable"),
        (Some(root), false) => absolute(root, cwd),
        (None, false) => cwd.join("results"),
    };
    let durable_sample_dir = durable_base.join(&args.study).join(&record.sample_id);
    fs::create_dir_all(&durable_sample_dir)
        .map_err(|e| PipelineError::InvalidConfig(format!("cannot create durable dir: {e}")))?;

    let transfer = args.transfer.then(|| TransferConfig {
        relay_host: args.relay_host.clone(),
        remote: args.transfer_host.clone(),
        dest_subpath: args
            .transfer_dest
            .clone()
            .unwrap_or_else(|| args.study.clone()),
    });

    Ok(RunConfig {
        record,
        stages,
        work_dir,
        durable_sample_dir,
        host_db: absolute(&args.host_db, cwd),
        kraken_db: absolute(&args.kraken_db, cwd),
        threads,
        study: args.study.clone(),
        job_id: detect_job_id(),
        transfer,
        verbose: args.verbose,
    })
}

/// Stage selection is explicit per invocation; any subset is accepted and
/// always executed in dependency order.
fn requested_stages(args: &cli::Arguments) -> Result<Vec<Stage>, PipelineError> {
    if args.all {
        return Ok(Stage::ordered().to_vec());
    }
    let mut stages = Vec::new();
    if args.decontam {
        stages.push(Stage::Decontamination);
    }
    if args.classify {
        stages.push(Stage::Classification);
    }
    if args.abundance {
        stages.push(Stage::AbundanceEstimation);
    }
    if stages.is_empty() {
        return Err(PipelineError::InvalidConfig(
            "no stages requested: pass --decontam, --classify, --abundance, or --all".to_string(),
        ));
    }
    Ok(stages)
}

fn absolute(path: &str, cwd: &PathBuf) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}
