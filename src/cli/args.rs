use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "taxprof-pipelines", version = "0.1.0")]
pub struct Arguments {
    #[arg(long, help = "Run the decontamination/QC stage (kneaddata)")]
    pub decontam: bool,

    #[arg(long, help = "Run the taxonomic classification stage (kraken2)")]
    pub classify: bool,

    #[arg(long, help = "Run the abundance re-estimation stage (bracken, species + genus)")]
    pub abundance: bool,

    #[arg(long, help = "Run all three stages in dependency order")]
    pub all: bool,

    #[arg(short = 'm', long = "manifest", default_value = "samples.tsv",
          help = "Tabular manifest: header plus one row per sample (sample_id, input_a, input_b)")]
    pub manifest: String,

    #[arg(short = 'o', long = "durable-root",
          help = "Base directory for durable output. Defaults to <cwd>/results. The sample tree lands at <root>/<study>/<sample_id>.")]
    pub durable_root: Option<String>,

    #[arg(long, default_value_t = false,
          help = "Place the durable tree under node-local scratch instead of shared storage (dry runs)")]
    pub scratch_output: bool,

    #[arg(short = 's', long = "study", default_value = "default_study",
          help = "Study/run name used for output and log namespacing")]
    pub study: String,

    #[arg(long, help = "1-based manifest row to process; overrides the scheduler-provided array index")]
    pub task_index: Option<usize>,

    #[arg(long, help = "Upper bound on threads handed to stage tools; defaults to the scheduler core allocation")]
    pub threads: Option<usize>,

    #[arg(long, default_value = "host_bowtie2_db",
          help = "Shared versioned host-reference database for decontamination")]
    pub host_db: String,

    #[arg(short = 'k', long = "kdb", default_value = "k2_standard_db",
          help = "Shared versioned kraken2 database; bracken k-mer tables live inside it")]
    pub kraken_db: String,

    #[arg(long, default_value_t = false,
          help = "After a clean run, hand the durable sample directory to the remote-publish collaborator")]
    pub transfer: bool,

    #[arg(long = "transfer-dest",
          help = "Destination subpath on the remote store; defaults to the study name")]
    pub transfer_dest: Option<String>,

    #[arg(long, default_value = "dtn01", help = "Relay host the transfer channel is tunnelled through")]
    pub relay_host: String,

    #[arg(long, default_value = "archive.example.org", help = "Remote store host")]
    pub transfer_host: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,
}
