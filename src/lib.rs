use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};

pub mod bloom;
pub mod classify;
pub mod error;
pub mod info;
pub mod io;
pub mod kmer;
pub mod multi;
pub mod results;
pub mod score;

use classify::{Classifier, ClassifyConfig};
use error::SieveError;
use io::{OutputFormat, SinkSet};
use results::{ResultsManager, MULTI_MATCH, NO_MATCH};
use score::ScoreParams;

/// Categorize sequencing reads against pre-built Bloom filters.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_version_flag = true)]
pub struct Args {
    /// Output prefix [p=bloomsieve]
    #[arg(short = 'p', long = "prefix", default_value = "bloomsieve", hide_default_value = true)]
    pub prefix: String,

    /// Filter files to use, whitespace-separated: "filter1.bf filter2.bf"
    #[arg(short = 'f', long = "filter_files")]
    pub filter_files: String,

    /// Use paired-end information (two files, or one interleaved stream)
    #[arg(short = 'e', long = "paired_mode")]
    pub paired: bool,

    /// If one paired read matches, both reads are included
    #[arg(short = 'i', long = "inclusive")]
    pub inclusive: bool,

    /// Score threshold in [0,1]; 1 selects the best hit instead [s=0.15]
    #[arg(short = 's', long = "score", default_value_t = 0.15, hide_default_value = true)]
    pub score: f64,

    /// Append the match score to output read ids
    #[arg(short = 'w', long = "with_score")]
    pub with_score: bool,

    /// Number of threads [t=1]
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Gzip all output files
    #[arg(short = 'g', long = "gz_output")]
    pub gz_output: bool,

    /// Write categorized reads as FASTA
    #[arg(long = "fa")]
    pub fasta_out: bool,

    /// Write categorized reads as FASTQ
    #[arg(long = "fq")]
    pub fastq_out: bool,

    /// Discard and do not evaluate unchaste reads
    #[arg(long = "chastity", overrides_with = "no_chastity")]
    pub chastity: bool,

    /// Keep unchaste reads [default]
    #[arg(long = "no-chastity", overrides_with = "chastity")]
    pub no_chastity: bool,

    /// Discard reads shorter than the cutoff [l=0]
    #[arg(short = 'l', long = "length_cutoff", default_value_t = 0, hide_default_value = true)]
    pub length_cutoff: usize,

    /// Tiling hits needed before a read is scored against a filter [m=0]
    #[arg(short = 'm', long = "min_hit", default_value_t = 0, hide_default_value = true)]
    pub min_hit: u32,

    /// Consecutive hits needed before a miss jumps a whole tile [r=3]
    #[arg(short = 'r', long = "streak", default_value_t = 3, hide_default_value = true)]
    pub streak: u32,

    /// Use only the initial tiling pass to evaluate reads
    #[arg(short = 'o', long = "min_hit_only")]
    pub min_hit_only: bool,

    /// Ordered filtering: filters listed first take priority
    #[arg(short = 'c', long = "ordered")]
    pub ordered: bool,

    /// Evaluate these filters on their combined score: "id1 id2"
    #[arg(long = "collab")]
    pub collab: Option<String>,

    /// Also write reads matching this filter to stdout as FASTQ
    #[arg(short = 'd', long = "stdout_filter")]
    pub stdout_filter: Option<String>,

    /// Input read files (FASTA/FASTQ, plain or .gz)
    pub inputs: Vec<PathBuf>,

    /// Display version information.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    pub version: (),
}

fn config_error(msg: impl Into<String>) -> anyhow::Error {
    SieveError::Config(msg.into()).into()
}

pub fn run_with_args(args: Args) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.score) {
        return Err(config_error(format!(
            "score threshold (-s) must be between 0 and 1, got {}",
            args.score
        )));
    }
    let num_threads = args.threads.unwrap_or(1);
    if num_threads < 1 {
        return Err(config_error("threads (-t) must be >= 1"));
    }
    if args.streak < 1 {
        return Err(config_error("streak threshold (-r) must be >= 1"));
    }

    let filter_paths: Vec<PathBuf> = args
        .filter_files
        .split_whitespace()
        .map(PathBuf::from)
        .collect();
    if filter_paths.is_empty() {
        return Err(config_error("need at least one filter file (-f)"));
    }
    if args.inputs.is_empty() {
        return Err(config_error("need at least one input file"));
    }
    if args.paired && !(args.inputs.len() == 1 || args.inputs.len() == 2) {
        return Err(config_error(
            "paired mode (-e) takes two read files, or one interleaved stream",
        ));
    }
    for input in &args.inputs {
        if !input.is_file() {
            return Err(config_error(format!("input file {:?} does not exist", input)));
        }
    }

    let output_format = match (args.fasta_out, args.fastq_out) {
        (true, true) => {
            return Err(config_error(
                "FASTA (--fa) and FASTQ (--fq) output cannot both be set",
            ))
        }
        (true, false) => Some(OutputFormat::Fasta),
        (false, true) => Some(OutputFormat::Fastq),
        (false, false) => None,
    };
    if args.with_score && output_format.is_none() {
        return Err(config_error("-w needs an output method (--fa or --fq)"));
    }
    if args.ordered && args.min_hit > 0 {
        return Err(config_error("-c and -m cannot both be set"));
    }
    if args.collab.is_some() && args.min_hit > 0 {
        return Err(config_error("--collab and -m cannot both be set"));
    }

    // the summary and category files land next to the prefix
    let prefix_path = Path::new(&args.prefix);
    if let Some(parent) = prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(config_error(format!(
                "output folder {:?} does not exist",
                parent
            )));
        }
    }

    eprintln!("bloomsieve v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "parameters: score={} min_hit={} streak={} min_hit_only={} paired={} inclusive={} ordered={} threads={} prefix={}",
        args.score,
        args.min_hit,
        args.streak,
        args.min_hit_only,
        args.paired,
        args.inclusive,
        args.ordered,
        num_threads,
        args.prefix
    );

    let set = multi::load_filters(&filter_paths)?;

    let collab = match &args.collab {
        None => None,
        Some(list) => {
            let mut subset = Vec::new();
            for id in list.split_whitespace() {
                let idx = set
                    .index_of(id)
                    .ok_or_else(|| config_error(format!("--collab names unknown filter {:?}", id)))?;
                subset.push(idx);
            }
            if subset.is_empty() {
                return Err(config_error("--collab names no filters"));
            }
            subset.sort_unstable();
            Some(subset)
        }
    };
    let main_filter = match &args.stdout_filter {
        None => None,
        Some(id) => Some(set.index_of(id).ok_or_else(|| {
            config_error(format!("-d names unknown filter {:?}", id))
        })?),
    };

    let mut results = ResultsManager::new(set.ids());
    let mut sinks = match output_format {
        None => None,
        Some(format) => {
            let labels: Vec<&str> = set
                .ids()
                .iter()
                .map(String::as_str)
                .chain([MULTI_MATCH, NO_MATCH])
                .collect();
            Some(SinkSet::create(
                &args.prefix,
                &labels,
                format,
                args.gz_output,
                args.paired,
            )?)
        }
    };

    let cfg = ClassifyConfig {
        params: ScoreParams {
            score_threshold: args.score,
            min_hit: args.min_hit,
            streak_threshold: args.streak,
            min_hit_only: args.min_hit_only,
        },
        ordered: args.ordered,
        inclusive: args.inclusive,
        with_score: args.with_score,
        min_length: args.length_cutoff,
        chastity: args.chastity,
        threads: num_threads,
        collab,
        main_filter,
    };
    let classifier = Classifier::new(set, cfg);

    eprintln!("filtering start");
    if args.paired {
        if args.inputs.len() == 2 {
            classifier.run_paired(&args.inputs[0], &args.inputs[1], &mut results, sinks.as_mut())?;
        } else {
            classifier.run_interleaved(&args.inputs[0], &mut results, sinks.as_mut())?;
        }
    } else {
        classifier.run_single(&args.inputs, &mut results, sinks.as_mut())?;
    }

    if let Some(sinks) = sinks.as_mut() {
        sinks.finish()?;
    }
    let summary_path = PathBuf::from(format!("{}_summary.tsv", args.prefix));
    results.write_summary(&summary_path)?;
    eprintln!("total read units: {}", results.total());

    Ok(())
}
