// ========================================================================================
//
//                         The orchestrator: polyscore
//
// ========================================================================================
//
// Parses the command line, loads every input up front, runs the chunked scoring
// pipeline, and only then writes the score table. A failure at any stage exits
// non-zero before anything reaches stdout.

#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, ValueEnum};
use polyscore::config::PipelineConfig;
use polyscore::hwe;
use polyscore::pipeline::{self, PipelineContext};
use polyscore::prepare::{SampleIdMap, SampleList, SnpTable};
use polyscore::report;
use polyscore::source::{BcftoolsQuery, SourceLayout, VariantSource, VcfScan};
use std::error::Error;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "polyscore",
    version,
    about = "Streaming polygenic risk scores from indexed variant-call files."
)]
struct Args {
    /// Genotype source: a VCF file, or the root directory of a split layout.
    #[clap(value_name = "GENOTYPE_SOURCE")]
    genotype_source: PathBuf,

    /// Tab-delimited weights: chromosome, position, effect allele, reference allele, weight.
    #[clap(value_name = "SNP_FILE")]
    snp_file: PathBuf,

    /// One sample ID per line.
    #[clap(value_name = "SAMPLE_FILE")]
    sample_file: PathBuf,

    /// Optional tab-delimited map from sample ID to an external name.
    #[clap(value_name = "SAMPLE_IDMAP")]
    sample_idmap: Option<PathBuf>,

    /// Disable the effect-allele-frequency filter.
    #[clap(long)]
    no_maf_cutoff: bool,

    /// How genotype files are laid out under GENOTYPE_SOURCE.
    #[clap(long, value_enum, default_value_t = Layout::Single)]
    layout: Layout,

    /// Directory of `chr<chr>.txt` interval indices. Chunks then follow the indexed intervals.
    #[clap(long, value_name = "DIR")]
    chunk_index_dir: Option<PathBuf>,

    /// The sample file starts with a header; only the first token of each later line is read.
    #[clap(long)]
    sample_header: bool,

    /// How genotype rows are read.
    #[clap(long, value_enum, default_value_t = Reader::Bcftools)]
    reader: Reader,

    /// TOML file overriding the default thresholds and tuning.
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of chunks processed at once.
    #[clap(long)]
    threads: Option<usize>,

    /// Seed for chunk shuffling.
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Layout {
    Single,
    PerChromosome,
    PerChunk,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Reader {
    /// `bcftools query` against an indexed file.
    Bcftools,
    /// The in-process VCF scanner.
    Builtin,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let overall_start = Instant::now();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if args.no_maf_cutoff {
        config.maf_filter = false;
    }
    if let Some(threads) = args.threads {
        config.concurrency = threads;
    }
    if args.seed.is_some() {
        config.shuffle_seed = args.seed;
    }
    config.validate()?;

    eprintln!("> Loading SNP weights from '{}'", args.snp_file.display());
    let snp_table = SnpTable::load(&args.snp_file)?;
    eprintln!(
        "> Loaded {} SNPs across {} chromosomes",
        snp_table.len(),
        snp_table.chromosomes().len()
    );

    let samples = SampleList::load(&args.sample_file, args.sample_header)?;
    eprintln!("> Scoring {} samples", samples.len());
    let sample_names = match &args.sample_idmap {
        Some(path) => Some(SampleIdMap::load(path)?.resolve_names(&samples)),
        None => None,
    };

    let layout = match args.layout {
        Layout::Single => SourceLayout::Single(args.genotype_source.clone()),
        Layout::PerChromosome => SourceLayout::PerChromosome(args.genotype_source.clone()),
        Layout::PerChunk => SourceLayout::PerChunk(args.genotype_source.clone()),
    };

    let source: Box<dyn VariantSource> = match args.reader {
        Reader::Bcftools => Box::new(BcftoolsQuery::new(&config.bcftools, &samples)?),
        Reader::Builtin => Box::new(VcfScan::new(&samples)),
    };
    let hwe_engine = hwe::engine_from_config(&config);

    let context = PipelineContext::new(
        snp_table,
        samples,
        layout,
        config,
        args.chunk_index_dir.as_deref(),
    )?;
    eprintln!(
        "> Running {} chunks on {} workers",
        context.chunks.len(),
        context.config.concurrency
    );

    let compute_start = Instant::now();
    let outcome = pipeline::run(&context, source.as_ref(), hwe_engine.as_ref())?;
    eprintln!("> Computation finished in {:.2?}", compute_start.elapsed());

    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    report::write_score_table(&mut writer, &outcome.accumulators, sample_names.as_deref())?;
    report::write_summary(&mut io::stderr().lock(), &outcome.counters)?;

    eprintln!("> Total time: {:.2?}", overall_start.elapsed());
    Ok(())
}
