use crate::aggregate::PartialScores;
use crate::chunk::{ChunkError, ChunkIndex, RegionFile, indexed_chunks, randomized_chunks};
use crate::config::PipelineConfig;
use crate::hwe::{HweEngine, HweError, passes_hwe};
use crate::prepare::{SampleList, SnpTable};
use crate::qc::{QcFilter, QcOutcome, QcThresholds};
use crate::source::{SourceLayout, VariantSource};
use crate::types::{
    Chunk, DropCounters, HweCounts, QcAnnotatedSnp, ScoreAccumulator, SnpKey, VariantRow,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::error::Error;
use std::io::IsTerminal;
use std::path::Path;

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());

    pb
}

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

/// A clonable, thread-safe error for everything that can go wrong once inputs are loaded.
#[derive(Debug, Clone)]
pub enum PipelineError {
    Compute(String),
    Io(String),
    /// A genotype query process failed to start, or exited unsuccessfully.
    Producer(String),
    /// Data that contradicts itself: a query line whose field count does not match
    /// the sample list, or a SNP outside every indexed interval.
    Integrity(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Compute(e) => write!(f, "{e}"),
            PipelineError::Io(e) => write!(f, "I/O error during pipeline execution: {e}"),
            PipelineError::Producer(e) => write!(f, "The genotype query failed: {e}"),
            PipelineError::Integrity(e) => write!(f, "Data integrity error: {e}"),
        }
    }
}
impl Error for PipelineError {}

impl From<ChunkError> for PipelineError {
    fn from(e: ChunkError) -> Self {
        match &e {
            ChunkError::Io(_) => PipelineError::Io(e.to_string()),
            _ => PipelineError::Integrity(e.to_string()),
        }
    }
}

impl From<HweError> for PipelineError {
    fn from(e: HweError) -> Self {
        PipelineError::Compute(format!("Hardy-Weinberg testing failed: {e}"))
    }
}

/// Everything a run reads but never mutates. Shared by reference across workers.
pub struct PipelineContext {
    pub snp_table: SnpTable,
    pub samples: SampleList,
    pub layout: SourceLayout,
    pub config: PipelineConfig,
    pub chunks: Vec<Chunk>,
}

impl PipelineContext {
    /// Partitions the SNP table into chunks. With `chunk_index_dir`, chunks follow the
    /// per-chromosome interval indices found there; otherwise they are randomized.
    pub fn new(
        snp_table: SnpTable,
        samples: SampleList,
        layout: SourceLayout,
        config: PipelineConfig,
        chunk_index_dir: Option<&Path>,
    ) -> Result<Self, PipelineError> {
        let chunks = match chunk_index_dir {
            Some(dir) => {
                let index = ChunkIndex::load_dir(dir, snp_table.chromosomes())?;
                indexed_chunks(&snp_table, &layout, &index)?
            }
            None => randomized_chunks(
                &snp_table,
                &layout,
                config.chunk_size,
                config.shuffle_seed,
            )?,
        };
        info!(
            "Partitioned {} SNPs into {} chunks",
            snp_table.len(),
            chunks.len()
        );
        Ok(Self {
            snp_table,
            samples,
            layout,
            config,
            chunks,
        })
    }
}

/// The merged result of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub accumulators: Vec<ScoreAccumulator>,
    pub counters: DropCounters,
}

/// Executes the entire concurrent compute pipeline.
///
/// Chunks run on a dedicated pool of `config.concurrency` threads. Every worker folds
/// its chunks into a private `(PartialScores, DropCounters)` pair, and the pairs are
/// summed once all chunks have finished. The first error aborts the run and no
/// partial result is returned.
pub fn run(
    context: &PipelineContext,
    source: &dyn VariantSource,
    hwe: &dyn HweEngine,
) -> Result<PipelineOutcome, PipelineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(context.config.concurrency)
        .thread_name(|index| format!("polyscore-chunk-{index}"))
        .build()
        .map_err(|e| PipelineError::Compute(format!("Failed to build the worker pool: {e}")))?;

    let num_samples = context.samples.len();
    let filter = QcFilter::new(QcThresholds::from(&context.config));
    let pb = create_progress_bar(context.chunks.len() as u64, "Scoring chunks...");
    let empty = || (PartialScores::new(num_samples), DropCounters::default());

    let folded = pool.install(|| {
        context
            .chunks
            .par_iter()
            .try_fold(empty, |(mut partial, mut counters), chunk| {
                process_chunk(
                    context,
                    &filter,
                    chunk,
                    source,
                    hwe,
                    &mut partial,
                    &mut counters,
                )?;
                pb.inc(1);
                Ok::<_, PipelineError>((partial, counters))
            })
            .try_reduce(empty, |(left, mut left_counters), (right, right_counters)| {
                left_counters += right_counters;
                Ok((left.merge(right), left_counters))
            })
    });

    let (partial, mut counters) = match folded {
        Ok(result) => result,
        Err(e) => {
            pb.abandon_with_message("Aborted.");
            return Err(e);
        }
    };
    pb.finish_with_message("Computation complete.");

    counters.total_snps = context.snp_table.len() as u64;
    Ok(PipelineOutcome {
        accumulators: partial.into_accumulators(&context.samples),
        counters,
    })
}

// ========================================================================================
//                                 Per-chunk processing
// ========================================================================================

/// Query, filter, test and fold one chunk.
fn process_chunk(
    context: &PipelineContext,
    filter: &QcFilter,
    chunk: &Chunk,
    source: &dyn VariantSource,
    hwe: &dyn HweEngine,
    partial: &mut PartialScores,
    counters: &mut DropCounters,
) -> Result<(), PipelineError> {
    let locator = &chunk.source_locator;
    if !locator.is_file() {
        if context.layout.missing_source_is_fatal() {
            return Err(PipelineError::Io(format!(
                "Genotype source '{}' does not exist",
                locator.display()
            )));
        }
        warn!(
            "Skipping {} SNPs: genotype source '{}' not found",
            chunk.len(),
            locator.display()
        );
        counters.chunks_skipped += 1;
        return Ok(());
    }

    let accepted = {
        let region = RegionFile::write(chunk, &context.snp_table)?;
        let mut accepted: Vec<QcAnnotatedSnp<'_>> = Vec::new();
        source.query(chunk, &region, &mut |row: &VariantRow<'_>| {
            // Region queries also return records that merely overlap a position, such
            // as a deletion starting one base earlier. Only this chunk's own keys count.
            let key = SnpKey::new(row.chromosome, row.position);
            let record = match chunk.snps.binary_search(&key) {
                Ok(_) => context.snp_table.get(&key),
                Err(_) => None,
            };
            let Some(record) = record else {
                counters.rows_without_snp += 1;
                return Ok(());
            };
            let outcome = filter.evaluate(record, row);
            outcome.count_drop(counters);
            if let QcOutcome::Accepted(snp) = outcome {
                accepted.push(snp);
            }
            Ok(())
        })?;
        accepted
    };

    let hwe_input: Vec<HweCounts> = accepted.iter().map(|snp| snp.hwe_counts).collect();
    let p_values = hwe.p_values(&hwe_input)?;
    if p_values.len() != accepted.len() {
        return Err(PipelineError::Integrity(format!(
            "HWE engine returned {} p-values for {} variants",
            p_values.len(),
            accepted.len()
        )));
    }

    for (snp, p_value) in accepted.iter().zip(p_values) {
        if passes_hwe(p_value, context.config.hwe_p_threshold) {
            partial.add_variant(snp);
            counters.qc_passed += 1;
        } else {
            counters.hwe_dropped += 1;
        }
    }
    debug!(
        "Chunk '{}' on {} ({} SNPs): {} variants scored",
        locator.display(),
        chunk.chromosome.as_deref().unwrap_or("mixed contigs"),
        chunk.len(),
        accepted.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwe::ExactHwe;
    use crate::source::RowSink;
    use crate::types::SnpRecord;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    /// Serves fixed rows for every chunk, ignoring the file contents.
    struct FixedRows(Vec<(u64, &'static str, &'static str, Vec<&'static str>)>);

    impl VariantSource for FixedRows {
        fn query(
            &self,
            chunk: &Chunk,
            _: &RegionFile,
            sink: &mut RowSink<'_>,
        ) -> Result<(), PipelineError> {
            for (position, reference, alternate, genotypes) in &self.0 {
                if !chunk.snps.iter().any(|key| key.position == *position) {
                    continue;
                }
                sink(&VariantRow {
                    chromosome: "chr1",
                    position: *position,
                    reference_allele: *reference,
                    alternate_allele: *alternate,
                    genotypes: genotypes.clone(),
                })?;
            }
            Ok(())
        }
    }

    struct AlwaysPasses;

    impl HweEngine for AlwaysPasses {
        fn p_values(&self, counts: &[HweCounts]) -> Result<Vec<f64>, HweError> {
            Ok(vec![1.0; counts.len()])
        }
    }

    fn two_snp_context(genotype_file: PathBuf) -> PipelineContext {
        let table = SnpTable::from_records([
            SnpRecord {
                chromosome: "chr1".into(),
                position: 100,
                effect_allele: "G".into(),
                reference_allele: "A".into(),
                weight: 1.5,
            },
            SnpRecord {
                chromosome: "chr1".into(),
                position: 200,
                effect_allele: "T".into(),
                reference_allele: "C".into(),
                weight: -0.5,
            },
        ]);
        let samples = SampleList::from_ids(vec!["s1".into(), "s2".into()]).unwrap();
        let config = PipelineConfig {
            maf_filter: false,
            max_missing_rate: 0.6,
            chunk_size: 1,
            concurrency: 2,
            shuffle_seed: Some(3),
            ..Default::default()
        };
        PipelineContext::new(table, samples, SourceLayout::Single(genotype_file), config, None)
            .unwrap()
    }

    #[test]
    fn two_snp_scores_include_the_imputed_missing_call() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let context = two_snp_context(file.path().to_path_buf());
        let source = FixedRows(vec![
            (100, "A", "G", vec!["0/1", "1/1"]),
            (200, "C", "T", vec!["0/0", "."]),
        ]);
        let outcome = run(&context, &source, &AlwaysPasses).unwrap();

        // chr1:200 frequency from the one called sample is 0, so the imputation adds 0.
        let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
        assert_relative_eq!(scores[0], 1.5);
        assert_relative_eq!(scores[1], 3.0);
        assert_eq!(outcome.accumulators[1].effect_allele_count, 2.0);
        assert_eq!(outcome.counters.total_snps, 2);
        assert_eq!(outcome.counters.qc_passed, 2);
    }

    #[test]
    fn hwe_failures_are_counted_and_excluded() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut context = two_snp_context(file.path().to_path_buf());
        context.config.hwe_p_threshold = 1e-6;
        let fifty_fifty: Vec<&'static str> = [vec!["0/0"; 50], vec!["1/1"; 50]].concat();
        let samples: Vec<String> = (0..100).map(|i| format!("s{i}")).collect();
        context.samples = SampleList::from_ids(samples).unwrap();
        let source = FixedRows(vec![(100, "A", "G", fifty_fifty)]);

        let outcome = run(&context, &source, &ExactHwe).unwrap();
        assert_eq!(outcome.counters.hwe_dropped, 1);
        assert_eq!(outcome.counters.qc_passed, 0);
        assert!(outcome.accumulators.iter().all(|a| a.score == 0.0));
    }

    #[test]
    fn missing_single_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let context = two_snp_context(dir.path().join("absent.vcf.gz"));
        let result = run(&context, &FixedRows(Vec::new()), &AlwaysPasses);
        assert!(matches!(result, Err(PipelineError::Io(_))));
    }

    #[test]
    fn rows_for_unknown_positions_are_counted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let context = two_snp_context(file.path().to_path_buf());

        struct Stray;
        impl VariantSource for Stray {
            fn query(
                &self,
                _: &Chunk,
                _: &RegionFile,
                sink: &mut RowSink<'_>,
            ) -> Result<(), PipelineError> {
                sink(&VariantRow {
                    chromosome: "1",
                    position: 150,
                    reference_allele: "A",
                    alternate_allele: "AT",
                    genotypes: vec!["0/1", "0/0"],
                })
            }
        }

        let outcome = run(&context, &Stray, &AlwaysPasses).unwrap();
        assert_eq!(outcome.counters.rows_without_snp, 2);
        assert_eq!(outcome.counters.qc_passed, 0);
    }

    #[test]
    fn rows_belonging_to_another_chunk_are_not_folded_twice() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let context = two_snp_context(file.path().to_path_buf());
        assert_eq!(context.chunks.len(), 2);

        // Every query returns both rows, the way an overlapping region hit would.
        struct Overlapping;
        impl VariantSource for Overlapping {
            fn query(
                &self,
                _: &Chunk,
                _: &RegionFile,
                sink: &mut RowSink<'_>,
            ) -> Result<(), PipelineError> {
                sink(&VariantRow {
                    chromosome: "chr1",
                    position: 100,
                    reference_allele: "A",
                    alternate_allele: "G",
                    genotypes: vec!["0/1", "1/1"],
                })?;
                sink(&VariantRow {
                    chromosome: "chr1",
                    position: 200,
                    reference_allele: "C",
                    alternate_allele: "T",
                    genotypes: vec!["0/0", "0/1"],
                })
            }
        }

        let outcome = run(&context, &Overlapping, &AlwaysPasses).unwrap();
        assert_eq!(outcome.counters.qc_passed, 2);
        assert_eq!(outcome.counters.rows_without_snp, 2);
        let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
        assert_relative_eq!(scores[0], 1.5);
        assert_relative_eq!(scores[1], 2.5);
    }
}
