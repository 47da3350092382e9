use std::fs;
use std::io::Write;
use std::path::Path;

use approx::assert_relative_eq;
use flate2::Compression;
use flate2::write::GzEncoder;
use polyscore::config::PipelineConfig;
use polyscore::hwe::ExactHwe;
use polyscore::pipeline::{self, PipelineContext, PipelineOutcome};
use polyscore::prepare::{SampleList, SnpTable};
use polyscore::source::{SourceLayout, VcfScan};
use tempfile::tempdir;

const HEADER: &str = "##fileformat=VCFv4.2\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\ts3\n";

const CHR1_ROWS: &str = "chr1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/1\t1/1\t0/0\n\
chr1\t150\t.\tA\tC\t.\tPASS\t.\tGT\t0/1\t0/1\t0/1\n\
chr1\t200\t.\tC\tT\t.\tPASS\t.\tGT\t0|1\t.\t1|1\n";

const CHR2_ROWS: &str = "chr2\t500\t.\tG\tA\t.\tPASS\t.\tGT\t1/1\t0/1\t0/0\n";

fn write_gzip(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).expect("compress fixture");
    fs::write(path, encoder.finish().expect("finish gzip")).expect("write fixture");
}

fn weights(dir: &Path, text: &str) -> SnpTable {
    let path = dir.join("weights.tsv");
    fs::write(&path, text).expect("write weights");
    SnpTable::load(&path).expect("load weights")
}

fn lenient_config() -> PipelineConfig {
    PipelineConfig {
        max_missing_rate: 0.5,
        chunk_size: 1,
        concurrency: 3,
        shuffle_seed: Some(11),
        ..Default::default()
    }
}

fn run(table: SnpTable, layout: SourceLayout) -> PipelineOutcome {
    let samples =
        SampleList::from_ids(vec!["s1".into(), "s2".into(), "s3".into()]).expect("samples");
    let source = VcfScan::new(&samples);
    let context = PipelineContext::new(table, samples, layout, lenient_config(), None)
        .expect("plan chunks");
    pipeline::run(&context, &source, &ExactHwe).expect("pipeline run")
}

#[test]
fn two_snps_score_with_mean_imputation() {
    let tmp = tempdir().expect("temporary directory");
    let vcf = tmp.path().join("cohort.vcf.gz");
    write_gzip(&vcf, &format!("{HEADER}{CHR1_ROWS}"));
    let table = weights(tmp.path(), "chr1\t100\tG\tA\t1.5\n1\t200\tT\tC\t-0.5\n");

    let outcome = run(table, SourceLayout::Single(vcf));

    // chr1:200 has effect-allele frequency 3/4 among called samples, so the missing
    // call of s2 is imputed as 2 * 0.75 * -0.5.
    let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
    assert_relative_eq!(scores[0], 1.0);
    assert_relative_eq!(scores[1], 2.25);
    assert_relative_eq!(scores[2], -1.0);
    let counts: Vec<f64> = outcome
        .accumulators
        .iter()
        .map(|a| a.effect_allele_count)
        .collect();
    assert_eq!(counts, vec![2.0, 2.0, 2.0]);
    assert_eq!(outcome.counters.total_snps, 2);
    assert_eq!(outcome.counters.qc_passed, 2);
}

#[test]
fn allele_mismatch_never_reaches_a_score() {
    let tmp = tempdir().expect("temporary directory");
    let vcf = tmp.path().join("cohort.vcf.gz");
    write_gzip(&vcf, &format!("{HEADER}{CHR1_ROWS}"));
    let table = weights(tmp.path(), "chr1\t100\tG\tA\t1.5\nchr1\t150\tT\tG\t10.0\n");

    let outcome = run(table, SourceLayout::Single(vcf));
    assert_eq!(outcome.counters.allele_mismatch_dropped, 1);
    assert_eq!(outcome.counters.qc_passed, 1);
    let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
    assert_eq!(scores, vec![1.5, 3.0, 0.0]);
}

#[test]
fn split_multiallelic_site_scores_only_the_matching_pair() {
    let tmp = tempdir().expect("temporary directory");
    let vcf = tmp.path().join("cohort.vcf.gz");
    let split_rows = "chr1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/1\t0/0\t0/0\n\
chr1\t100\t.\tA\tT\t.\tPASS\t.\tGT\t0/0\t0/1\t0/0\n";
    write_gzip(&vcf, &format!("{HEADER}{split_rows}"));
    let table = weights(tmp.path(), "chr1\t100\tA\tG\t1.0\n");

    let outcome = run(table, SourceLayout::Single(vcf));
    assert_eq!(outcome.counters.qc_passed, 1);
    assert_eq!(outcome.counters.allele_mismatch_dropped, 1);
    let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
    assert_eq!(scores, vec![1.0, 2.0, 2.0]);
    let counts: Vec<f64> = outcome
        .accumulators
        .iter()
        .map(|a| a.effect_allele_count)
        .collect();
    assert_eq!(counts, vec![1.0, 2.0, 2.0]);
}

#[test]
fn missing_chromosome_file_is_skipped_without_touching_other_scores() {
    let tmp = tempdir().expect("temporary directory");
    let root = tmp.path().join("split");
    write_gzip(&root.join("chr1").join("1.vcf.gz"), &format!("{HEADER}{CHR1_ROWS}"));

    let chr1_only = weights(tmp.path(), "chr1\t100\tG\tA\t1.5\nchr1\t200\tT\tC\t-0.5\n");
    let baseline = run(chr1_only, SourceLayout::PerChromosome(root.clone()));

    let with_chr2 = weights(
        tmp.path(),
        "chr1\t100\tG\tA\t1.5\nchr1\t200\tT\tC\t-0.5\nchr2\t500\tA\tG\t4.0\n",
    );
    let outcome = run(with_chr2, SourceLayout::PerChromosome(root));

    assert_eq!(outcome.accumulators, baseline.accumulators);
    assert_eq!(outcome.counters.chunks_skipped, 1);
    assert_eq!(outcome.counters.total_snps, 3);
    assert_eq!(outcome.counters.qc_passed, 2);
}

#[test]
fn present_second_chromosome_adds_its_contribution() {
    let tmp = tempdir().expect("temporary directory");
    let root = tmp.path().join("split");
    write_gzip(&root.join("chr1").join("1.vcf.gz"), &format!("{HEADER}{CHR1_ROWS}"));
    write_gzip(&root.join("chr2").join("2.vcf.gz"), &format!("{HEADER}{CHR2_ROWS}"));
    let table = weights(
        tmp.path(),
        "chr1\t100\tG\tA\t1.5\nchr1\t200\tT\tC\t-0.5\nchr2\t500\tA\tG\t4.0\n",
    );

    let outcome = run(table, SourceLayout::PerChromosome(root));
    let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
    assert_relative_eq!(scores[0], 9.0);
    assert_relative_eq!(scores[1], 6.25);
    assert_relative_eq!(scores[2], -1.0);
    assert_eq!(outcome.counters.chunks_skipped, 0);
}

#[test]
fn indexed_chunks_read_their_own_files() {
    let tmp = tempdir().expect("temporary directory");
    let root = tmp.path().join("chunked");
    let chunk_dir = root.join("chr1").join("chunk");
    write_gzip(
        &chunk_dir.join("vcfchunk.chr1.1.final.vcf.gz"),
        &format!("{HEADER}{}", CHR1_ROWS.lines().next().unwrap_or_default()),
    );
    write_gzip(
        &chunk_dir.join("vcfchunk.chr1.2.final.vcf.gz"),
        &format!("{HEADER}{}\n", CHR1_ROWS.lines().nth(2).unwrap_or_default()),
    );
    let index_dir = tmp.path().join("index");
    fs::create_dir_all(&index_dir).expect("index directory");
    fs::write(index_dir.join("chr1.txt"), "1\t1\t150\n2\t151\t300\n").expect("write index");

    let table = weights(tmp.path(), "chr1\t100\tG\tA\t1.5\nchr1\t200\tT\tC\t-0.5\n");
    let samples =
        SampleList::from_ids(vec!["s1".into(), "s2".into(), "s3".into()]).expect("samples");
    let source = VcfScan::new(&samples);
    let context = PipelineContext::new(
        table,
        samples,
        SourceLayout::PerChunk(root),
        lenient_config(),
        Some(&index_dir),
    )
    .expect("plan chunks");
    assert_eq!(context.chunks.len(), 2);

    let outcome = pipeline::run(&context, &source, &ExactHwe).expect("pipeline run");
    let scores: Vec<f64> = outcome.accumulators.iter().map(|a| a.score).collect();
    assert_relative_eq!(scores[0], 1.0);
    assert_relative_eq!(scores[1], 2.25);
    assert_relative_eq!(scores[2], -1.0);
}
