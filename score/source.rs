// ========================================================================================
//
//                    Variant sources: genotype rows for one chunk
//
// ========================================================================================
//
// A variant source turns a chunk (its genotype file and its SNP positions) into a
// stream of `VariantRow`s with one genotype string per requested sample, in sample
// order. Rows are handed to a sink one at a time straight off the read buffer, so a
// chunk's genotype matrix is never held in memory.
//
// Two implementations exist. `BcftoolsQuery` drives an indexed region query in a
// child process. `VcfScan` decodes the VCF in-process with noodles and needs no
// external tooling.

use crate::chunk::RegionFile;
use crate::io::open_text_reader;
use crate::pipeline::PipelineError;
use crate::prepare::SampleList;
use crate::types::{Chunk, VariantRow, normalize_chromosome};
use ahash::{AHashMap, AHashSet};
use noodles::vcf::{
    self as vcf,
    variant::RecordBuf,
    variant::record::samples::keys::key,
    variant::record_buf::samples::sample::{Value, value::genotype::Allele},
};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tempfile::NamedTempFile;

/// The output format requested from `bcftools query`. bcftools expands the `\n` itself.
pub const QUERY_FORMAT: &str = "%CHROM %POS %REF %ALT [%GT ]\\n";

/// Number of leading fields before the genotypes in a query line.
const QUERY_FIXED_FIELDS: usize = 4;

/// Where genotype files live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLayout {
    /// One file holding every chromosome.
    Single(PathBuf),
    /// `<dir>/chr<chr>/<chr>.vcf.gz`.
    PerChromosome(PathBuf),
    /// `<dir>/chr<chr>/chunk/vcfchunk.chr<chr>.<idx>.final.vcf.gz`.
    PerChunk(PathBuf),
}

impl SourceLayout {
    pub fn chromosome_path(&self, chromosome: &str) -> PathBuf {
        let chromosome = normalize_chromosome(chromosome);
        match self {
            SourceLayout::Single(path) => path.clone(),
            SourceLayout::PerChromosome(dir) | SourceLayout::PerChunk(dir) => dir
                .join(format!("chr{chromosome}"))
                .join(format!("{chromosome}.vcf.gz")),
        }
    }

    pub fn chunk_path(&self, chromosome: &str, chunk_label: &str) -> PathBuf {
        match self {
            SourceLayout::PerChunk(dir) => {
                let chromosome = normalize_chromosome(chromosome);
                dir.join(format!("chr{chromosome}"))
                    .join("chunk")
                    .join(format!("vcfchunk.chr{chromosome}.{chunk_label}.final.vcf.gz"))
            }
            _ => self.chromosome_path(chromosome),
        }
    }

    /// Only a single-file run has nothing to fall back on when its file is absent.
    /// Split layouts treat a missing file as a contig without data.
    pub fn missing_source_is_fatal(&self) -> bool {
        matches!(self, SourceLayout::Single(_))
    }
}

/// Receives rows in emission order. An error from the sink stops the query.
pub type RowSink<'s> = dyn FnMut(&VariantRow<'_>) -> Result<(), PipelineError> + 's;

pub trait VariantSource: Send + Sync {
    /// Streams every row the source produces for `chunk`, restricted to the positions
    /// listed in `region`, into `sink`.
    fn query(
        &self,
        chunk: &Chunk,
        region: &RegionFile,
        sink: &mut RowSink<'_>,
    ) -> Result<(), PipelineError>;
}

/// Splits one query line into a row. The field count must be exactly the fixed
/// columns plus one genotype per sample; anything else means the sample list and
/// the file header disagree.
pub fn parse_query_line(line: &str, sample_count: usize) -> Result<VariantRow<'_>, PipelineError> {
    let mut fields = line.split_ascii_whitespace();
    let (Some(chromosome), Some(position), Some(reference_allele), Some(alternate_allele)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(PipelineError::Integrity(format!(
            "Query line has fewer than {QUERY_FIXED_FIELDS} fields: '{line}'"
        )));
    };
    let genotypes: Vec<&str> = fields.collect();
    if genotypes.len() != sample_count {
        return Err(PipelineError::Integrity(format!(
            "Query line for {chromosome}:{position} has {} fields, expected {} ({} samples). The sample list and the genotype file header are out of sync.",
            QUERY_FIXED_FIELDS + genotypes.len(),
            QUERY_FIXED_FIELDS + sample_count,
            sample_count
        )));
    }
    let position = position.parse::<u64>().map_err(|_| {
        PipelineError::Integrity(format!(
            "Query line for {chromosome} has an invalid position '{position}'"
        ))
    })?;
    Ok(VariantRow {
        chromosome,
        position,
        reference_allele,
        alternate_allele,
        genotypes,
    })
}

// ========================================================================================
//                               External indexed query
// ========================================================================================

/// Runs `bcftools query` once per chunk and streams its stdout.
#[derive(Debug)]
pub struct BcftoolsQuery {
    program: PathBuf,
    /// The sample subset, one ID per line, passed with `-S`.
    sample_file: NamedTempFile,
    sample_count: usize,
}

impl BcftoolsQuery {
    pub fn new(program: &Path, samples: &SampleList) -> Result<Self, PipelineError> {
        let io_error = |e: std::io::Error| {
            PipelineError::Io(format!("Failed to write the temporary sample file: {e}"))
        };
        let mut sample_file = tempfile::Builder::new()
            .prefix("polyscore-samples-")
            .suffix(".txt")
            .tempfile()
            .map_err(io_error)?;
        {
            let mut writer = BufWriter::new(sample_file.as_file_mut());
            for id in samples.ids() {
                writeln!(writer, "{id}").map_err(io_error)?;
            }
            writer.flush().map_err(io_error)?;
        }
        Ok(Self {
            program: program.to_path_buf(),
            sample_file,
            sample_count: samples.len(),
        })
    }

    fn spawn(&self, chunk: &Chunk, region: &RegionFile) -> Result<Child, PipelineError> {
        Command::new(&self.program)
            .arg("query")
            .arg("-R")
            .arg(region.path())
            .arg("-f")
            .arg(QUERY_FORMAT)
            .arg("-S")
            .arg(self.sample_file.path())
            .arg(&chunk.source_locator)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PipelineError::Producer(format!(
                    "Failed to start '{}': {e}",
                    self.program.display()
                ))
            })
    }
}

impl VariantSource for BcftoolsQuery {
    fn query(
        &self,
        chunk: &Chunk,
        region: &RegionFile,
        sink: &mut RowSink<'_>,
    ) -> Result<(), PipelineError> {
        let mut child = self.spawn(chunk, region)?;
        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(PipelineError::Producer(
                "bcftools stdout was not captured".to_string(),
            ));
        };

        if let Err(e) = stream_query_output(BufReader::new(stdout), self.sample_count, sink) {
            reap(&mut child);
            return Err(e);
        }

        let status = child
            .wait()
            .map_err(|e| PipelineError::Producer(format!("Waiting for bcftools: {e}")))?;
        if !status.success() {
            return Err(PipelineError::Producer(format!(
                "bcftools query on '{}' exited unsuccessfully ({status})",
                chunk.source_locator.display()
            )));
        }
        Ok(())
    }
}

fn stream_query_output(
    mut reader: impl BufRead,
    sample_count: usize,
    sink: &mut RowSink<'_>,
) -> Result<(), PipelineError> {
    let mut line = String::with_capacity(4096);
    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .map_err(|e| PipelineError::Io(format!("Reading bcftools output: {e}")))?;
        if bytes_read == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let row = parse_query_line(trimmed, sample_count)?;
        sink(&row)?;
    }
}

/// Kills a child that is no longer being read and collects its exit status.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Child process already exited: {e}");
    }
    if let Err(e) = child.wait() {
        log::warn!("Could not reap child process: {e}");
    }
}

// ========================================================================================
//                                  In-process VCF reader
// ========================================================================================

/// Scans a plain, gzip or BGZF VCF without any index and emits the records at the
/// chunk's positions. Sample columns are selected by header name.
#[derive(Debug, Clone)]
pub struct VcfScan {
    sample_ids: Vec<String>,
}

impl VcfScan {
    pub fn new(samples: &SampleList) -> Self {
        Self {
            sample_ids: samples.ids().to_vec(),
        }
    }

    /// Header positions of the requested samples, in sample-list order.
    fn sample_columns(
        &self,
        header: &vcf::Header,
        path: &Path,
    ) -> Result<Vec<usize>, PipelineError> {
        let columns: AHashMap<&str, usize> = header
            .sample_names()
            .iter()
            .enumerate()
            .map(|(index, name)| (name.as_str(), index))
            .collect();
        self.sample_ids
            .iter()
            .map(|id| {
                columns.get(id.as_str()).copied().ok_or_else(|| {
                    PipelineError::Integrity(format!(
                        "Sample '{id}' is not present in the header of '{}'",
                        path.display()
                    ))
                })
            })
            .collect()
    }
}

impl VariantSource for VcfScan {
    fn query(
        &self,
        chunk: &Chunk,
        _: &RegionFile,
        sink: &mut RowSink<'_>,
    ) -> Result<(), PipelineError> {
        let path = chunk.source_locator.as_path();
        let mut wanted: AHashMap<&str, AHashSet<u64>> = AHashMap::new();
        for key in &chunk.snps {
            wanted
                .entry(key.chromosome.as_str())
                .or_default()
                .insert(key.position);
        }

        let mut reader = vcf::io::Reader::new(open_text_reader(path)?);
        let header = reader
            .read_header()
            .map_err(|e| vcf_read_error(path, "header", e))?;
        let columns = self.sample_columns(&header, path)?;

        let mut record = RecordBuf::default();
        let mut genotypes: Vec<String> = Vec::with_capacity(columns.len());
        loop {
            let bytes_read = reader
                .read_record_buf(&header, &mut record)
                .map_err(|e| vcf_read_error(path, "record", e))?;
            if bytes_read == 0 {
                break;
            }

            let chromosome = record.reference_sequence_name();
            let Some(start) = record.variant_start() else {
                return Err(PipelineError::Integrity(format!(
                    "A record on {chromosome} in '{}' has no position",
                    path.display()
                )));
            };
            let position = usize::from(start) as u64;
            let is_wanted = wanted
                .get(normalize_chromosome(chromosome))
                .is_some_and(|positions| positions.contains(&position));
            if !is_wanted {
                continue;
            }

            let alternates: &[String] = record.alternate_bases().as_ref();
            let alternate_allele = match alternates {
                [] => ".".to_string(),
                [single] => single.clone(),
                many => many.join(","),
            };

            genotypes.clear();
            let series = record.samples().select(key::GENOTYPE);
            for &column in &columns {
                let value = series.as_ref().and_then(|series| series.get(column)).flatten();
                genotypes.push(genotype_text(value));
            }

            let row = VariantRow {
                chromosome,
                position,
                reference_allele: record.reference_bases(),
                alternate_allele: &alternate_allele,
                genotypes: genotypes.iter().map(String::as_str).collect(),
            };
            sink(&row)?;
        }
        Ok(())
    }
}

/// Renders a decoded GT value back into the `a/b` form the QC stage reads.
/// An absent or missing value becomes `.`.
fn genotype_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Genotype(genotype)) => {
            let alleles: &[Allele] = genotype.as_ref();
            let codes: Vec<String> = alleles
                .iter()
                .map(|allele| match allele.position() {
                    Some(position) => position.to_string(),
                    None => ".".to_string(),
                })
                .collect();
            if codes.is_empty() {
                ".".to_string()
            } else {
                codes.join("/")
            }
        }
        Some(Value::String(text)) => text.clone(),
        _ => ".".to_string(),
    }
}

fn vcf_read_error(path: &Path, what: &str, e: std::io::Error) -> PipelineError {
    let message = format!("Reading a VCF {what} from '{}': {e}", path.display());
    match e.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            PipelineError::Integrity(message)
        }
        _ => PipelineError::Io(message),
    }
}
