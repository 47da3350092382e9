// ========================================================================================
//
//                       Chunking: bounding the work of one query
//
// ========================================================================================
//
// The weight table is partitioned into chunks so that one external query never has
// to materialize more than a bounded genotype matrix, and so that chunks can run
// side by side on the worker pool. Two strategies exist:
//
// 1.  Randomized fixed-size chunks. Keys are shuffled before splitting, so a chunk
//     samples the genome evenly instead of piling onto one dense region.
// 2.  Index-driven chunks. When genotypes are stored pre-split into genomic intervals,
//     each SNP goes to the interval file that contains it.
//
// Either way every SNP lands in exactly one chunk and empty chunks never exist.

use crate::io::open_text_reader;
use crate::prepare::{ChromosomeSnps, SnpTable};
use crate::source::SourceLayout;
use crate::types::{Chunk, SnpKey, normalize_chromosome};
use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("I/O error while preparing chunks: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid chunk index '{path}' on line {line}: {message}")]
    IndexParse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error(
        "SNP {chromosome}:{position} is not covered by any interval of the chunk index. Every SNP must fall inside a recorded chunk."
    )]
    Uncovered { chromosome: String, position: u64 },
    #[error("The per-chunk genotype layout requires a chunk index (--chunk-index-dir).")]
    IndexRequired,
}

/// One `(label, start, stop)` interval of a chromosome's chunk index. Both ends inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInterval {
    pub label: String,
    pub start: u64,
    pub stop: u64,
}

/// Pre-computed genomic intervals per chromosome, keyed by normalized chromosome.
#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    intervals: AHashMap<String, Vec<ChunkInterval>>,
}

impl ChunkIndex {
    /// Loads `<dir>/chr<chromosome>.txt` for every chromosome of the weight table.
    /// A chromosome without an index file simply has no intervals.
    pub fn load_dir(dir: &Path, chromosomes: &[ChromosomeSnps]) -> Result<Self, ChunkError> {
        let mut index = Self::default();
        for chromosome in chromosomes {
            let normalized = normalize_chromosome(&chromosome.label);
            let path = dir.join(format!("chr{normalized}.txt"));
            if !path.is_file() {
                log::debug!("No chunk index for chromosome {normalized} at {}", path.display());
                continue;
            }
            index.insert(normalized, Self::read_intervals(&path)?);
        }
        Ok(index)
    }

    fn read_intervals(path: &Path) -> Result<Vec<ChunkInterval>, ChunkError> {
        let reader = open_text_reader(path).map_err(|e| ChunkError::IndexParse {
            path: path.to_path_buf(),
            line: 0,
            message: e.to_string(),
        })?;
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut intervals = Vec::new();
        for (index, record) in csv_reader.records().enumerate() {
            let parse_error = |message: String| ChunkError::IndexParse {
                path: path.to_path_buf(),
                line: index + 1,
                message,
            };
            let record = record.map_err(|e| parse_error(e.to_string()))?;
            if record.len() < 3 {
                return Err(parse_error(format!(
                    "expected 'chunkLabel<TAB>startPos<TAB>stopPos', found {} field(s)",
                    record.len()
                )));
            }
            let bound = |field: usize| -> Result<u64, ChunkError> {
                record[field]
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| parse_error(format!("invalid coordinate '{}'", &record[field])))
            };
            let (start, stop) = (bound(1)?, bound(2)?);
            if stop < start {
                return Err(parse_error(format!("interval {start}-{stop} ends before it starts")));
            }
            intervals.push(ChunkInterval {
                label: record[0].trim().to_string(),
                start,
                stop,
            });
        }
        Ok(intervals)
    }

    pub fn insert(&mut self, chromosome: &str, mut intervals: Vec<ChunkInterval>) {
        intervals.sort_by_key(|interval| interval.start);
        self.intervals
            .insert(normalize_chromosome(chromosome).to_string(), intervals);
    }

    /// The interval containing `position`, if any.
    pub fn locate(&self, chromosome: &str, position: u64) -> Option<&ChunkInterval> {
        let intervals = self.intervals.get(normalize_chromosome(chromosome))?;
        let candidates = intervals.partition_point(|interval| interval.start <= position);
        intervals[..candidates]
            .iter()
            .rev()
            .find(|interval| interval.stop >= position)
    }
}

// ========================================================================================
//                                  Chunk construction
// ========================================================================================

/// Splits the table into shuffled chunks of at most `chunk_size` SNPs.
///
/// In the single-file layout the shuffle spans the whole table. In the per-chromosome
/// layout each chunk must map to one file, so the shuffle happens within a chromosome.
pub fn randomized_chunks(
    table: &SnpTable,
    layout: &SourceLayout,
    chunk_size: usize,
    seed: Option<u64>,
) -> Result<Vec<Chunk>, ChunkError> {
    let chunk_size = chunk_size.max(1);
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut chunks = Vec::new();
    match layout {
        SourceLayout::Single(path) => {
            let mut keys: Vec<SnpKey> = table.keys().cloned().collect();
            // Hash-map order is not stable across runs, so sort before a seeded shuffle.
            keys.sort();
            keys.shuffle(&mut rng);
            for piece in keys.chunks(chunk_size) {
                chunks.push(freeze(None, path.clone(), piece.to_vec()));
            }
        }
        SourceLayout::PerChromosome(_) => {
            for chromosome in table.chromosomes() {
                let mut keys: Vec<SnpKey> = chromosome
                    .positions
                    .iter()
                    .map(|&position| SnpKey::new(&chromosome.label, position))
                    .collect();
                keys.shuffle(&mut rng);
                let locator = layout.chromosome_path(&chromosome.label);
                for piece in keys.chunks(chunk_size) {
                    chunks.push(freeze(
                        Some(chromosome.label.clone()),
                        locator.clone(),
                        piece.to_vec(),
                    ));
                }
            }
        }
        SourceLayout::PerChunk(_) => return Err(ChunkError::IndexRequired),
    }
    Ok(chunks)
}

/// Assigns every SNP to the index interval containing it. A SNP outside every
/// recorded interval is fatal.
pub fn indexed_chunks(
    table: &SnpTable,
    layout: &SourceLayout,
    index: &ChunkIndex,
) -> Result<Vec<Chunk>, ChunkError> {
    let mut chunks = Vec::new();
    for chromosome in table.chromosomes() {
        // Keyed by interval start so chunks come out in genomic order.
        let mut assigned: BTreeMap<(u64, &str), Vec<SnpKey>> = BTreeMap::new();
        for &position in &chromosome.positions {
            let interval = index.locate(&chromosome.label, position).ok_or_else(|| {
                ChunkError::Uncovered {
                    chromosome: chromosome.label.clone(),
                    position,
                }
            })?;
            assigned
                .entry((interval.start, interval.label.as_str()))
                .or_default()
                .push(SnpKey::new(&chromosome.label, position));
        }

        for ((_, label), keys) in assigned {
            let locator = layout.chunk_path(&chromosome.label, label);
            chunks.push(freeze(Some(chromosome.label.clone()), locator, keys));
        }
    }
    Ok(chunks)
}

fn freeze(chromosome: Option<String>, source_locator: PathBuf, mut snps: Vec<SnpKey>) -> Chunk {
    snps.sort();
    Chunk {
        chromosome,
        source_locator,
        snps,
    }
}

// ========================================================================================
//                                  Scoped region files
// ========================================================================================

/// The `CHROM<TAB>POS` list of one chunk, handed to the query tool. The file lives
/// exactly as long as this value: dropping it deletes the file on every exit path.
#[derive(Debug)]
pub struct RegionFile {
    file: NamedTempFile,
}

impl RegionFile {
    pub fn write(chunk: &Chunk, table: &SnpTable) -> Result<Self, ChunkError> {
        let mut file = tempfile::Builder::new()
            .prefix("polyscore-regions-")
            .suffix(".tsv")
            .tempfile()?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            for key in &chunk.snps {
                // The weight file's own label is what the genotype file is expected to use.
                let label = table
                    .get(key)
                    .map_or(key.chromosome.as_str(), |record| record.chromosome.as_str());
                writeln!(writer, "{label}\t{}", key.position)?;
            }
            writer.flush()?;
        }
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
