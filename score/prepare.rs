// ========================================================================================
//
//               The preparation phase: weight table and sample loading
//
// ========================================================================================
//
// This module turns the raw user inputs into the immutable, in-memory structures the
// pipeline joins against. The weight table is bounded by the number of SNPs, never by
// the genotype matrix, so it is loaded fully up front. Any malformed input aborts the
// run here, before a single external query is launched.

use crate::io::{open_text_reader, open_text_source};
use crate::pipeline::PipelineError;
use crate::types::{SnpKey, SnpRecord};
use ahash::{AHashMap, AHashSet};
use log::warn;
use natord::compare;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

/// The number of fields in every weight-table line.
const SNP_TABLE_FIELDS: usize = 5;

// ========================================================================================
//                                  Weight table
// ========================================================================================

/// All positions of one chromosome, used to build chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromosomeSnps {
    /// The label as written in the weight file.
    pub label: String,
    /// Sorted, unique.
    pub positions: Vec<u64>,
}

/// The weighted SNP list, indexed for O(1) lookup by `chromosome.position`.
#[derive(Debug, Clone)]
pub struct SnpTable {
    records: AHashMap<SnpKey, SnpRecord>,
    chromosomes: Vec<ChromosomeSnps>,
    duplicates: usize,
}

impl SnpTable {
    /// Parses a headerless, tab-delimited `chromosome, position, effect allele,
    /// reference allele, weight` file. Any malformed line fails the whole load.
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        let mut source = open_text_source(path).map_err(|e| map_pipeline_error(e, path))?;
        let mut records = Vec::new();
        let mut line_number = 0usize;

        while let Some(raw_line) = source
            .next_line()
            .map_err(|e| map_pipeline_error(e, path))?
        {
            line_number += 1;
            let line = std::str::from_utf8(raw_line).map_err(|e| PrepError::Parse {
                path: path.to_path_buf(),
                line: line_number,
                message: format!("line is not valid UTF-8: {e}"),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = parse_snp_line(line).map_err(|message| PrepError::Parse {
                path: path.to_path_buf(),
                line: line_number,
                message,
            })?;
            records.push(record);
        }

        if records.is_empty() {
            return Err(PrepError::Empty(format!(
                "SNP weight file '{}' contains no records.",
                path.display()
            )));
        }

        let table = Self::from_records(records);
        if table.duplicates > 0 {
            warn!(
                "{} duplicate chromosome/position entries in '{}'; the last occurrence of each was kept.",
                table.duplicates,
                path.display()
            );
        }
        Ok(table)
    }

    /// Builds the table from parsed records. A later record with the same key
    /// replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = SnpRecord>) -> Self {
        let mut map: AHashMap<SnpKey, SnpRecord> = AHashMap::new();
        let mut duplicates = 0usize;
        for record in records {
            if map.insert(record.key(), record).is_some() {
                duplicates += 1;
            }
        }

        let mut grouped: AHashMap<&str, ChromosomeSnps> = AHashMap::new();
        for (key, record) in &map {
            grouped
                .entry(key.chromosome.as_str())
                .or_insert_with(|| ChromosomeSnps {
                    label: record.chromosome.clone(),
                    positions: Vec::new(),
                })
                .positions
                .push(key.position);
        }
        let mut chromosomes: Vec<(&str, ChromosomeSnps)> = grouped.into_iter().collect();
        chromosomes.sort_by(|a, b| compare(a.0, b.0));
        let chromosomes = chromosomes
            .into_iter()
            .map(|(_, mut group)| {
                group.positions.sort_unstable();
                group
            })
            .collect();

        Self {
            records: map,
            chromosomes,
            duplicates,
        }
    }

    #[inline]
    pub fn get(&self, key: &SnpKey) -> Option<&SnpRecord> {
        self.records.get(key)
    }

    /// The number of unique SNPs.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// How many input lines were shadowed by a later line with the same key.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Per-chromosome position lists in natural chromosome order.
    pub fn chromosomes(&self) -> &[ChromosomeSnps] {
        &self.chromosomes
    }

    pub fn keys(&self) -> impl Iterator<Item = &SnpKey> {
        self.records.keys()
    }
}

fn parse_snp_line(line: &str) -> Result<SnpRecord, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != SNP_TABLE_FIELDS {
        return Err(format!(
            "expected {SNP_TABLE_FIELDS} tab-separated fields, found {}",
            fields.len()
        ));
    }

    let chromosome = fields[0].trim();
    if chromosome.is_empty() {
        return Err("chromosome is empty".to_string());
    }
    let position: u64 = match fields[1].trim().parse() {
        Ok(value) if value > 0 => value,
        Ok(_) => return Err("position must be a positive 1-based coordinate".to_string()),
        Err(_) => return Err(format!("invalid position '{}'", fields[1].trim())),
    };
    let effect_allele = fields[2].trim();
    let reference_allele = fields[3].trim();
    if effect_allele.is_empty() || reference_allele.is_empty() {
        return Err("effect and reference alleles must be non-empty".to_string());
    }

    let weight_text = fields[4].trim();
    let weight = lexical_core::parse::<f64>(weight_text.as_bytes())
        .ok()
        .filter(|w| w.is_finite())
        .ok_or_else(|| format!("weight '{weight_text}' is not a finite decimal number"))?;

    Ok(SnpRecord {
        chromosome: chromosome.to_string(),
        position,
        effect_allele: effect_allele.to_string(),
        reference_allele: reference_allele.to_string(),
        weight,
    })
}

// ========================================================================================
//                                  Samples
// ========================================================================================

/// The fixed sample order of a run. Every genotype vector and every score
/// accumulator is aligned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleList {
    ids: Vec<String>,
}

impl SampleList {
    /// Reads one identifier per line. With `has_header`, the first line is skipped and
    /// only the first whitespace-delimited token of each following line is used.
    pub fn load(path: &Path, has_header: bool) -> Result<Self, PrepError> {
        let mut source = open_text_source(path).map_err(|e| map_pipeline_error(e, path))?;
        let mut ids = Vec::new();
        let mut line_number = 0usize;

        while let Some(raw_line) = source
            .next_line()
            .map_err(|e| map_pipeline_error(e, path))?
        {
            line_number += 1;
            if has_header && line_number == 1 {
                continue;
            }
            let line = std::str::from_utf8(raw_line).map_err(|e| PrepError::Parse {
                path: path.to_path_buf(),
                line: line_number,
                message: format!("line is not valid UTF-8: {e}"),
            })?;
            let id = if has_header {
                line.split_whitespace().next().unwrap_or("")
            } else {
                line.trim()
            };
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }

        Self::from_ids(ids).map_err(|e| match e {
            PrepError::Empty(_) => PrepError::Empty(format!(
                "Sample file '{}' lists no samples.",
                path.display()
            )),
            other => other,
        })
    }

    pub fn from_ids(ids: Vec<String>) -> Result<Self, PrepError> {
        if ids.is_empty() {
            return Err(PrepError::Empty("The sample list is empty.".to_string()));
        }
        let mut seen = AHashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(PrepError::InconsistentSample(format!(
                    "Sample '{id}' is listed more than once."
                )));
            }
        }
        Ok(Self { ids })
    }

    #[inline]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Optional `internalId<TAB>externalName` mapping used to label output rows.
#[derive(Debug, Clone, Default)]
pub struct SampleIdMap {
    names: AHashMap<String, String>,
}

impl SampleIdMap {
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        let reader = open_text_reader(path).map_err(|e| map_pipeline_error(e, path))?;
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut names = AHashMap::new();
        for (index, record) in csv_reader.records().enumerate() {
            let record = record.map_err(|e| PrepError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                message: e.to_string(),
            })?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            match (record.get(0), record.get(1)) {
                (Some(id), Some(name)) if !id.trim().is_empty() => {
                    names.insert(id.trim().to_string(), name.trim().to_string());
                }
                _ => {
                    return Err(PrepError::Parse {
                        path: path.to_path_buf(),
                        line: index + 1,
                        message: "expected 'internalId<TAB>externalName'".to_string(),
                    });
                }
            }
        }
        Ok(Self { names })
    }

    pub fn name_for(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Output names aligned to `samples`. Unmapped samples keep their own ID.
    pub fn resolve_names(&self, samples: &SampleList) -> Vec<String> {
        let mut unmapped = 0usize;
        let names = samples
            .ids()
            .iter()
            .map(|id| match self.name_for(id) {
                Some(name) => name.to_string(),
                None => {
                    unmapped += 1;
                    id.clone()
                }
            })
            .collect();
        if unmapped > 0 {
            warn!("{unmapped} sample(s) have no entry in the ID map; their IDs are used as names.");
        }
        names
    }
}

// ========================================================================================
//                                    Error handling
// ========================================================================================

#[derive(Debug)]
pub enum PrepError {
    PipelineIo {
        path: PathBuf,
        message: String,
    },
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    Empty(String),
    InconsistentSample(String),
}

fn map_pipeline_error(err: PipelineError, path: &Path) -> PrepError {
    PrepError::PipelineIo {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

impl Display for PrepError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            PrepError::PipelineIo { path, message } => {
                write!(f, "I/O Error for file {}: {}", path.display(), message)
            }
            PrepError::Parse {
                path,
                line,
                message,
            } => write!(
                f,
                "Parse Error in '{}' on line {}: {}",
                path.display(),
                line,
                message
            ),
            PrepError::Empty(s) => write!(f, "Empty Input: {s}"),
            PrepError::InconsistentSample(s) => write!(f, "Configuration Error: {s}"),
        }
    }
}

impl Error for PrepError {}
