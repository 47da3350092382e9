// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;
use std::ops::AddAssign;
use std::path::PathBuf;

/// Strips a case-insensitive `chr` prefix so that `chr7` and `7` join.
pub fn normalize_chromosome(label: &str) -> &str {
    let trimmed = label.trim();
    match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") && trimmed.len() > 3 => &trimmed[3..],
        _ => trimmed,
    }
}

/// The join key between the weight table and genotype rows.
///
/// The chromosome is stored in normalized form. Two labels that differ only in
/// a `chr` prefix therefore produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnpKey {
    pub chromosome: String,
    pub position: u64,
}

impl SnpKey {
    pub fn new(chromosome: &str, position: u64) -> Self {
        Self {
            chromosome: normalize_chromosome(chromosome).to_string(),
            position,
        }
    }
}

impl fmt::Display for SnpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chromosome, self.position)
    }
}

/// One weighted SNP from the input table. Immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct SnpRecord {
    /// The chromosome label exactly as written in the weight file. Region files
    /// and path conventions use this form.
    pub chromosome: String,
    pub position: u64,
    pub effect_allele: String,
    pub reference_allele: String,
    pub weight: f64,
}

impl SnpRecord {
    #[inline]
    pub fn key(&self) -> SnpKey {
        SnpKey::new(&self.chromosome, self.position)
    }
}

/// A bounded unit of work: the SNPs submitted together to one variant-source query.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// `None` for randomized single-file chunks, which may span contigs.
    pub chromosome: Option<String>,
    /// The genotype file this chunk is read from.
    pub source_locator: PathBuf,
    /// Sorted, unique keys.
    pub snps: Vec<SnpKey>,
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> usize {
        self.snps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.snps.is_empty()
    }
}

/// One genomic line of query output. It borrows from the line buffer and does not
/// outlive QC evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRow<'a> {
    pub chromosome: &'a str,
    pub position: u64,
    pub reference_allele: &'a str,
    pub alternate_allele: &'a str,
    /// Genotype strings aligned to the submitted sample order.
    pub genotypes: Vec<&'a str>,
}

/// Which side of the observed REF/ALT pair carries the effect allele.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EffectAlleleIndex {
    Reference = 0,
    Alternate = 1,
}

impl EffectAlleleIndex {
    #[inline(always)]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A `#[repr(transparent)]` wrapper for a per-sample effect-allele dosage.
///
/// Values 0 to 2 are called dosages. The value 3 is reserved as the missing
/// genotype sentinel.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectAlleleDosage(pub u8);

impl EffectAlleleDosage {
    pub const MISSING: Self = Self(3);

    /// Creates a new dosage, asserting the value is valid in debug builds.
    #[inline(always)]
    pub fn new(value: u8) -> Self {
        debug_assert!(value <= 3, "Invalid dosage value created: {value}");
        Self(value)
    }

    #[inline(always)]
    pub fn is_missing(self) -> bool {
        self == Self::MISSING
    }

    /// The number of effect alleles carried, or `None` for a missing call.
    #[inline(always)]
    pub fn called(self) -> Option<u8> {
        if self.is_missing() { None } else { Some(self.0) }
    }
}

/// Genotype class counts for one variant: the Hardy-Weinberg test input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HweCounts {
    pub hom_ref: u32,
    pub het: u32,
    pub hom_alt: u32,
}

impl fmt::Display for HweCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.hom_ref, self.het, self.hom_alt)
    }
}

/// A variant that matched its SNP record and passed the call-rate and frequency filters.
#[derive(Debug, Clone)]
pub struct QcAnnotatedSnp<'a> {
    pub record: &'a SnpRecord,
    pub effect_allele_index: EffectAlleleIndex,
    pub missing_call_rate: f64,
    pub effect_allele_frequency: f64,
    pub hwe_counts: HweCounts,
    pub dosages: Vec<EffectAlleleDosage>,
}

/// The final per-sample result row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreAccumulator {
    pub sample_id: String,
    pub effect_allele_count: f64,
    pub score: f64,
}

/// Drop-reason tallies for one run. Each chunk owns its own copy and the
/// driver sums them, so no counter is ever shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DropCounters {
    pub total_snps: u64,
    pub allele_mismatch_dropped: u64,
    pub call_rate_dropped: u64,
    pub maf_dropped: u64,
    pub hwe_dropped: u64,
    pub qc_passed: u64,
    /// Query rows whose position is not in the weight table (e.g. overlapping indels).
    pub rows_without_snp: u64,
    /// Chunks whose genotype file was absent.
    pub chunks_skipped: u64,
}

impl AddAssign for DropCounters {
    fn add_assign(&mut self, other: Self) {
        self.total_snps += other.total_snps;
        self.allele_mismatch_dropped += other.allele_mismatch_dropped;
        self.call_rate_dropped += other.call_rate_dropped;
        self.maf_dropped += other.maf_dropped;
        self.hwe_dropped += other.hwe_dropped;
        self.qc_passed += other.qc_passed;
        self.rows_without_snp += other.rows_without_snp;
        self.chunks_skipped += other.chunks_skipped;
    }
}
