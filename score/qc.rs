// ========================================================================================
//
//                      Per-variant quality control and statistics
//
// ========================================================================================
//
// A query row is usable only when its alleles line up with the weight table and its
// genotypes are complete and frequent enough. One pass over the genotype strings
// produces every statistic later stages need: the missing-call rate, the effect-allele
// frequency used for imputation, the genotype classes for the HWE test, and the
// per-sample dosages.

use crate::config::PipelineConfig;
use crate::types::{
    DropCounters, EffectAlleleDosage, EffectAlleleIndex, HweCounts, QcAnnotatedSnp, SnpRecord,
    VariantRow,
};

/// The three row-level cutoffs. Both comparisons are inclusive on the dropping side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QcThresholds {
    pub max_missing_rate: f64,
    pub min_effect_allele_frequency: f64,
    pub maf_filter: bool,
}

impl From<&PipelineConfig> for QcThresholds {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_missing_rate: config.max_missing_rate,
            min_effect_allele_frequency: config.min_effect_allele_frequency,
            maf_filter: config.maf_filter,
        }
    }
}

/// What happened to one row.
#[derive(Debug)]
pub enum QcOutcome<'a> {
    Accepted(QcAnnotatedSnp<'a>),
    AlleleMismatch,
    CallRateDropped,
    MafDropped,
}

impl QcOutcome<'_> {
    /// Tallies a rejection. Accepted rows are only counted once HWE has passed.
    pub fn count_drop(&self, counters: &mut DropCounters) {
        match self {
            QcOutcome::Accepted(_) => {}
            QcOutcome::AlleleMismatch => counters.allele_mismatch_dropped += 1,
            QcOutcome::CallRateDropped => counters.call_rate_dropped += 1,
            QcOutcome::MafDropped => counters.maf_dropped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QcFilter {
    thresholds: QcThresholds,
}

impl QcFilter {
    pub fn new(thresholds: QcThresholds) -> Self {
        Self { thresholds }
    }

    pub fn evaluate<'a>(&self, record: &'a SnpRecord, row: &VariantRow<'_>) -> QcOutcome<'a> {
        let Some(effect_allele_index) =
            resolve_effect_allele_index(record, row.reference_allele, row.alternate_allele)
        else {
            return QcOutcome::AlleleMismatch;
        };

        let sample_count = row.genotypes.len();
        if sample_count == 0 {
            return QcOutcome::CallRateDropped;
        }

        let effect_code = u32::from(effect_allele_index.as_u8());
        let mut missing = 0u32;
        let mut effect_alleles = 0u64;
        let mut hwe_counts = HweCounts::default();
        let mut dosages = Vec::with_capacity(sample_count);

        for genotype in &row.genotypes {
            let Some((first, second)) = parse_genotype(genotype) else {
                missing += 1;
                dosages.push(EffectAlleleDosage::MISSING);
                continue;
            };
            let dosage = u8::from(first == effect_code) + u8::from(second == effect_code);
            effect_alleles += u64::from(dosage);
            dosages.push(EffectAlleleDosage::new(dosage));
            match u8::from(first == 0) + u8::from(second == 0) {
                2 => hwe_counts.hom_ref += 1,
                1 => hwe_counts.het += 1,
                _ => hwe_counts.hom_alt += 1,
            }
        }

        let missing_call_rate = f64::from(missing) / sample_count as f64;
        if missing_call_rate >= self.thresholds.max_missing_rate {
            return QcOutcome::CallRateDropped;
        }

        let called = sample_count as u64 - u64::from(missing);
        if called == 0 {
            return QcOutcome::CallRateDropped;
        }
        let effect_allele_frequency = effect_alleles as f64 / (2 * called) as f64;
        if self.thresholds.maf_filter
            && effect_allele_frequency <= self.thresholds.min_effect_allele_frequency
        {
            return QcOutcome::MafDropped;
        }

        QcOutcome::Accepted(QcAnnotatedSnp {
            record,
            effect_allele_index,
            missing_call_rate,
            effect_allele_frequency,
            hwe_counts,
            dosages,
        })
    }
}

/// Orients the observed REF/ALT pair against the table's effect/reference pair.
/// The effect allele on REF gives index 0 and on ALT gives index 1, but only when
/// the table's other allele sits on the opposite side. Split multi-allelic rows
/// sharing a REF therefore match at most once.
pub fn resolve_effect_allele_index(
    record: &SnpRecord,
    reference_allele: &str,
    alternate_allele: &str,
) -> Option<EffectAlleleIndex> {
    let effect = record.effect_allele.as_str();
    let other = record.reference_allele.as_str();
    if effect.eq_ignore_ascii_case(reference_allele) && other.eq_ignore_ascii_case(alternate_allele)
    {
        Some(EffectAlleleIndex::Reference)
    } else if effect.eq_ignore_ascii_case(alternate_allele)
        && other.eq_ignore_ascii_case(reference_allele)
    {
        Some(EffectAlleleIndex::Alternate)
    } else {
        None
    }
}

/// Parses `a/b`, `a|b` or a haploid `a` into two allele codes. Any `.` allele, or an
/// allele that is not a number, makes the whole call missing. Haploid calls are
/// read as homozygous.
fn parse_genotype(genotype: &str) -> Option<(u32, u32)> {
    let genotype = genotype.trim();
    let mut alleles = genotype.split(['/', '|']);
    let first = parse_allele(alleles.next()?)?;
    let second = match alleles.next() {
        Some(allele) => parse_allele(allele)?,
        None => first,
    };
    if alleles.next().is_some() {
        return None;
    }
    Some((first, second))
}

#[inline]
fn parse_allele(allele: &str) -> Option<u32> {
    if allele == "." {
        None
    } else {
        allele.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(effect: &str, reference: &str) -> SnpRecord {
        SnpRecord {
            chromosome: "1".to_string(),
            position: 100,
            effect_allele: effect.to_string(),
            reference_allele: reference.to_string(),
            weight: 1.0,
        }
    }

    fn row<'a>(reference: &'a str, alternate: &'a str, genotypes: Vec<&'a str>) -> VariantRow<'a> {
        VariantRow {
            chromosome: "1",
            position: 100,
            reference_allele: reference,
            alternate_allele: alternate,
            genotypes,
        }
    }

    fn filter(maf_filter: bool) -> QcFilter {
        QcFilter::new(QcThresholds::from(&PipelineConfig {
            maf_filter,
            ..Default::default()
        }))
    }

    #[test]
    fn effect_allele_index_follows_the_matching_side() {
        let snp = record("A", "G");
        assert_eq!(
            resolve_effect_allele_index(&snp, "A", "G"),
            Some(EffectAlleleIndex::Reference)
        );
        assert_eq!(
            resolve_effect_allele_index(&snp, "G", "A"),
            Some(EffectAlleleIndex::Alternate)
        );
        assert_eq!(resolve_effect_allele_index(&snp, "C", "T"), None);
        assert_eq!(
            resolve_effect_allele_index(&snp, "g", "a"),
            Some(EffectAlleleIndex::Alternate)
        );
    }

    #[test]
    fn both_table_alleles_must_match_the_observed_pair() {
        // A table entry A (effect) / G must not pick up the A>T half of a split
        // multi-allelic site.
        let snp = record("A", "G");
        assert_eq!(resolve_effect_allele_index(&snp, "A", "T"), None);
        assert_eq!(resolve_effect_allele_index(&snp, "T", "A"), None);
        assert_eq!(resolve_effect_allele_index(&snp, "A", "G,T"), None);

        let split_half = filter(false).evaluate(&snp, &row("A", "T", vec!["0/0", "0/1"]));
        assert!(matches!(split_half, QcOutcome::AlleleMismatch));
        let matching_half = filter(false).evaluate(&snp, &row("A", "G", vec!["0/1", "0/0"]));
        assert!(matches!(matching_half, QcOutcome::Accepted(_)));
    }

    #[test]
    fn mismatched_alleles_are_counted_not_scored() {
        let snp = record("A", "G");
        let outcome = filter(true).evaluate(&snp, &row("C", "T", vec!["0/1", "1/1"]));
        assert!(matches!(outcome, QcOutcome::AlleleMismatch));
        let mut counters = DropCounters::default();
        outcome.count_drop(&mut counters);
        assert_eq!(counters.allele_mismatch_dropped, 1);
    }

    #[test]
    fn genotype_parsing_handles_phasing_haploid_and_missing() {
        assert_eq!(parse_genotype("0/1"), Some((0, 1)));
        assert_eq!(parse_genotype("1|1"), Some((1, 1)));
        assert_eq!(parse_genotype("1"), Some((1, 1)));
        assert_eq!(parse_genotype("."), None);
        assert_eq!(parse_genotype("./."), None);
        assert_eq!(parse_genotype("0/."), None);
        assert_eq!(parse_genotype("0/1/1"), None);
    }

    #[test]
    fn dosages_count_the_effect_allele_on_either_side() {
        let on_alt = record("G", "A");
        let QcOutcome::Accepted(snp) =
            filter(false).evaluate(&on_alt, &row("A", "G", vec!["0/0", "0/1", "1/1"]))
        else {
            panic!("variant should pass");
        };
        assert_eq!(snp.effect_allele_index, EffectAlleleIndex::Alternate);
        let alt_dosages: Vec<u8> = snp.dosages.iter().map(|d| d.0).collect();
        assert_eq!(alt_dosages, vec![0, 1, 2]);
        assert_eq!(snp.hwe_counts, HweCounts { hom_ref: 1, het: 1, hom_alt: 1 });

        let on_ref = record("A", "G");
        let QcOutcome::Accepted(snp) =
            filter(false).evaluate(&on_ref, &row("A", "G", vec!["0/0", "0/1", "1/1"]))
        else {
            panic!("variant should pass");
        };
        let ref_dosages: Vec<u8> = snp.dosages.iter().map(|d| d.0).collect();
        assert_eq!(ref_dosages, vec![2, 1, 0]);
        assert_eq!(snp.hwe_counts, HweCounts { hom_ref: 1, het: 1, hom_alt: 1 });
        assert!((snp.effect_allele_frequency - 0.5).abs() < 1e-12);
    }

    #[test]
    fn call_rate_of_exactly_the_threshold_is_dropped() {
        let snp = record("G", "A");
        let mut at_threshold = vec!["0/1"; 9];
        at_threshold.push("./.");
        assert!(matches!(
            filter(true).evaluate(&snp, &row("A", "G", at_threshold)),
            QcOutcome::CallRateDropped
        ));

        let mut below = vec!["0/1"; 90];
        below.extend(vec!["."; 9]);
        let QcOutcome::Accepted(passed) = filter(true).evaluate(&snp, &row("A", "G", below))
        else {
            panic!("9 of 99 missing is below the threshold");
        };
        assert!(passed.missing_call_rate < 0.10);
    }

    #[test]
    fn effect_allele_frequency_of_exactly_the_threshold_is_dropped() {
        let snp = record("G", "A");
        let mut at_threshold = vec!["0/0"; 49];
        at_threshold.push("0/1");
        assert!(matches!(
            filter(true).evaluate(&snp, &row("A", "G", at_threshold.clone())),
            QcOutcome::MafDropped
        ));
        assert!(matches!(
            filter(false).evaluate(&snp, &row("A", "G", at_threshold)),
            QcOutcome::Accepted(_)
        ));

        let mut above = vec!["0/0"; 97];
        above.extend(["0/1", "0/1"]);
        assert!(matches!(
            filter(true).evaluate(&snp, &row("A", "G", above)),
            QcOutcome::Accepted(_)
        ));
    }

    #[test]
    fn all_missing_variant_never_passes() {
        let snp = record("G", "A");
        let config = PipelineConfig {
            max_missing_rate: 1.0,
            ..Default::default()
        };
        let outcome = QcFilter::new(QcThresholds::from(&config))
            .evaluate(&snp, &row("A", "G", vec![".", "./."]));
        assert!(matches!(outcome, QcOutcome::CallRateDropped));
    }
}
