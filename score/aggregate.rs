// ========================================================================================
//                          Per-sample weighted score folding
// ========================================================================================

use crate::prepare::SampleList;
use crate::types::{QcAnnotatedSnp, ScoreAccumulator};

/// Per-sample partial sums for some subset of variants, aligned positionally with the
/// sample list. Folding is purely additive, so partials from any partition of the
/// variant set merge into the same totals.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialScores {
    effect_allele_counts: Vec<f64>,
    scores: Vec<f64>,
}

impl PartialScores {
    pub fn new(num_samples: usize) -> Self {
        Self {
            effect_allele_counts: vec![0.0; num_samples],
            scores: vec![0.0; num_samples],
        }
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.scores.len()
    }

    /// Folds one HWE-passing variant into every sample.
    ///
    /// A called sample adds its dosage to the count and `weight * dosage` to the score.
    /// A missing sample adds nothing to the count and the mean-imputed
    /// `2 * frequency * weight` to the score.
    pub fn add_variant(&mut self, snp: &QcAnnotatedSnp<'_>) {
        debug_assert_eq!(snp.dosages.len(), self.num_samples());
        let weight = snp.record.weight;
        let imputed = 2.0 * snp.effect_allele_frequency * weight;

        for ((count, score), dosage) in self
            .effect_allele_counts
            .iter_mut()
            .zip(self.scores.iter_mut())
            .zip(&snp.dosages)
        {
            match dosage.called() {
                Some(dosage) => {
                    let dosage = f64::from(dosage);
                    *count += dosage;
                    *score += weight * dosage;
                }
                None => *score += imputed,
            }
        }
    }

    /// Element-wise sum of two partials over the same samples.
    pub fn merge(mut self, other: Self) -> Self {
        debug_assert_eq!(self.num_samples(), other.num_samples());
        self.effect_allele_counts
            .iter_mut()
            .zip(other.effect_allele_counts)
            .for_each(|(a, b)| *a += b);
        self.scores
            .iter_mut()
            .zip(other.scores)
            .for_each(|(a, b)| *a += b);
        self
    }

    /// Binds the totals to sample identifiers, in sample-list order.
    pub fn into_accumulators(self, samples: &SampleList) -> Vec<ScoreAccumulator> {
        samples
            .ids()
            .iter()
            .zip(self.effect_allele_counts)
            .zip(self.scores)
            .map(|((id, effect_allele_count), score)| ScoreAccumulator {
                sample_id: id.clone(),
                effect_allele_count,
                score,
            })
            .collect()
    }
}
