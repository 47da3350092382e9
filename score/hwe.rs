// ========================================================================================
//
//                         Hardy-Weinberg equilibrium testing
//
// ========================================================================================
//
// Variants that survive row-level QC are tested for Hardy-Weinberg equilibrium in one
// batch per chunk. The batch contract is positional: the i-th p-value belongs to the
// i-th genotype-count triple, and no variant identifier crosses the boundary. Two
// engines honor it: the exact test computed in-process, and an external program fed
// `homRef<TAB>het<TAB>homAlt` lines that answers with one p-value per line.

use crate::config::PipelineConfig;
use crate::types::HweCounts;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HweError {
    #[error("Failed to start HWE program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error while talking to the HWE program: {0}")]
    Io(#[from] std::io::Error),
    #[error("HWE program '{program}' exited unsuccessfully ({status})")]
    Status { program: String, status: String },
    #[error("HWE program returned an unparsable p-value on line {line}: '{value}'")]
    Parse { line: usize, value: String },
    #[error("HWE program returned {actual} p-values for {expected} variants")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Batched HWE p-value computation. Output length and order match the input.
pub trait HweEngine: Send + Sync {
    fn p_values(&self, counts: &[HweCounts]) -> Result<Vec<f64>, HweError>;
}

/// Builds the engine a run is configured with.
pub fn engine_from_config(config: &PipelineConfig) -> Box<dyn HweEngine> {
    match &config.hwe_command {
        Some(command) => Box::new(ExternalHwe::new(command.clone())),
        None => Box::new(ExactHwe),
    }
}

/// A variant is kept only when its p-value is strictly above the threshold.
#[inline]
pub fn passes_hwe(p_value: f64, threshold: f64) -> bool {
    p_value > threshold
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactHwe;

impl HweEngine for ExactHwe {
    fn p_values(&self, counts: &[HweCounts]) -> Result<Vec<f64>, HweError> {
        Ok(counts.iter().map(hwe_exact_p).collect())
    }
}

/// The SNP-HWE exact test of Wigginton, Cutler and Abecasis (2005).
///
/// Heterozygote probabilities are computed by recurrence outward from the most likely
/// heterozygote count, normalized, and the p-value is the total probability of every
/// configuration no more likely than the observed one.
pub fn hwe_exact_p(counts: &HweCounts) -> f64 {
    let obs_hets = i64::from(counts.het);
    let obs_homr = i64::from(counts.hom_ref.min(counts.hom_alt));
    let obs_homc = i64::from(counts.hom_ref.max(counts.hom_alt));

    let rare_copies = 2 * obs_homr + obs_hets;
    let genotypes = obs_hets + obs_homc + obs_homr;
    if genotypes == 0 {
        return 1.0;
    }

    let mut het_probs = vec![0.0f64; rare_copies as usize + 1];

    let mut mid = rare_copies * (2 * genotypes - rare_copies) / (2 * genotypes);
    // The heterozygote count must share the parity of the rare allele count.
    if (rare_copies & 1) ^ (mid & 1) != 0 {
        mid += 1;
    }

    let mut curr_hets = mid;
    let mut curr_homr = (rare_copies - mid) / 2;
    let mut curr_homc = genotypes - curr_hets - curr_homr;
    het_probs[mid as usize] = 1.0;
    let mut sum = 1.0;

    while curr_hets > 1 {
        let next = het_probs[curr_hets as usize] * (curr_hets * (curr_hets - 1)) as f64
            / (4 * (curr_homr + 1) * (curr_homc + 1)) as f64;
        het_probs[(curr_hets - 2) as usize] = next;
        sum += next;
        curr_hets -= 2;
        curr_homr += 1;
        curr_homc += 1;
    }

    curr_hets = mid;
    curr_homr = (rare_copies - mid) / 2;
    curr_homc = genotypes - curr_hets - curr_homr;
    while curr_hets <= rare_copies - 2 {
        let next = het_probs[curr_hets as usize] * (4 * curr_homr * curr_homc) as f64
            / ((curr_hets + 2) * (curr_hets + 1)) as f64;
        het_probs[(curr_hets + 2) as usize] = next;
        sum += next;
        curr_hets += 2;
        curr_homr -= 1;
        curr_homc -= 1;
    }

    let observed = het_probs[obs_hets as usize] / sum;
    let p_value: f64 = het_probs
        .iter()
        .map(|p| p / sum)
        .filter(|&p| p <= observed)
        .sum();
    p_value.min(1.0)
}

/// Runs an external program once per batch.
#[derive(Debug, Clone)]
pub struct ExternalHwe {
    command: Vec<String>,
}

impl ExternalHwe {
    /// `command` is the program followed by its arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn program(&self) -> String {
        self.command.first().cloned().unwrap_or_default()
    }
}

impl HweEngine for ExternalHwe {
    fn p_values(&self, counts: &[HweCounts]) -> Result<Vec<f64>, HweError> {
        if counts.is_empty() {
            return Ok(Vec::new());
        }
        let program = self.program();
        let mut child = Command::new(&program)
            .args(self.command.get(1..).unwrap_or(&[]))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| HweError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HweError::Io(std::io::Error::other(
                "HWE program pipes were not captured",
            )));
        };

        // Feed stdin from its own thread so a program that writes before it has read
        // everything cannot deadlock against a full pipe.
        let outcome = thread::scope(|scope| {
            let writer = scope.spawn(move || -> std::io::Result<()> {
                let mut stdin = BufWriter::new(stdin);
                for triple in counts {
                    writeln!(stdin, "{triple}")?;
                }
                stdin.flush()
            });

            let mut p_values = Vec::with_capacity(counts.len());
            let mut read_result = Ok(());
            for (index, line) in BufReader::new(stdout).lines().enumerate() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        read_result = Err(HweError::Io(e));
                        break;
                    }
                };
                let value = line.trim();
                if value.is_empty() {
                    continue;
                }
                match value.parse::<f64>() {
                    Ok(p) if !p.is_nan() => p_values.push(p),
                    _ => {
                        read_result = Err(HweError::Parse {
                            line: index + 1,
                            value: value.to_string(),
                        });
                        break;
                    }
                }
            }

            let write_result = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("HWE stdin writer panicked")));
            read_result.map(|()| (p_values, write_result))
        });

        let (p_values, write_result) = match outcome {
            Ok(parts) => parts,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let status = child.wait()?;
        if !status.success() {
            return Err(HweError::Status {
                program,
                status: status.to_string(),
            });
        }
        write_result?;

        if p_values.len() != counts.len() {
            return Err(HweError::LengthMismatch {
                expected: counts.len(),
                actual: p_values.len(),
            });
        }
        Ok(p_values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn counts(hom_ref: u32, het: u32, hom_alt: u32) -> HweCounts {
        HweCounts { hom_ref, het, hom_alt }
    }

    #[test]
    fn equilibrium_counts_have_a_large_p_value() {
        assert!(hwe_exact_p(&counts(25, 50, 25)) > 0.5);
    }

    #[test]
    fn missing_heterozygotes_give_a_tiny_p_value() {
        assert!(hwe_exact_p(&counts(50, 0, 50)) < 1e-6);
    }

    #[test]
    fn monomorphic_and_empty_variants_are_in_equilibrium() {
        assert_relative_eq!(hwe_exact_p(&counts(100, 0, 0)), 1.0);
        assert_relative_eq!(hwe_exact_p(&counts(0, 0, 0)), 1.0);
    }

    #[test]
    fn test_is_symmetric_in_the_homozygote_classes() {
        assert_relative_eq!(
            hwe_exact_p(&counts(70, 20, 10)),
            hwe_exact_p(&counts(10, 20, 70)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn single_heterozygote_is_certain() {
        // One rare allele can only ever appear in a heterozygote.
        assert_relative_eq!(hwe_exact_p(&counts(9, 1, 0)), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn p_value_at_the_threshold_is_dropped() {
        assert!(!passes_hwe(1e-6, 1e-6));
        assert!(passes_hwe(1.0001e-6, 1e-6));
        assert!(!passes_hwe(0.0, 1e-6));
    }

    #[test]
    fn exact_engine_preserves_batch_order() {
        let batch = [counts(50, 0, 50), counts(25, 50, 25), counts(100, 0, 0)];
        let p_values = ExactHwe.p_values(&batch).unwrap();
        assert_eq!(p_values.len(), 3);
        assert!(p_values[0] < 1e-6);
        assert!(p_values[1] > 0.5);
        assert_relative_eq!(p_values[2], 1.0);
    }

    #[cfg(unix)]
    #[test]
    fn external_engine_reads_one_value_per_line() {
        let engine = ExternalHwe::new(vec![
            "sh".into(),
            "-c".into(),
            "while read a b c; do echo 0.5; done".into(),
        ]);
        let p_values = engine.p_values(&[counts(1, 2, 3), counts(4, 5, 6)]).unwrap();
        assert_eq!(p_values, vec![0.5, 0.5]);
    }

    #[cfg(unix)]
    #[test]
    fn external_engine_rejects_short_or_bad_output() {
        let short = ExternalHwe::new(vec!["sh".into(), "-c".into(), "cat >/dev/null; echo 0.1".into()]);
        assert!(matches!(
            short.p_values(&[counts(1, 2, 3), counts(4, 5, 6)]),
            Err(HweError::LengthMismatch { expected: 2, actual: 1 })
        ));

        let garbled = ExternalHwe::new(vec!["sh".into(), "-c".into(), "cat >/dev/null; echo NA".into()]);
        assert!(matches!(
            garbled.p_values(&[counts(1, 2, 3)]),
            Err(HweError::Parse { line: 1, .. })
        ));

        let failing = ExternalHwe::new(vec!["sh".into(), "-c".into(), "cat >/dev/null; exit 3".into()]);
        assert!(matches!(
            failing.p_values(&[counts(1, 2, 3)]),
            Err(HweError::Status { .. })
        ));
    }
}
