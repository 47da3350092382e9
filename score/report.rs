// ========================================================================================
//                               Score table and QC summary
// ========================================================================================
//
// The score table is the only thing a run writes to stdout, so it stays
// machine-parseable. The QC summary goes to stderr.

use crate::types::{DropCounters, ScoreAccumulator};
use std::fmt::Write as FmtWrite;
use std::io::{self, Write};

/// Writes one header plus one row per sample, in sample-list order.
///
/// With `sample_names` (aligned with `accumulators`) the table carries both the
/// sample ID and its mapped name.
pub fn write_score_table<W: Write>(
    writer: &mut W,
    accumulators: &[ScoreAccumulator],
    sample_names: Option<&[String]>,
) -> io::Result<()> {
    if let Some(names) = sample_names {
        if names.len() != accumulators.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Mismatched number of sample names and score rows during final write.",
            ));
        }
    }

    match sample_names {
        Some(_) => writeln!(writer, "sampleID\tsampleName\teffcount\tscore")?,
        None => writeln!(writer, "sample\tCNT\tsum")?,
    }

    let mut line_buffer = String::with_capacity(128);
    let mut ryu_buffer = ryu::Buffer::new();
    for (index, accumulator) in accumulators.iter().enumerate() {
        line_buffer.clear();
        line_buffer.push_str(&accumulator.sample_id);
        if let Some(names) = sample_names {
            line_buffer.push('\t');
            line_buffer.push_str(&names[index]);
        }
        write!(
            &mut line_buffer,
            "\t{}\t{}",
            accumulator.effect_allele_count,
            ryu_buffer.format(accumulator.score)
        )
        .map_err(io::Error::other)?;
        writeln!(writer, "{line_buffer}")?;
    }
    writer.flush()
}

/// The per-stage drop tallies, one `label: value` line each.
pub fn write_summary<W: Write>(writer: &mut W, counters: &DropCounters) -> io::Result<()> {
    writeln!(writer, "> QC summary")?;
    writeln!(writer, "  total SNPs:              {}", counters.total_snps)?;
    writeln!(writer, "  allele mismatch dropped: {}", counters.allele_mismatch_dropped)?;
    writeln!(writer, "  call rate dropped:       {}", counters.call_rate_dropped)?;
    writeln!(writer, "  MAF dropped:             {}", counters.maf_dropped)?;
    writeln!(writer, "  HWE dropped:             {}", counters.hwe_dropped)?;
    writeln!(writer, "  QC passed:               {}", counters.qc_passed)?;
    if counters.rows_without_snp > 0 {
        writeln!(writer, "  rows without a SNP:      {}", counters.rows_without_snp)?;
    }
    if counters.chunks_skipped > 0 {
        writeln!(writer, "  chunks skipped:          {}", counters.chunks_skipped)?;
    }
    Ok(())
}
