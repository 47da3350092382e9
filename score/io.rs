// ========================================================================================
//
//                       Line-oriented input for tabular files
//
// ========================================================================================
//
// Every tabular input of the pipeline (weight table, sample list, ID map, chunk
// indices) is consumed one line at a time through the `TextSource` trait. The
// built-in VCF reader shares `open_text_reader`. BGZF and plain gzip streams are
// told apart by their headers and decompressed on the fly, so callers never care
// about the storage encoding.

use crate::pipeline::PipelineError;
use flate2::read::MultiGzDecoder;
use noodles::bgzf;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// FLG bit announcing an extra field in the gzip member header.
const GZIP_FEXTRA: u8 = 0x04;
/// The `BC` subfield identifier that marks a BGZF block.
const BGZF_SUBFIELD: [u8; 2] = *b"BC";

/// How the bytes of an input file are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCompression {
    Plain,
    Gzip,
    Bgzf,
}

impl TextCompression {
    /// Classifies a file from its first bytes.
    pub fn detect(head: &[u8]) -> Self {
        if !head.starts_with(&GZIP_MAGIC) {
            return TextCompression::Plain;
        }
        let has_extra = head.get(3).is_some_and(|flags| flags & GZIP_FEXTRA != 0);
        if has_extra && head.get(12..14) == Some(&BGZF_SUBFIELD[..]) {
            TextCompression::Bgzf
        } else {
            TextCompression::Gzip
        }
    }
}

/// A trait that abstracts sequential, line-oriented access to text data,
/// regardless of whether the bytes on disk are compressed.
pub trait TextSource: Send {
    /// Returns the next line without its terminator, or `None` at end of input.
    /// The slice is only valid until the next call.
    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError>;
}

/// Opens `path` as a buffered reader, transparently inflating BGZF or gzip content.
pub fn open_text_reader(path: &Path) -> Result<Box<dyn BufRead + Send>, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Io(format!("Opening {}: {e}", path.display())))?;
    let mut buffered = BufReader::new(file);
    let compression = TextCompression::detect(
        buffered
            .fill_buf()
            .map_err(|e| PipelineError::Io(format!("Reading {}: {e}", path.display())))?,
    );

    Ok(match compression {
        TextCompression::Bgzf => Box::new(bgzf::io::Reader::new(buffered)),
        TextCompression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(buffered))),
        TextCompression::Plain => Box::new(buffered),
    })
}

pub fn open_text_source(path: &Path) -> Result<Box<dyn TextSource>, PipelineError> {
    let reader = open_text_reader(path)?;
    Ok(Box::new(LocalTextSource {
        reader,
        line: Vec::with_capacity(1024),
        line_active: false,
        path_display: path.display().to_string(),
    }))
}

struct LocalTextSource {
    reader: Box<dyn BufRead + Send>,
    line: Vec<u8>,
    line_active: bool,
    path_display: String,
}

impl TextSource for LocalTextSource {
    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self
            .reader
            .read_until(b'\n', &mut self.line)
            .map_err(|e| PipelineError::Io(format!("Error reading {}: {e}", self.path_display)))?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_active = true;
        Ok(Some(&self.line))
    }
}
