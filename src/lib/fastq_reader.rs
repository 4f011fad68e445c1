//! A strict, streaming FASTQ record decoder.
//!
//! Records are decoded one at a time from any [`BufRead`] in the fixed four line layout:
//!
//! ```text
//! @<identifier>
//! <bases>
//! +<divider>
//! <qualities>
//! ```
//!
//! Nothing is silently repaired: a record with a missing marker, an unknown base, a quality line
//! of the wrong length, or a quality symbol outside Phred+33 is an error, as is a stream that ends
//! part way through a record.

use std::io::BufRead;

use anyhow::anyhow;
use bstr::BString;
use clap::{ArgEnum, PossibleValue};

use crate::{
    errors::{DemuxError, FormatErrorKind, Result, StreamKind},
    sequence::{Base, Nucleobase, SequenceRecord, MAX_QUALITY_SYMBOL, PHRED_OFFSET},
};

/// What to do with a symbol in a sequence line that is not one of `ACGTN` (in any case).
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidBasePolicy {
    /// Fail with [`FormatErrorKind::InvalidBaseChar`].
    Reject,
    /// Replace the symbol with a no-call.
    MaskAsN,
}

impl Default for InvalidBasePolicy {
    fn default() -> Self {
        Self::Reject
    }
}

impl InvalidBasePolicy {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        InvalidBasePolicy::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }
}

impl std::str::FromStr for InvalidBasePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |p| p.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(anyhow!("Invalid variant: {}", s))
    }
}

/// Decodes [`SequenceRecord`]s from a single stream.
pub struct FastqReader<R: BufRead> {
    inner: R,
    /// Which input this reader is decoding, used when reporting errors.
    stream: StreamKind,
    invalid_base_policy: InvalidBasePolicy,
    /// The number of records successfully decoded so far.
    records_read: usize,
    line: Vec<u8>,
}

impl<R: BufRead> FastqReader<R> {
    /// Create a new [`FastqReader`] that rejects invalid bases.
    pub fn new(inner: R, stream: StreamKind) -> Self {
        Self::with_policy(inner, stream, InvalidBasePolicy::default())
    }

    pub fn with_policy(inner: R, stream: StreamKind, invalid_base_policy: InvalidBasePolicy) -> Self {
        Self { inner, stream, invalid_base_policy, records_read: 0, line: Vec::with_capacity(512) }
    }

    /// The stream this reader decodes.
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// The number of records decoded so far.
    pub fn records_read(&self) -> usize {
        self.records_read
    }

    /// Decode the next record.
    ///
    /// Returns `Ok(None)` when the stream is exhausted at a record boundary.
    pub fn next_record(&mut self) -> Result<Option<SequenceRecord>> {
        // Blank lines may separate records
        loop {
            if !Self::read_line(&mut self.inner, &mut self.line)? {
                return Ok(None);
            }
            if !self.line.is_empty() {
                break;
            }
        }

        let id = match self.line.strip_prefix(b"@") {
            Some(id) => BString::from(id),
            None => return Err(self.error(FormatErrorKind::MissingIdentifierMarker)),
        };

        if !Self::read_line(&mut self.inner, &mut self.line)? {
            return Err(self.error(FormatErrorKind::TruncatedRecord));
        }
        let mut bases = Vec::with_capacity(self.line.len());
        for (i, &symbol) in self.line.iter().enumerate() {
            let base = match (Base::from_ascii(symbol), self.invalid_base_policy) {
                (Some(base), _) => base,
                (None, InvalidBasePolicy::MaskAsN) => Base::N,
                (None, InvalidBasePolicy::Reject) => {
                    return Err(self.error(FormatErrorKind::InvalidBaseChar {
                        base: symbol as char,
                        position: i + 1,
                    }))
                }
            };
            bases.push(Nucleobase::new(base, 0));
        }

        if !Self::read_line(&mut self.inner, &mut self.line)? {
            return Err(self.error(FormatErrorKind::TruncatedRecord));
        }
        let divider = match self.line.strip_prefix(b"+") {
            Some(divider) => BString::from(divider),
            None => return Err(self.error(FormatErrorKind::MissingDividerMarker)),
        };

        if !Self::read_line(&mut self.inner, &mut self.line)? {
            return Err(self.error(FormatErrorKind::TruncatedRecord));
        }
        if self.line.len() != bases.len() {
            return Err(self.error(FormatErrorKind::QualityLengthMismatch {
                bases: bases.len(),
                quals: self.line.len(),
            }));
        }
        for (i, (nucleobase, &symbol)) in bases.iter_mut().zip(self.line.iter()).enumerate() {
            if !(PHRED_OFFSET..=MAX_QUALITY_SYMBOL).contains(&symbol) {
                return Err(self.error(FormatErrorKind::QualityOutOfRange {
                    symbol: symbol as char,
                    position: i + 1,
                }));
            }
            nucleobase.quality = symbol - PHRED_OFFSET;
        }

        self.records_read += 1;
        Ok(Some(SequenceRecord::new(id, bases, divider)))
    }

    /// Build a format error for the record currently being decoded.
    fn error(&self, kind: FormatErrorKind) -> DemuxError {
        DemuxError::Format { stream: self.stream, record: self.records_read + 1, kind }
    }

    /// Read one line into `buffer` without its terminator.
    ///
    /// Returns false if the stream was already exhausted.
    fn read_line(reader: &mut R, buffer: &mut Vec<u8>) -> std::io::Result<bool> {
        buffer.clear();
        if reader.read_until(b'\n', buffer)? == 0 {
            return Ok(false);
        }
        if buffer.last() == Some(&b'\n') {
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
        }
        Ok(true)
    }
}

impl<R: BufRead> Iterator for FastqReader<R> {
    type Item = Result<SequenceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
