//! Reads the forward, reverse and index streams in lockstep.
//!
//! One record is pulled from every stream per [`ReadSet`]. The index stream, when present,
//! defines the end of the input; otherwise the forward stream does. Streams that end early or
//! late are an error, never silently truncated.

use std::io::BufRead;

use bstr::ByteSlice;
use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::{
    errors::{DemuxError, Result, StreamKind, SyncErrorKind},
    fastq_reader::FastqReader,
    sequence::SequenceRecord,
};

lazy_static! {
    /// A trailing `/1`, `/2` or `/3` mate marker on a read name.
    static ref MATE_SUFFIX: Regex = Regex::new(r"/[123]$").unwrap();
}

/// The records for one sequenced fragment, one per active input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSet {
    pub forward: SequenceRecord,
    pub reverse: Option<SequenceRecord>,
    pub index: Option<SequenceRecord>,
}

impl ReadSet {
    /// Iterate over the records present, in forward, reverse, index order.
    pub fn records(&self) -> impl Iterator<Item = (StreamKind, &SequenceRecord)> {
        std::iter::once((StreamKind::Forward, &self.forward))
            .chain(self.reverse.iter().map(|r| (StreamKind::Reverse, r)))
            .chain(self.index.iter().map(|r| (StreamKind::Index, r)))
    }
}

/// Strip everything after the first whitespace and any trailing mate marker from a read name.
pub fn normalize_read_name(id: &[u8]) -> &[u8] {
    let end = id.find_byteset(b" \t").unwrap_or(id.len());
    let name = &id[..end];
    match MATE_SUFFIX.find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// Advances two or three [`FastqReader`]s together, yielding [`ReadSet`]s.
pub struct SyncReader<R: BufRead> {
    forward: FastqReader<R>,
    reverse: Option<FastqReader<R>>,
    index: Option<FastqReader<R>>,
    /// If true, all read names in a set must agree (after normalization).
    enforce_identifier_match: bool,
    read_sets: usize,
    finished: bool,
}

impl<R: BufRead> SyncReader<R> {
    pub fn new(
        forward: FastqReader<R>,
        reverse: Option<FastqReader<R>>,
        index: Option<FastqReader<R>>,
        enforce_identifier_match: bool,
    ) -> Self {
        Self { forward, reverse, index, enforce_identifier_match, read_sets: 0, finished: false }
    }

    /// True if reverse reads are being read.
    pub fn is_paired(&self) -> bool {
        self.reverse.is_some()
    }

    /// True if index reads are being read.
    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// The number of read sets yielded so far.
    pub fn read_sets(&self) -> usize {
        self.read_sets
    }

    /// The stream that defines the end of the input.
    fn primary_stream(&self) -> StreamKind {
        if self.index.is_some() {
            StreamKind::Index
        } else {
            StreamKind::Forward
        }
    }

    /// Read the next [`ReadSet`], or `None` once the primary stream is exhausted.
    pub fn next_read_set(&mut self) -> Result<Option<ReadSet>> {
        if self.finished {
            return Ok(None);
        }
        let record = self.read_sets + 1;

        let forward = self.forward.next_record()?;
        let reverse = match self.reverse.as_mut() {
            Some(reader) => Some(reader.next_record()?),
            None => None,
        };
        let index = match self.index.as_mut() {
            Some(reader) => Some(reader.next_record()?),
            None => None,
        };

        let primary = self.primary_stream();
        let primary_ended = match primary {
            StreamKind::Index => matches!(index, Some(None)),
            _ => forward.is_none(),
        };

        let mut states = vec![(StreamKind::Forward, forward.is_some())];
        if let Some(reverse) = &reverse {
            states.push((StreamKind::Reverse, reverse.is_some()));
        }
        if let Some(index) = &index {
            states.push((StreamKind::Index, index.is_some()));
        }
        for (stream, has_record) in states {
            if stream == primary {
                continue;
            }
            if primary_ended && has_record {
                return Err(DemuxError::Sync {
                    record,
                    kind: SyncErrorKind::StreamLengthMismatch { ended: primary, remaining: stream },
                });
            } else if !primary_ended && !has_record {
                return Err(DemuxError::Sync {
                    record,
                    kind: SyncErrorKind::StreamLengthMismatch { ended: stream, remaining: primary },
                });
            }
        }

        let forward = match forward {
            Some(forward) if !primary_ended => forward,
            _ => {
                self.finished = true;
                return Ok(None);
            }
        };
        let read_set = ReadSet { forward, reverse: reverse.flatten(), index: index.flatten() };

        if self.enforce_identifier_match {
            Self::check_read_names(&read_set, record)?;
        }

        self.read_sets += 1;
        Ok(Some(read_set))
    }

    /// Ensure every record in the set has the same normalized read name as the forward record.
    fn check_read_names(read_set: &ReadSet, record: usize) -> Result<()> {
        let expected = normalize_read_name(&read_set.forward.id);
        for (stream, other) in read_set.records().skip(1) {
            let found = normalize_read_name(&other.id);
            if found != expected {
                return Err(DemuxError::Sync {
                    record,
                    kind: SyncErrorKind::IdentifierMismatch {
                        expected: expected.to_str_lossy().into_owned(),
                        expected_stream: StreamKind::Forward,
                        found: found.to_str_lossy().into_owned(),
                        found_stream: stream,
                    },
                });
            }
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for SyncReader<R> {
    type Item = Result<ReadSet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_read_set().transpose()
    }
}
