#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]

use std::{fmt::Display, path::Path};

use csv::{ReaderBuilder, Trim};
use fgoxide::io::Io;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::barcode_table::{BarcodeTable, BarcodeTableError};

/// The bases that are allowed in the [`SampleMetadata::barcode`].
const ALLOWED_BASES: &[u8] = &[b'A', b'C', b'T', b'G'];

/// The optional line number from the [`SampleMetadata`] file where an error ocurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The reason that a barcode has been deemed invalid.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBase(char),
}

impl Display for ReasonBarcodeInvalid {
    /// Proper error wording for each reason a barcode is invalid.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyString => write!(f, "Barcode is an empty string"),
            Self::InvalidBase(base) => write!(f, "Barcode contains the non-ACGT base {:?}", base),
        }
    }
}

/// The error that may occur when loading the sample metadata.
#[derive(Error, Debug)]
pub enum SampleMetadataError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The sample metadata file was empty")]
    Empty,

    #[error("Unable to deserialize line number {line}")]
    DeserializeRecord { source: csv::Error, line: usize },

    #[error("Invalid barcode sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode { barcode: String, id: String, reason: ReasonBarcodeInvalid, line: ErrorLine },

    #[error("Invalid sample id `{id}` on line {line}: {reason}")]
    InvalidSampleId { id: String, reason: &'static str, line: usize },

    #[error("The sample on line {line} uses the name reserved for unassigned reads: {id}")]
    ReservedSampleId { id: String, line: usize },

    #[error(transparent)]
    BarcodeTable(#[from] BarcodeTableError),
}

/// Metadata about a sample: its identifier and expected barcode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Hash, Eq)]
pub struct SampleMetadata {
    /// The unique identifier for the sample.
    #[serde(alias = "Sample_ID", rename(serialize = "Sample_ID"))]
    pub sample_id: String,

    /// The sample barcode sequence.
    #[serde(alias = "Sample_Barcode", rename(serialize = "Sample_Barcode"))]
    pub barcode: String,

    /// The line number in the input in which this sample was defined
    #[serde(skip)]
    pub line_number: Option<usize>,
}

impl SampleMetadata {
    /// Create a new [`SampleMetadata`] object, upper-casing and validating the barcode.
    ///
    /// # Errors
    ///
    /// - [`SampleMetadataError::InvalidBarcode`] if the barcode is invalid
    pub fn new(
        sample_id: String,
        barcode: &str,
        line_number: Option<usize>,
    ) -> Result<Self, SampleMetadataError> {
        let barcode = barcode.trim().to_ascii_uppercase();
        Self::validate_barcode(&barcode, &sample_id, line_number)?;
        Ok(Self { sample_id, barcode, line_number })
    }

    /// Run a set of validations on a barcode to ensure that it is well formed.
    ///
    /// # Errors
    ///
    /// - [`SampleMetadataError::InvalidBarcode`] if the barcode is invalid
    pub fn validate_barcode(
        barcode: &str,
        id: &str,
        line_number: Option<usize>,
    ) -> Result<(), SampleMetadataError> {
        let invalid = |reason| SampleMetadataError::InvalidBarcode {
            id: id.to_owned(),
            barcode: barcode.to_string(),
            reason,
            line: ErrorLine(line_number),
        };
        if barcode.is_empty() {
            return Err(invalid(ReasonBarcodeInvalid::EmptyString));
        }
        match barcode.bytes().find(|b| !ALLOWED_BASES.contains(b)) {
            Some(base) => Err(invalid(ReasonBarcodeInvalid::InvalidBase(base as char))),
            None => Ok(()),
        }
    }

    /// Read the samples from a CSV or TSV file, which may be gzipped.
    ///
    /// Files ending in `.tsv` or `.txt` (before any `.gz`) are tab-delimited; all others are
    /// comma-delimited. The first line must be a header with `Sample_ID` and `Sample_Barcode`
    /// columns.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        undetermined_name: &str,
    ) -> Result<Vec<Self>, SampleMetadataError> {
        let io = Io::default();
        let lines = io.read_lines(&path)?;
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Err(SampleMetadataError::Empty);
        }
        let data = lines.join("\n");
        Self::from_reader(data.as_bytes(), delimiter_for(path.as_ref()), undetermined_name)
    }

    /// Read samples from delimited text with a header line.
    pub fn from_reader<R: std::io::Read>(
        reader: R,
        delimiter: u8,
        undetermined_name: &str,
    ) -> Result<Vec<Self>, SampleMetadataError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(delimiter)
            .trim(Trim::All)
            .from_reader(reader);

        let mut samples = vec![];
        for (ordinal, record) in reader.deserialize().enumerate() {
            // Line numbers are +2 to account for the header and convert to 1-based counting
            let line = ordinal + 2;
            let record: SampleMetadata = record
                .map_err(|e| SampleMetadataError::DeserializeRecord { source: e, line })?;
            if record.sample_id.is_empty() {
                return Err(SampleMetadataError::InvalidSampleId {
                    id: record.sample_id,
                    reason: "the id is empty",
                    line,
                });
            }
            // Ids become output file names.
            if record.sample_id.contains(&['/', '\\'][..]) {
                return Err(SampleMetadataError::InvalidSampleId {
                    id: record.sample_id,
                    reason: "the id contains a path separator",
                    line,
                });
            }
            if record.sample_id == undetermined_name {
                return Err(SampleMetadataError::ReservedSampleId { id: record.sample_id, line });
            }
            samples.push(Self::new(record.sample_id, &record.barcode, Some(line))?);
        }
        if samples.is_empty() {
            return Err(SampleMetadataError::Empty);
        }
        Ok(samples)
    }

    /// Build the [`BarcodeTable`] for the given samples, in the order given.
    pub fn to_barcode_table(samples: &[Self]) -> Result<BarcodeTable, SampleMetadataError> {
        Ok(BarcodeTable::new(samples.iter().map(|s| (s.sample_id.clone(), s.barcode.as_str())))?)
    }
}

/// The field delimiter implied by a sample metadata file name.
fn delimiter_for(path: &Path) -> u8 {
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    if name.ends_with(".tsv") || name.ends_with(".txt") {
        b'\t'
    } else {
        b','
    }
}
