//! The immutable mapping from expected barcodes to samples.

use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use log::warn;
use thiserror::Error;

use crate::sequence::{bases_from_str, bases_to_string, Base};

/// Reasons a [`BarcodeTable`] cannot be built.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BarcodeTableError {
    #[error("The barcode table must include at least one sample")]
    ZeroSamples,

    #[error("Invalid barcode sequence for {sample_id} `{barcode}` - {reason}")]
    InvalidBarcode { sample_id: String, barcode: String, reason: &'static str },

    #[error(
        "{sample_a}:{barcode_a} and {sample_b}:{barcode_b} have barcodes with different lengths."
    )]
    UnequalBarcodeLengths {
        sample_a: String,
        barcode_a: String,
        sample_b: String,
        barcode_b: String,
    },

    #[error("Duplicate sample identifier found: {sample_id}")]
    DuplicateSampleId { sample_id: String },

    #[error("Samples {sample_a} and {sample_b} share the barcode {barcode}")]
    DuplicateBarcode { sample_a: String, sample_b: String, barcode: String },
}

/// An expected barcode and the sample it identifies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarcodeEntry {
    pub sample_id: String,
    pub barcode: Vec<Base>,
}

/// A pair of barcodes that are too similar to be told apart reliably at a given tolerance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeCollision {
    pub sample_a: String,
    pub sample_b: String,
    pub distance: usize,
}

/// The set of expected barcodes, all the same length, each mapping to a distinct sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeTable {
    entries: Vec<BarcodeEntry>,
    barcode_length: usize,
}

impl BarcodeTable {
    /// Build a table from `(sample_id, barcode)` pairs.
    ///
    /// Barcodes are case-insensitive and must contain only `ACGT`.
    pub fn new<I, S, B>(samples: I) -> Result<Self, BarcodeTableError>
    where
        I: IntoIterator<Item = (S, B)>,
        S: Into<String>,
        B: AsRef<str>,
    {
        let mut entries = vec![];
        for (sample_id, raw) in samples {
            let sample_id = sample_id.into();
            let raw = raw.as_ref();
            let invalid = |reason| BarcodeTableError::InvalidBarcode {
                sample_id: sample_id.clone(),
                barcode: raw.to_string(),
                reason,
            };
            if raw.is_empty() {
                return Err(invalid("Barcode is an empty string"));
            }
            let barcode =
                bases_from_str(raw).ok_or_else(|| invalid("Barcode contains non-ACGT bases"))?;
            if barcode.iter().any(|b| b.is_no_call()) {
                return Err(invalid("Barcode contains non-ACGT bases"));
            }
            entries.push(BarcodeEntry { sample_id, barcode });
        }
        Self::from_entries(entries)
    }

    /// Build a table from already parsed entries, validating them.
    pub fn from_entries(entries: Vec<BarcodeEntry>) -> Result<Self, BarcodeTableError> {
        let first = entries.first().ok_or(BarcodeTableError::ZeroSamples)?;
        let barcode_length = first.barcode.len();

        let mut ids = AHashSet::new();
        let mut barcodes: AHashMap<&[Base], &str> = AHashMap::new();
        for entry in &entries {
            if entry.barcode.len() != barcode_length {
                return Err(BarcodeTableError::UnequalBarcodeLengths {
                    sample_a: first.sample_id.clone(),
                    barcode_a: bases_to_string(&first.barcode),
                    sample_b: entry.sample_id.clone(),
                    barcode_b: bases_to_string(&entry.barcode),
                });
            }
            if !ids.insert(entry.sample_id.as_str()) {
                return Err(BarcodeTableError::DuplicateSampleId {
                    sample_id: entry.sample_id.clone(),
                });
            }
            if let Some(other) = barcodes.insert(&entry.barcode, &entry.sample_id) {
                return Err(BarcodeTableError::DuplicateBarcode {
                    sample_a: other.to_string(),
                    sample_b: entry.sample_id.clone(),
                    barcode: bases_to_string(&entry.barcode),
                });
            }
        }

        Ok(Self { entries, barcode_length })
    }

    pub fn entries(&self) -> &[BarcodeEntry] {
        &self.entries
    }

    /// The length shared by every barcode in the table.
    pub fn barcode_length(&self) -> usize {
        self.barcode_length
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find every pair of barcodes within `2 * tolerance` of each other.
    ///
    /// An observed barcode can then be within `tolerance` of both, which makes assignments between
    /// the two samples systematically ambiguous.
    pub fn collisions(&self, tolerance: usize) -> Vec<BarcodeCollision> {
        self.entries
            .iter()
            .tuple_combinations()
            .filter_map(|(a, b)| {
                let distance =
                    a.barcode.iter().zip(b.barcode.iter()).filter(|(x, y)| x != y).count();
                (distance <= tolerance.saturating_mul(2)).then(|| BarcodeCollision {
                    sample_a: a.sample_id.clone(),
                    sample_b: b.sample_id.clone(),
                    distance,
                })
            })
            .collect()
    }

    /// Log a warning for every pair of barcodes that collide at the given tolerance.
    pub fn warn_on_collisions(&self, tolerance: usize) -> usize {
        let collisions = self.collisions(tolerance);
        for collision in &collisions {
            warn!(
                "Barcodes for {} and {} are within hamming distance {} (<= 2 x {} allowed mismatches); reads between them may be unassignable",
                collision.sample_a, collision.sample_b, collision.distance, tolerance
            );
        }
        collisions.len()
    }
}
