//! Functionality pertaining to the collection of metrics during demultiplexing.
//!
//! A [`DemuxMetrics`] counts read sets per sample and per unassigned reason. In the parallel mode
//! every shard collects its own [`DemuxMetrics`] and they are merged with
//! [`DemuxMetrics::update_with`].
//!
//! The [`UnmatchedCounter`] keeps track of the most frequently seen unassigned barcodes. Each time
//! the number of keys exceeds a set limit the barcodes are sorted by most to least frequent, taking
//! only the top N barcodes and dropping the rest.
//!
//! All metrics are writable to files.

use std::path::Path;

use ahash::AHashMap;
use anyhow::Result;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    barcode_table::BarcodeTable,
    matcher::{Assignment, NoMatchReason},
    sequence::{bases_to_string, Base},
};

/// The max number of keys the hash can retain before re-sizing
pub const DEFAULT_UNMATCHED_MAX_COUNTER_SIZE: usize = 5_000_000;
/// The number of keys to downsize to
pub const DEFAULT_UNMATCHED_DOWNSIZE_TO: usize = 5_000;

pub const PER_SAMPLE_METRICS_FILENAME: &str = "per_sample_metrics.tsv";
pub const RUN_METRICS_FILENAME: &str = "run_metrics.tsv";
pub const MOST_FREQUENT_UNMATCHED_FILENAME: &str = "most_frequent_unmatched.tsv";

/// Container for tracking the number of times each unmatched barcode has been seen.
#[derive(Debug, Clone)]
pub struct UnmatchedCounter {
    /// The unmatched barcode counter.
    unmatched_counter: AHashMap<Vec<Base>, usize>,
    /// The max number of keys that can be held before downsizing.
    max_counter_size: usize,
    /// The number of keys to retain when downsizing.
    downsize_to: usize,
}

impl Default for UnmatchedCounter {
    fn default() -> Self {
        Self::new(DEFAULT_UNMATCHED_MAX_COUNTER_SIZE, DEFAULT_UNMATCHED_DOWNSIZE_TO)
    }
}

impl UnmatchedCounter {
    /// Create a new [`UnmatchedCounter`].
    ///
    /// # Argument
    /// - `max_counter_size` - the max number of keys the internal hashmap can contain before downsizing.
    /// - `downsize_to` - the number of keys to retain when downsizing.
    pub fn new(max_counter_size: usize, downsize_to: usize) -> Self {
        Self { unmatched_counter: AHashMap::new(), max_counter_size, downsize_to }
    }

    /// Count one more occurrence of `barcode`.
    pub fn insert(&mut self, barcode: &[Base]) {
        self.insert_count(barcode, 1);
    }

    /// Count `count` more occurrences of `barcode`, downsizing first if the counter is full.
    pub fn insert_count(&mut self, barcode: &[Base], count: usize) {
        if let Some(counter) = self.unmatched_counter.get_mut(barcode) {
            *counter += count;
            return;
        }
        if self.unmatched_counter.len() >= self.max_counter_size {
            self.downsize();
        }
        self.unmatched_counter.insert(barcode.to_vec(), count);
    }

    /// Downsize the counter to `downsize_to` keys.
    ///
    /// Note, this is requires sorting they map by values and creation of a new hashmap.
    pub fn downsize(&mut self) {
        let new = AHashMap::with_capacity(self.downsize_to);
        let previous = std::mem::replace(&mut self.unmatched_counter, new);
        self.unmatched_counter.extend(
            previous
                .into_iter()
                .sorted_unstable_by(|(a_bc, a_count), (b_bc, b_count)| {
                    b_count.cmp(a_count).then_with(|| a_bc.cmp(b_bc))
                })
                .take(self.downsize_to),
        );
    }

    /// Merge the counts of another counter into this one.
    pub fn update_with(&mut self, other: Self) {
        for (barcode, count) in other.unmatched_counter {
            self.insert_count(&barcode, count);
        }
    }

    pub fn len(&self) -> usize {
        self.unmatched_counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unmatched_counter.is_empty()
    }

    /// The `n` most frequent barcodes, most frequent first, ties broken by barcode.
    pub fn most_frequent(&self, n: usize) -> Vec<BarcodeCount> {
        self.unmatched_counter
            .iter()
            .map(|(barcode, count)| BarcodeCount { barcode: bases_to_string(barcode), count: *count })
            .sorted_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.barcode.cmp(&b.barcode)))
            .take(n)
            .collect()
    }

    /// Write the top `n` unmatched barcodes to a `most_frequent_unmatched.tsv` file in the specified directory.
    pub fn to_file<P: AsRef<Path>>(&self, output_dir: P, n: usize) -> Result<()> {
        let output_path = output_dir.as_ref().join(MOST_FREQUENT_UNMATCHED_FILENAME);
        let delim = DelimFile::default();
        delim.write_tsv(&output_path, self.most_frequent(n))?;
        Ok(())
    }
}

/// The per-sample match counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleCounts {
    /// The number of read sets with perfect barcode matches.
    pub perfect_matches: usize,
    /// The number of read sets with only a single mismatch.
    pub one_mismatch_matches: usize,
    /// The total number of read sets attributed to this sample.
    pub templates: usize,
}

impl SampleCounts {
    pub fn update_with(&mut self, other: &Self) {
        self.perfect_matches += other.perfect_matches;
        self.one_mismatch_matches += other.one_mismatch_matches;
        self.templates += other.templates;
    }

    fn record(&mut self, distance: Option<usize>) {
        match distance {
            Some(0) => self.perfect_matches += 1,
            Some(1) => self.one_mismatch_matches += 1,
            _ => (),
        }
        self.templates += 1;
    }
}

/// Counts for a whole run, or for one shard of it.
#[derive(Debug, Clone)]
pub struct DemuxMetrics {
    /// One entry per [`BarcodeTable`] entry, in table order.
    pub per_sample: Vec<SampleCounts>,
    pub undetermined: SampleCounts,
    pub too_distant: usize,
    pub ambiguous: usize,
    pub too_many_no_calls: usize,
    /// Only collected when requested.
    pub unmatched: Option<UnmatchedCounter>,
}

impl DemuxMetrics {
    pub fn new(num_samples: usize, collect_unmatched: bool) -> Self {
        Self {
            per_sample: vec![SampleCounts::default(); num_samples],
            undetermined: SampleCounts::default(),
            too_distant: 0,
            ambiguous: 0,
            too_many_no_calls: 0,
            unmatched: collect_unmatched.then(UnmatchedCounter::default),
        }
    }

    /// Count one classified read set.
    pub fn record(&mut self, assignment: &Assignment, observed: &[Base]) {
        match *assignment {
            Assignment::Assigned { sample_index, distance } => {
                self.per_sample[sample_index].record(Some(distance));
            }
            Assignment::Unassigned { reason } => {
                self.undetermined.record(None);
                match reason {
                    NoMatchReason::TooDistant => self.too_distant += 1,
                    NoMatchReason::Ambiguous => self.ambiguous += 1,
                    NoMatchReason::TooManyNoCalls => self.too_many_no_calls += 1,
                }
                if let Some(unmatched) = self.unmatched.as_mut() {
                    unmatched.insert(observed);
                }
            }
        }
    }

    /// Merge the metrics of another shard into this one.
    pub fn update_with(&mut self, other: Self) {
        for (mine, theirs) in self.per_sample.iter_mut().zip(other.per_sample.iter()) {
            mine.update_with(theirs);
        }
        self.undetermined.update_with(&other.undetermined);
        self.too_distant += other.too_distant;
        self.ambiguous += other.ambiguous;
        self.too_many_no_calls += other.too_many_no_calls;
        if let (Some(mine), Some(theirs)) = (self.unmatched.as_mut(), other.unmatched) {
            mine.update_with(theirs);
        }
    }

    pub fn assigned(&self) -> usize {
        self.per_sample.iter().map(|s| s.templates).sum()
    }

    pub fn total_read_sets(&self) -> usize {
        self.assigned() + self.undetermined.templates
    }

    /// The run level summary row.
    pub fn run_metrics(&self, complete: bool) -> RunMetrics {
        RunMetrics {
            total_read_sets: self.total_read_sets(),
            assigned: self.assigned(),
            unassigned_too_distant: self.too_distant,
            unassigned_ambiguous: self.ambiguous,
            unassigned_too_many_no_calls: self.too_many_no_calls,
            complete,
        }
    }

    /// One row per sample in table order, followed by the undetermined row.
    pub fn per_sample_metrics(
        &self,
        table: &BarcodeTable,
        undetermined_name: &str,
    ) -> Vec<SampleMetricsProcessed> {
        let total = self.total_read_sets();
        let fraction = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        table
            .entries()
            .iter()
            .zip(self.per_sample.iter())
            .map(|(entry, counts)| (entry.sample_id.clone(), bases_to_string(&entry.barcode), counts))
            .chain(std::iter::once((
                undetermined_name.to_string(),
                "N".repeat(table.barcode_length()),
                &self.undetermined,
            )))
            .map(|(sample_id, barcode, counts)| SampleMetricsProcessed {
                sample_id,
                barcode,
                templates: counts.templates,
                perfect_matches: counts.perfect_matches,
                one_mismatch_matches: counts.one_mismatch_matches,
                frac_templates: fraction(counts.templates),
            })
            .collect()
    }

    /// Write the metrics files into `output_dir`.
    ///
    /// This will create `per_sample_metrics.tsv`, `run_metrics.tsv` and, when unmatched barcodes
    /// were collected and `most_unmatched` is positive, `most_frequent_unmatched.tsv`.
    pub fn write_metrics_files<P: AsRef<Path>>(
        &self,
        table: &BarcodeTable,
        undetermined_name: &str,
        output_dir: P,
        most_unmatched: usize,
        complete: bool,
    ) -> Result<()> {
        let delim = DelimFile::default();
        delim.write_tsv(
            &output_dir.as_ref().join(PER_SAMPLE_METRICS_FILENAME),
            self.per_sample_metrics(table, undetermined_name),
        )?;
        delim.write_tsv(
            &output_dir.as_ref().join(RUN_METRICS_FILENAME),
            std::iter::once(self.run_metrics(complete)),
        )?;
        if let Some(unmatched) = self.unmatched.as_ref().filter(|_| most_unmatched > 0) {
            unmatched.to_file(&output_dir, most_unmatched)?;
        }
        Ok(())
    }
}

/// The high level metrics for all read sets that were demultiplexed.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetrics {
    /// The total number of read sets classified.
    pub total_read_sets: usize,
    /// The number of read sets assigned to a sample.
    pub assigned: usize,
    pub unassigned_too_distant: usize,
    pub unassigned_ambiguous: usize,
    pub unassigned_too_many_no_calls: usize,
    /// False if the run was cancelled before the input was exhausted.
    pub complete: bool,
}

/// A helper struct fot serializing and deserializing barcode counts.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BarcodeCount {
    /// The barcode.
    pub barcode: String,
    /// the count of the barcode.
    pub count: usize,
}

/// The per-sample metrics row.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SampleMetricsProcessed {
    /// The sample identifier from the sample metadata.
    pub sample_id: String,
    /// The expected barcode bases; all `N` for the undetermined sample.
    pub barcode: String,
    /// The total number of read sets matching the given barcode.
    pub templates: usize,
    /// The number of read sets that match the given barcode perfectly.
    pub perfect_matches: usize,
    /// The number of read sets that match the given barcode with exactly one mismatch.
    pub one_mismatch_matches: usize,
    /// The fraction of all read sets that match the given barcode.
    pub frac_templates: f64,
}
