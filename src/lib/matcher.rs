//! Resolve observed index reads to samples by bounded hamming distance.
//!
//! Three interchangeable [`Matcher`]s implement the same rule: a linear scan, a linear scan behind
//! a bounded cache, and a lookup table of every observable barcode within the mismatch tolerance
//! that is precomputed when the resolver is built.

use ahash::{AHashMap, AHashSet};
use anyhow::anyhow;
use cached::SizedCache;
use clap::{ArgEnum, PossibleValue};
use itertools::Itertools;
use log::debug;
use parking_lot::Mutex;
use strum::IntoEnumIterator;

use crate::barcode_table::{BarcodeEntry, BarcodeTable};
use crate::errors::FormatErrorKind;
use crate::sequence::Base;

/// The name given to the "undetermined" sample.
pub const UNDETERMINED_NAME: &str = "Undetermined";

/// Barcodes up to this length use the [`PreComputeMatcher`] unless overridden.
pub const PRECOMPUTE_MAX_BARCODE_LENGTH: usize = 12;

/// Tolerances above this use the [`CachedHammingDistanceMatcher`] unless overridden.
pub const PRECOMPUTE_MAX_MISMATCHES: usize = 3;

/// Number of observed barcodes remembered by the [`CachedHammingDistanceMatcher`].
const CACHE_SIZE: usize = 100_000;

/// Why an observed barcode was not assigned to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoMatchReason {
    /// The closest barcode is further than the mismatch tolerance.
    TooDistant,
    /// Two or more barcodes are equally close (or within `min_delta` of each other).
    Ambiguous,
    /// The observed barcode has more no-calls than allowed.
    TooManyNoCalls,
}

/// The outcome of resolving one observed barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assignment {
    Assigned { sample_index: usize, distance: usize },
    Unassigned { reason: NoMatchReason },
}

impl Assignment {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned { .. })
    }

    /// The index of the matched entry in the [`BarcodeTable`].
    pub fn sample_index(&self) -> Option<usize> {
        match self {
            Self::Assigned { sample_index, .. } => Some(*sample_index),
            Self::Unassigned { .. } => None,
        }
    }

    pub fn distance(&self) -> Option<usize> {
        match self {
            Self::Assigned { distance, .. } => Some(*distance),
            Self::Unassigned { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<NoMatchReason> {
        match self {
            Self::Assigned { .. } => None,
            Self::Unassigned { reason } => Some(*reason),
        }
    }
}

/// How far an observed barcode may be from the expected barcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchParams {
    /// The maximum hamming distance to the assigned barcode.
    pub max_mismatches: usize,
    /// The second best distance must exceed the best by more than this.
    pub min_delta: usize,
    /// Observed barcodes with more no-calls than this are never assigned.
    pub max_no_calls: Option<usize>,
}

impl MatchParams {
    pub fn new(max_mismatches: usize) -> Self {
        Self { max_mismatches, ..Self::default() }
    }
}

impl Default for MatchParams {
    fn default() -> Self {
        Self { max_mismatches: 1, min_delta: 0, max_no_calls: None }
    }
}

#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    LinearScan,
    CachedHammingDistance,
    PreCompute,
}

impl MatcherKind {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        MatcherKind::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }

    /// Pick the matcher for a table when none is requested explicitly.
    pub fn choose(barcode_length: usize, params: &MatchParams) -> Self {
        if barcode_length <= PRECOMPUTE_MAX_BARCODE_LENGTH
            && params.max_mismatches <= PRECOMPUTE_MAX_MISMATCHES
        {
            Self::PreCompute
        } else {
            Self::CachedHammingDistance
        }
    }
}

impl std::str::FromStr for MatcherKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::value_variants()
            .iter()
            .find(|v| v.to_possible_value().map_or(false, |p| p.matches(s, false)))
            .copied()
            .ok_or_else(|| anyhow!("Invalid variant: {}", s))
    }
}

/// The base trait for all matching algorithms.
///
/// The observed barcode is assumed to have the same length as the expected barcodes.
pub trait Matcher: Send + Sync {
    fn find(&self, observed: &[Base]) -> Assignment;
}

/// Hamming distance between equal length barcodes where a no-call never matches, even another
/// no-call.
#[inline]
pub fn hamming_distance(alpha: &[Base], beta: &[Base]) -> usize {
    alpha.iter().zip(beta.iter()).filter(|(a, b)| a != b || a.is_no_call()).count()
}

#[inline]
pub fn should_reject_delta(delta: usize, min_delta: usize) -> bool {
    delta <= min_delta
}

fn too_many_no_calls(observed: &[Base], params: &MatchParams) -> bool {
    params
        .max_no_calls
        .map_or(false, |max| observed.iter().filter(|b| b.is_no_call()).count() > max)
}

/// Compare the observed barcode to every expected barcode, keeping the best and second best.
fn find_independently(
    observed: &[Base],
    barcodes: &[Vec<Base>],
    params: &MatchParams,
) -> Assignment {
    if too_many_no_calls(observed, params) {
        return Assignment::Unassigned { reason: NoMatchReason::TooManyNoCalls };
    }
    let mut best_sample = barcodes.len();
    let mut best_dist = usize::MAX;
    let mut next_best_dist = usize::MAX;
    for (i, barcode) in barcodes.iter().enumerate() {
        let dist = hamming_distance(observed, barcode);
        if dist < best_dist {
            best_sample = i;
            next_best_dist = best_dist;
            best_dist = dist;
        } else if dist < next_best_dist {
            next_best_dist = dist;
        }
    }
    if best_sample == barcodes.len() || best_dist > params.max_mismatches {
        Assignment::Unassigned { reason: NoMatchReason::TooDistant }
    } else if should_reject_delta(next_best_dist - best_dist, params.min_delta) {
        Assignment::Unassigned { reason: NoMatchReason::Ambiguous }
    } else {
        Assignment::Assigned { sample_index: best_sample, distance: best_dist }
    }
}

fn barcodes_of(table: &BarcodeTable) -> Vec<Vec<Base>> {
    table.entries().iter().map(|e| e.barcode.clone()).collect()
}

/// Scans every expected barcode for each observed barcode.
pub struct LinearScanMatcher {
    barcodes: Vec<Vec<Base>>,
    params: MatchParams,
}

impl LinearScanMatcher {
    pub fn new(table: &BarcodeTable, params: MatchParams) -> Self {
        Self { barcodes: barcodes_of(table), params }
    }
}

impl Matcher for LinearScanMatcher {
    fn find(&self, observed: &[Base]) -> Assignment {
        find_independently(observed, &self.barcodes, &self.params)
    }
}

// Matches based on hamming distance with a cache
pub struct CachedHammingDistanceMatcher {
    barcodes: Vec<Vec<Base>>,
    params: MatchParams,
    cache: Mutex<SizedCache<Vec<Base>, Assignment>>,
}

impl CachedHammingDistanceMatcher {
    pub fn new(table: &BarcodeTable, params: MatchParams) -> Self {
        Self::with_cache_size(table, params, CACHE_SIZE)
    }

    pub fn with_cache_size(table: &BarcodeTable, params: MatchParams, cache_size: usize) -> Self {
        Self {
            barcodes: barcodes_of(table),
            params,
            cache: Mutex::new(SizedCache::with_size(cache_size)),
        }
    }
}

impl Matcher for CachedHammingDistanceMatcher {
    fn find(&self, observed: &[Base]) -> Assignment {
        let key = observed.to_vec();
        if let Some(res) = cached::Cached::cache_get(&mut *self.cache.lock(), &key) {
            return *res;
        }
        let result = find_independently(observed, &self.barcodes, &self.params);
        cached::Cached::cache_set(&mut *self.cache.lock(), key, result);
        result
    }
}

// Precompute allowable matches
pub struct PreComputeMatcher {
    params: MatchParams,
    lookup: AHashMap<Vec<Base>, Assignment>,
}

impl PreComputeMatcher {
    pub fn new(table: &BarcodeTable, params: MatchParams) -> Self {
        let lookup = Self::build_map(table, &params);
        debug!("Precomputed {} observable barcodes", lookup.len());
        Self { params, lookup }
    }

    /// Resolve every barcode that is within `max_mismatches` substitutions of an expected barcode.
    ///
    /// Anything absent from the map is further than `max_mismatches` from every expected barcode.
    pub fn build_map(table: &BarcodeTable, params: &MatchParams) -> AHashMap<Vec<Base>, Assignment> {
        let barcodes = barcodes_of(table);
        let observable: AHashSet<Vec<Base>> = barcodes
            .iter()
            .flat_map(|barcode| Self::all_permutations(barcode, params.max_mismatches))
            .collect();
        observable
            .into_iter()
            .map(|observed| {
                let assignment = find_independently(&observed, &barcodes, params);
                (observed, assignment)
            })
            .collect()
    }

    /// Generate every barcode with at most `max_mismatches` substitutions from `barcode`.
    fn all_permutations(barcode: &[Base], max_mismatches: usize) -> impl Iterator<Item = Vec<Base>> + '_ {
        // combinations(n) yields nothing when n > len
        let max_mismatches = max_mismatches.min(barcode.len());
        (0..barcode.len()).combinations(max_mismatches).flat_map(move |locations| {
            let mut options = barcode.iter().map(|b| vec![*b]).collect::<Vec<Vec<Base>>>();
            for location in locations {
                options[location] = Base::iter().collect();
            }
            options.into_iter().multi_cartesian_product()
        })
    }
}

impl Matcher for PreComputeMatcher {
    fn find(&self, observed: &[Base]) -> Assignment {
        if too_many_no_calls(observed, &self.params) {
            return Assignment::Unassigned { reason: NoMatchReason::TooManyNoCalls };
        }
        self.lookup
            .get(observed)
            .copied()
            .unwrap_or(Assignment::Unassigned { reason: NoMatchReason::TooDistant })
    }
}

/// Maps observed index sequences to entries of a [`BarcodeTable`].
pub struct BarcodeResolver {
    table: BarcodeTable,
    params: MatchParams,
    kind: MatcherKind,
    matcher: Box<dyn Matcher>,
}

impl BarcodeResolver {
    /// Build a resolver, choosing the matcher from the barcode length unless `kind` is given.
    pub fn new(table: BarcodeTable, params: MatchParams, kind: Option<MatcherKind>) -> Self {
        let kind = kind.unwrap_or_else(|| MatcherKind::choose(table.barcode_length(), &params));
        debug!("Using {:?} matcher", kind);
        let matcher: Box<dyn Matcher> = match kind {
            MatcherKind::LinearScan => Box::new(LinearScanMatcher::new(&table, params)),
            MatcherKind::CachedHammingDistance => {
                Box::new(CachedHammingDistanceMatcher::new(&table, params))
            }
            MatcherKind::PreCompute => Box::new(PreComputeMatcher::new(&table, params)),
        };
        Self { table, params, kind, matcher }
    }

    /// Resolve an observed barcode.
    ///
    /// The observed barcode must be as long as the expected barcodes.
    pub fn resolve(&self, observed: &[Base]) -> Result<Assignment, FormatErrorKind> {
        if observed.len() != self.table.barcode_length() {
            return Err(FormatErrorKind::BarcodeLengthMismatch {
                expected: self.table.barcode_length(),
                observed: observed.len(),
            });
        }
        Ok(self.matcher.find(observed))
    }

    /// The table entry an assignment refers to.
    pub fn entry(&self, assignment: &Assignment) -> Option<&BarcodeEntry> {
        assignment.sample_index().map(|i| &self.table.entries()[i])
    }

    pub fn table(&self) -> &BarcodeTable {
        &self.table
    }

    pub fn params(&self) -> &MatchParams {
        &self.params
    }

    pub fn kind(&self) -> MatcherKind {
        self.kind
    }
}
