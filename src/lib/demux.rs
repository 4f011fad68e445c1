//! The demultiplexing run: pull read sets, classify their index reads and route them to samples.
//!
//! With one thread the run is a single pull-classify-route loop. With more, a [`ThreadReader`]
//! decodes the inputs in chunks on a background thread while batches of chunks are classified in
//! parallel. Each chunk renders its records into its own per-sample buffers and the buffers are
//! appended to the sinks in chunk order, so both modes write identical output.
//!
//! Any error closes every sink as [`RunStatus::Failed`]; cancellation closes them as
//! [`RunStatus::Cancelled`].

use std::{
    io::BufRead,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ahash::AHashMap;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    barcode_table::BarcodeTable,
    errors::{DemuxError, Result, StreamKind},
    matcher::{Assignment, BarcodeResolver, MatchParams, MatcherKind},
    metrics::DemuxMetrics,
    sample_writer::{OutputRouter, RunStatus, SinkFactory},
    sequence::Base,
    sync_reader::{ReadSet, SyncReader},
    thread_reader::{Chunk, ThreadReader},
};

/// How often progress is logged, in read sets.
const PROGRESS_INTERVAL: usize = 1_000_000;

/// Settings for a [`Demultiplexer`].
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    pub match_params: MatchParams,
    /// Forces a matcher instead of choosing one from the barcode length.
    pub matcher: Option<MatcherKind>,
    /// One thread runs sequentially; more classify chunks in parallel.
    pub threads: usize,
    /// The number of read sets per chunk in the parallel mode.
    pub chunksize: NonZeroUsize,
    /// Count the unassigned barcodes.
    pub collect_unmatched: bool,
}

/// A shared flag for stopping a run between read sets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The outcome of a run that did not fail.
#[derive(Debug)]
pub struct DemuxSummary {
    pub status: RunStatus,
    pub metrics: DemuxMetrics,
}

/// The rendered output of one chunk for one sample.
#[derive(Debug, Default)]
struct SampleBuffer {
    forward: Vec<u8>,
    reverse: Vec<u8>,
    count: usize,
}

/// One classified chunk, keyed by table entry (`None` for undetermined).
struct Shard {
    buffers: AHashMap<Option<usize>, SampleBuffer>,
    metrics: DemuxMetrics,
}

/// Classifies read sets by their index read and routes them to per-sample outputs.
pub struct Demultiplexer {
    resolver: BarcodeResolver,
    config: DemuxConfig,
    cancel: CancellationToken,
}

impl Demultiplexer {
    /// Create a new [`Demultiplexer`], warning about barcodes that are too close to be told apart.
    pub fn new(table: BarcodeTable, config: DemuxConfig) -> Self {
        let collisions = table.warn_on_collisions(config.match_params.max_mismatches);
        if collisions > 0 {
            warn!("Found {} pairs of barcodes that may produce ambiguous assignments", collisions);
        }
        let resolver = BarcodeResolver::new(table, config.match_params, config.matcher);
        Self { resolver, config, cancel: CancellationToken::new() }
    }

    /// Use the given token to stop the run early.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn resolver(&self) -> &BarcodeResolver {
        &self.resolver
    }

    /// Resolve the index bases of the read set numbered `record` (1-based).
    pub fn classify(&self, observed: &[Base], record: usize) -> Result<Assignment> {
        self.resolver.resolve(observed).map_err(|kind| DemuxError::Format {
            stream: StreamKind::Index,
            record,
            kind,
        })
    }

    /// The sample id for an assignment, `None` when unassigned.
    fn sample_name(&self, assignment: &Assignment) -> Option<&str> {
        self.resolver.entry(assignment).map(|e| e.sample_id.as_str())
    }

    fn new_metrics(&self) -> DemuxMetrics {
        DemuxMetrics::new(self.resolver.table().len(), self.config.collect_unmatched)
    }

    /// Demultiplex every read set of the inputs opened by `open` into `router`.
    ///
    /// `open` runs on the driver thread in the sequential mode and on the reader thread in the
    /// parallel mode. The router is closed before returning: committed if the input was
    /// exhausted, marked incomplete if the run was cancelled, and discarded on any error.
    pub fn run<R, O, F>(&self, open: O, mut router: OutputRouter<F>) -> Result<DemuxSummary>
    where
        R: BufRead + 'static,
        O: FnOnce() -> Result<SyncReader<R>> + Send + 'static,
        F: SinkFactory,
    {
        let open = move || {
            let reader = open()?;
            if reader.has_index() {
                Ok(reader)
            } else {
                Err(DemuxError::MissingIndexStream)
            }
        };
        info!(
            "Demultiplexing {} reads against {} samples with {} thread(s)",
            if router.is_paired() { "paired-end" } else { "single-end" },
            self.resolver.table().len(),
            self.config.threads
        );
        let outcome = if self.config.threads > 1 {
            self.run_parallel(open, &mut router)
        } else {
            open().and_then(|reader| self.run_sequential(reader, &mut router))
        };
        match outcome {
            Ok((metrics, status)) => {
                router.close(status)?;
                info!(
                    "Processed {} read sets ({} assigned); run {:?}",
                    metrics.total_read_sets(),
                    metrics.assigned(),
                    status
                );
                Ok(DemuxSummary { status, metrics })
            }
            Err(e) => {
                if let Err(close_error) = router.close(RunStatus::Failed) {
                    warn!("Failed to discard output after error: {}", close_error);
                }
                Err(e)
            }
        }
    }

    fn run_sequential<R, F>(
        &self,
        mut reader: SyncReader<R>,
        router: &mut OutputRouter<F>,
    ) -> Result<(DemuxMetrics, RunStatus)>
    where
        R: BufRead,
        F: SinkFactory,
    {
        let mut metrics = self.new_metrics();
        loop {
            if self.cancel.is_cancelled() {
                info!("Cancelled after {} read sets", metrics.total_read_sets());
                return Ok((metrics, RunStatus::Cancelled));
            }
            let read_set = match reader.next_read_set()? {
                Some(read_set) => read_set,
                None => return Ok((metrics, RunStatus::Complete)),
            };
            let observed = index_bases(&read_set)?;
            let assignment = self.classify(&observed, reader.read_sets())?;
            metrics.record(&assignment, &observed);
            router.route(&read_set, self.sample_name(&assignment))?;
            if reader.read_sets() % PROGRESS_INTERVAL == 0 {
                info!("Processed {} read sets", reader.read_sets());
            }
        }
    }

    fn run_parallel<R, O, F>(
        &self,
        open: O,
        router: &mut OutputRouter<F>,
    ) -> Result<(DemuxMetrics, RunStatus)>
    where
        R: BufRead + 'static,
        O: FnOnce() -> Result<SyncReader<R>> + Send + 'static,
        F: SinkFactory,
    {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(self.config.threads).build()?;
        let reader = ThreadReader::new(open, self.config.chunksize);
        let mut metrics = self.new_metrics();
        let mut next_record = 1;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                info!("Cancelled after {} read sets", metrics.total_read_sets());
                break Ok(RunStatus::Cancelled);
            }
            let batch: Vec<Chunk> = reader.rx.iter().take(self.config.threads).collect();
            if batch.is_empty() {
                break Ok(RunStatus::Complete);
            }
            let mut starts = Vec::with_capacity(batch.len());
            for chunk in &batch {
                starts.push(next_record);
                if let Ok(read_sets) = chunk {
                    next_record += read_sets.len();
                }
            }
            debug!("Classifying {} chunks starting at read set {}", batch.len(), starts[0]);

            let shards: Vec<Result<Shard>> = pool.install(|| {
                batch
                    .into_par_iter()
                    .zip(starts)
                    .map(|(chunk, start)| chunk.and_then(|sets| self.classify_chunk(&sets, start)))
                    .collect()
            });
            if let Err(e) = self.write_shards(shards, router, &mut metrics) {
                break Err(e);
            }
        };
        reader.join();
        outcome.map(|status| (metrics, status))
    }

    /// Classify a chunk of read sets, the first of which is read set number `start`.
    fn classify_chunk(&self, read_sets: &[ReadSet], start: usize) -> Result<Shard> {
        let mut shard = Shard { buffers: AHashMap::new(), metrics: self.new_metrics() };
        for (offset, read_set) in read_sets.iter().enumerate() {
            let observed = index_bases(read_set)?;
            let assignment = self.classify(&observed, start + offset)?;
            shard.metrics.record(&assignment, &observed);
            let buffer = shard.buffers.entry(assignment.sample_index()).or_default();
            read_set.forward.copy_to_vec(&mut buffer.forward);
            if let Some(reverse) = &read_set.reverse {
                reverse.copy_to_vec(&mut buffer.reverse);
            }
            buffer.count += 1;
        }
        Ok(shard)
    }

    /// Append classified shards to the router in order, stopping at the first failed shard.
    fn write_shards<F: SinkFactory>(
        &self,
        shards: Vec<Result<Shard>>,
        router: &mut OutputRouter<F>,
        metrics: &mut DemuxMetrics,
    ) -> Result<()> {
        for shard in shards {
            let Shard { buffers, metrics: shard_metrics } = shard?;
            let mut buffers: Vec<_> = buffers.into_iter().collect();
            buffers.sort_unstable_by_key(|(index, _)| *index);
            for (index, buffer) in buffers {
                let name = index.map(|i| self.resolver.table().entries()[i].sample_id.as_str());
                router.write_rendered(name, &buffer.forward, &buffer.reverse, buffer.count)?;
            }
            let before = metrics.total_read_sets();
            metrics.update_with(shard_metrics);
            if before / PROGRESS_INTERVAL != metrics.total_read_sets() / PROGRESS_INTERVAL {
                info!("Processed {} read sets", metrics.total_read_sets());
            }
        }
        Ok(())
    }
}

/// The bases of the index read of a read set.
fn index_bases(read_set: &ReadSet) -> Result<Vec<Base>> {
    read_set.index.as_ref().map(|index| index.seq()).ok_or(DemuxError::MissingIndexStream)
}
