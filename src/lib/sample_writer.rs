//! Per-sample output sinks and the router that feeds them.
//!
//! Sinks are created lazily the first time a sample is assigned a read set, so samples that see
//! no reads produce no output. Closing the router decides the fate of everything written: file
//! sinks write under an in-progress name and are only renamed to their final name once the run
//! has completed.

use std::{
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use ahash::AHashMap;
use fgoxide::io::Io;
use log::{debug, warn};

use crate::{errors::Result, sync_reader::ReadSet, utils::filename};

/// Prefix of output files while the run is still writing them.
pub const IN_PROGRESS_PREFIX: &str = "IN_PROGRESS.";

/// Prefix of output files left behind by a cancelled run.
pub const INCOMPLETE_PREFIX: &str = "INCOMPLETE.";

/// How a run ended, which decides what happens to the output already written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// Every read set was routed; output is committed.
    Complete,
    /// The run hit a fatal error; output is discarded.
    Failed,
    /// The run was stopped early; output is kept but marked incomplete.
    Cancelled,
}

/// An append-only destination for one FASTQ stream of one sample.
pub trait SampleSink: Write {
    /// Flush and release the sink.
    fn close(self: Box<Self>, status: RunStatus) -> Result<()>;
}

/// Creates the sinks for a sample on first use.
pub trait SinkFactory {
    /// Create the sink for the given sample and mate (1 for forward, 2 for reverse).
    fn create(&mut self, sample_name: &str, mate: usize) -> Result<Box<dyn SampleSink>>;
}

/// Writes FASTQ files into an output directory, gzip compressed unless `compressed` is false.
pub struct FileSinkFactory {
    output_dir: PathBuf,
    compressed: bool,
    io: Io,
}

impl FileSinkFactory {
    pub fn new<P: AsRef<Path>>(output_dir: P, compressed: bool) -> Self {
        Self { output_dir: output_dir.as_ref().to_path_buf(), compressed, io: Io::default() }
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&mut self, sample_name: &str, mate: usize) -> Result<Box<dyn SampleSink>> {
        let name = filename(sample_name, mate, self.compressed);
        let in_progress = self.output_dir.join(format!("{}{}", IN_PROGRESS_PREFIX, name));
        let incomplete = self.output_dir.join(format!("{}{}", INCOMPLETE_PREFIX, name));
        let final_path = self.output_dir.join(name);
        debug!("Creating output file {:?}", in_progress);
        let writer = self.io.new_writer(&in_progress)?;
        Ok(Box::new(FileSink { writer, in_progress, incomplete, final_path }))
    }
}

/// A FASTQ file that is renamed into place when closed.
struct FileSink {
    writer: BufWriter<Box<dyn Write>>,
    in_progress: PathBuf,
    incomplete: PathBuf,
    final_path: PathBuf,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl SampleSink for FileSink {
    /// Flush the file and move it according to `status`.
    ///
    /// The gzip trailer is written when the writer is dropped, and an error writing it cannot be
    /// observed here. A file whose buffered data flushed cleanly is therefore committed even if
    /// its trailer failed to write.
    fn close(self: Box<Self>, status: RunStatus) -> Result<()> {
        let FileSink { mut writer, in_progress, incomplete, final_path } = *self;
        let flushed = writer.flush();
        drop(writer);
        match status {
            RunStatus::Failed => std::fs::remove_file(&in_progress)?,
            RunStatus::Complete => {
                flushed?;
                std::fs::rename(&in_progress, &final_path)?;
            }
            RunStatus::Cancelled => {
                flushed?;
                std::fs::rename(&in_progress, &incomplete)?;
            }
        }
        Ok(())
    }
}

/// The sinks for one sample: the forward stream and, when paired, the reverse stream.
pub struct SampleWriter {
    pub name: String,
    sinks: Vec<Box<dyn SampleSink>>,
    pub read_sets_written: usize,
}

impl SampleWriter {
    pub fn new(name: String, sinks: Vec<Box<dyn SampleSink>>) -> Self {
        Self { name, sinks, read_sets_written: 0 }
    }

    /// Write the forward and reverse records of a read set.
    pub fn write_read_set(&mut self, read_set: &ReadSet, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.clear();
        read_set.forward.copy_to_vec(buffer);
        self.sinks[0].write_all(buffer)?;
        if let (Some(reverse), Some(sink)) = (&read_set.reverse, self.sinks.get_mut(1)) {
            buffer.clear();
            reverse.copy_to_vec(buffer);
            sink.write_all(buffer)?;
        }
        self.read_sets_written += 1;
        Ok(())
    }

    /// Write already rendered FASTQ text holding `count` read sets.
    pub fn write_rendered(&mut self, forward: &[u8], reverse: &[u8], count: usize) -> Result<()> {
        self.sinks[0].write_all(forward)?;
        if let Some(sink) = self.sinks.get_mut(1) {
            sink.write_all(reverse)?;
        }
        self.read_sets_written += count;
        Ok(())
    }

    /// Close every sink, returning the first error encountered.
    pub fn close(self, status: RunStatus) -> Result<()> {
        let mut result = Ok(());
        for sink in self.sinks {
            if let Err(e) = sink.close(status) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// Appends routed read sets to the sink of their sample.
pub struct OutputRouter<F: SinkFactory> {
    factory: F,
    paired: bool,
    undetermined_name: String,
    writers: AHashMap<String, SampleWriter>,
    buffer: Vec<u8>,
}

impl<F: SinkFactory> OutputRouter<F> {
    pub fn new(factory: F, paired: bool, undetermined_name: impl Into<String>) -> Self {
        Self {
            factory,
            paired,
            undetermined_name: undetermined_name.into(),
            writers: AHashMap::new(),
            buffer: Vec::with_capacity(1024),
        }
    }

    pub fn undetermined_name(&self) -> &str {
        &self.undetermined_name
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    fn writer(&mut self, sample: Option<&str>) -> Result<&mut SampleWriter> {
        let name = sample.unwrap_or(&self.undetermined_name);
        if !self.writers.contains_key(name) {
            let mates = if self.paired { 2 } else { 1 };
            let mut sinks: Vec<Box<dyn SampleSink>> = Vec::with_capacity(mates);
            for mate in 1..=mates {
                match self.factory.create(name, mate) {
                    Ok(sink) => sinks.push(sink),
                    Err(e) => {
                        // The sinks already created are not registered, so discard them here.
                        for sink in sinks {
                            if let Err(close_error) = sink.close(RunStatus::Failed) {
                                warn!("Failed to discard output for sample {}: {}", name, close_error);
                            }
                        }
                        return Err(e);
                    }
                }
            }
            self.writers.insert(name.to_string(), SampleWriter::new(name.to_string(), sinks));
        }
        match self.writers.get_mut(name) {
            Some(writer) => Ok(writer),
            None => unreachable!(),
        }
    }

    /// Append a read set to its sample's sink, or the undetermined sink when `sample` is `None`.
    pub fn route(&mut self, read_set: &ReadSet, sample: Option<&str>) -> Result<()> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.writer(sample).and_then(|w| w.write_read_set(read_set, &mut buffer));
        self.buffer = buffer;
        result
    }

    /// Append rendered FASTQ text for `count` read sets of one sample.
    pub fn write_rendered(
        &mut self,
        sample: Option<&str>,
        forward: &[u8],
        reverse: &[u8],
        count: usize,
    ) -> Result<()> {
        self.writer(sample)?.write_rendered(forward, reverse, count)
    }

    /// The names of the samples that have had a sink created, sorted.
    pub fn sample_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.writers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn read_sets_written(&self, sample: &str) -> usize {
        self.writers.get(sample).map_or(0, |w| w.read_sets_written)
    }

    /// Flush and release every sink, committing, discarding or marking output per `status`.
    pub fn close(self, status: RunStatus) -> Result<()> {
        debug!("Closing {} sample writers with status {:?}", self.writers.len(), status);
        let mut result = Ok(());
        for (name, writer) in self.writers {
            if let Err(e) = writer.close(status) {
                warn!("Failed to close the output for sample {}: {}", name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::{sync_reader::test::sync_reader, utils::test_commons::slurp_fastq};

    /// What a [`MemorySink`] saw: its bytes and how it was closed.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct MemoryOutput {
        pub bytes: Vec<u8>,
        pub status: Option<RunStatus>,
    }

    pub(crate) type SharedOutputs = Arc<Mutex<AHashMap<String, MemoryOutput>>>;

    /// Collects each sink's output in memory, keyed by `{sample}_R{mate}`.
    #[derive(Default, Clone)]
    pub(crate) struct MemorySinkFactory {
        pub outputs: SharedOutputs,
    }

    impl MemorySinkFactory {
        pub fn output(&self, key: &str) -> Option<MemoryOutput> {
            self.outputs.lock().get(key).cloned()
        }

        pub fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.outputs.lock().keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    struct MemorySink {
        key: String,
        bytes: Vec<u8>,
        outputs: SharedOutputs,
    }

    impl Write for MemorySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SampleSink for MemorySink {
        fn close(self: Box<Self>, status: RunStatus) -> Result<()> {
            let MemorySink { key, bytes, outputs } = *self;
            outputs.lock().insert(key, MemoryOutput { bytes, status: Some(status) });
            Ok(())
        }
    }

    impl SinkFactory for MemorySinkFactory {
        fn create(&mut self, sample_name: &str, mate: usize) -> Result<Box<dyn SampleSink>> {
            let key = format!("{}_R{}", sample_name, mate);
            self.outputs.lock().insert(key.clone(), MemoryOutput::default());
            Ok(Box::new(MemorySink { key, bytes: vec![], outputs: self.outputs.clone() }))
        }
    }

    fn read_sets(paired: bool) -> Vec<ReadSet> {
        let fwd = "@q1\nACGT\n+\nIIII\n@q2\nTTTT\n+\nIIII\n@q3\nGGGG\n+\nIIII\n";
        let rev = "@q1\nAAAA\n+\n####\n@q2\nCCCC\n+\n####\n@q3\nNNNN\n+\n####\n";
        let idx = "@q1\nAC\n+\nII\n@q2\nTT\n+\nII\n@q3\nGG\n+\nII\n";
        sync_reader(fwd, paired.then(|| rev), Some(idx), false)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_sinks_created_lazily_and_in_order() {
        let factory = MemorySinkFactory::default();
        let mut router = OutputRouter::new(factory.clone(), true, "Undetermined");
        assert!(router.sample_names().is_empty());

        let sets = read_sets(true);
        router.route(&sets[0], Some("S1")).unwrap();
        router.route(&sets[1], None).unwrap();
        router.route(&sets[2], Some("S1")).unwrap();
        assert_eq!(router.sample_names(), vec!["S1", "Undetermined"]);
        assert_eq!(router.read_sets_written("S1"), 2);
        assert_eq!(router.read_sets_written("S2"), 0);
        router.close(RunStatus::Complete).unwrap();

        assert_eq!(factory.keys(), vec!["S1_R1", "S1_R2", "Undetermined_R1", "Undetermined_R2"]);
        let s1 = factory.output("S1_R1").unwrap();
        assert_eq!(s1.status, Some(RunStatus::Complete));
        assert_eq!(s1.bytes, b"@q1\nACGT\n+\nIIII\n@q3\nGGGG\n+\nIIII\n");
        assert_eq!(factory.output("S1_R2").unwrap().bytes, b"@q1\nAAAA\n+\n####\n@q3\nNNNN\n+\n####\n");
        assert_eq!(factory.output("Undetermined_R1").unwrap().bytes, b"@q2\nTTTT\n+\nIIII\n");
    }

    #[test]
    fn test_single_end_creates_only_forward_sinks() {
        let factory = MemorySinkFactory::default();
        let mut router = OutputRouter::new(factory.clone(), false, "Undetermined");
        for set in read_sets(false) {
            router.route(&set, Some("S1")).unwrap();
        }
        router.close(RunStatus::Complete).unwrap();
        assert_eq!(factory.keys(), vec!["S1_R1"]);
    }

    #[test]
    fn test_file_sinks_committed_on_complete() {
        let dir = tempdir().unwrap();
        let mut router = OutputRouter::new(FileSinkFactory::new(dir.path(), true), true, "Undetermined");
        let sets = read_sets(true);
        router.route(&sets[0], Some("S1")).unwrap();
        router.route(&sets[1], Some("S1")).unwrap();
        router.route(&sets[2], None).unwrap();
        assert!(dir.path().join("IN_PROGRESS.S1_R1.fastq.gz").exists());
        router.close(RunStatus::Complete).unwrap();

        assert!(!dir.path().join("IN_PROGRESS.S1_R1.fastq.gz").exists());
        let r1 = slurp_fastq(dir.path().join("S1_R1.fastq.gz"));
        assert_eq!(r1.len(), 2);
        assert_eq!(r1[0].head, b"q1");
        assert_eq!(r1[1].seq, b"TTTT");
        let r2 = slurp_fastq(dir.path().join("S1_R2.fastq.gz"));
        assert_eq!(r2[1].qual, b"####");
        let undetermined = slurp_fastq(dir.path().join("Undetermined_R2.fastq.gz"));
        assert_eq!(undetermined[0].seq, b"NNNN");
    }

    #[test]
    fn test_file_sinks_uncompressed() {
        let dir = tempdir().unwrap();
        let mut router = OutputRouter::new(FileSinkFactory::new(dir.path(), false), false, "Undetermined");
        router.route(&read_sets(false)[0], Some("S1")).unwrap();
        router.close(RunStatus::Complete).unwrap();
        let contents = std::fs::read(dir.path().join("S1_R1.fastq")).unwrap();
        assert_eq!(contents, b"@q1\nACGT\n+\nIIII\n");
    }

    #[test]
    fn test_file_sinks_deleted_on_failure() {
        let dir = tempdir().unwrap();
        let mut router = OutputRouter::new(FileSinkFactory::new(dir.path(), true), true, "Undetermined");
        for set in read_sets(true) {
            router.route(&set, Some("S1")).unwrap();
        }
        router.close(RunStatus::Failed).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_partial_sample_sinks_discarded_when_reverse_sink_fails() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("IN_PROGRESS.S1_R2.fastq.gz")).unwrap();
        let mut router = OutputRouter::new(FileSinkFactory::new(dir.path(), true), true, "Undetermined");
        assert!(router.route(&read_sets(true)[0], Some("S1")).is_err());
        assert!(!dir.path().join("IN_PROGRESS.S1_R1.fastq.gz").exists());
        assert!(router.sample_names().is_empty());
        router.close(RunStatus::Failed).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["IN_PROGRESS.S1_R2.fastq.gz"]);
    }

    #[test]
    fn test_file_sinks_marked_incomplete_on_cancel() {
        let dir = tempdir().unwrap();
        let mut router = OutputRouter::new(FileSinkFactory::new(dir.path(), true), false, "Undetermined");
        router.route(&read_sets(false)[0], Some("S1")).unwrap();
        router.close(RunStatus::Cancelled).unwrap();
        assert!(!dir.path().join("S1_R1.fastq.gz").exists());
        let records = slurp_fastq(dir.path().join("INCOMPLETE.S1_R1.fastq.gz"));
        assert_eq!(records.len(), 1);
    }
}
