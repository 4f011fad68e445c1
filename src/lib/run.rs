use std::{
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{ensure, Context, Result};
use fgoxide::io::Io;
use log::{info, warn};

use crate::{
    demux::Demultiplexer,
    errors::StreamKind,
    fastq_reader::{FastqReader, InvalidBasePolicy},
    opts::Opts,
    sample_metadata::SampleMetadata,
    sample_writer::{FileSinkFactory, OutputRouter, RunStatus},
    sync_reader::SyncReader,
    utils::NUM_CPU,
};

type FileReader = BufReader<Box<dyn Read>>;

/// Open a (possibly gzipped) FASTQ for decoding.
fn open_fastq(
    io: &Io,
    path: &Path,
    stream: StreamKind,
    policy: InvalidBasePolicy,
) -> crate::errors::Result<FastqReader<FileReader>> {
    let reader = io.new_reader(&path)?;
    Ok(FastqReader::with_policy(reader, stream, policy))
}

/// Run demultiplexing.
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    // Preflight checks
    ensure!(
        opts.output_dir.is_dir(),
        "Output directory does not exist: {}",
        &opts.output_dir.to_string_lossy()
    );
    ensure!(!opts.undetermined_sample_name.is_empty(), "The undetermined sample name may not be empty");
    let inputs = [
        (Some(&opts.forward), StreamKind::Forward),
        (opts.reverse.as_ref(), StreamKind::Reverse),
        (Some(&opts.index), StreamKind::Index),
    ];
    for (path, stream) in inputs {
        if let Some(path) = path {
            ensure!(path.is_file(), "The {} FASTQ does not exist: {}", stream, path.display());
        }
    }
    if opts.threads > *NUM_CPU {
        warn!("Requested {} threads but only {} cpus are available", opts.threads, *NUM_CPU);
    }

    let samples = SampleMetadata::from_path(&opts.sample_metadata, &opts.undetermined_sample_name)
        .with_context(|| {
            format!("Failed to load sample metadata from {}", opts.sample_metadata.display())
        })?;
    let table = SampleMetadata::to_barcode_table(&samples)?;
    info!("Loaded {} samples with {}bp barcodes", table.len(), table.barcode_length());

    // The readers are opened on the thread that decodes them.
    let policy = opts.invalid_base_policy;
    let enforce_identifier_match = opts.enforce_identifier_match;
    let (forward, reverse, index) = (opts.forward.clone(), opts.reverse.clone(), opts.index.clone());
    let open = move || -> crate::errors::Result<SyncReader<FileReader>> {
        let io = Io::default();
        let forward = open_fastq(&io, &forward, StreamKind::Forward, policy)?;
        let reverse = match &reverse {
            Some(path) => Some(open_fastq(&io, path, StreamKind::Reverse, policy)?),
            None => None,
        };
        let index = open_fastq(&io, &index, StreamKind::Index, policy)?;
        Ok(SyncReader::new(forward, reverse, Some(index), enforce_identifier_match))
    };

    let factory = FileSinkFactory::new(&opts.output_dir, !opts.uncompressed_outputs);
    let router =
        OutputRouter::new(factory, opts.is_paired(), opts.undetermined_sample_name.clone());
    let demuxer = Demultiplexer::new(table, opts.as_demux_config());
    info!("Using the {:?} matcher", demuxer.resolver().kind());

    info!("Processing data");
    let summary = demuxer.run(open, router).context("Demultiplexing failed")?;

    info!("Writing stats");
    summary
        .metrics
        .write_metrics_files(
            demuxer.resolver().table(),
            &opts.undetermined_sample_name,
            &opts.output_dir,
            opts.most_unmatched_to_output,
            summary.status == RunStatus::Complete,
        )
        .context("Failed to write metrics")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        fs::create_dir,
        path::{Path, PathBuf},
    };

    use fgoxide::io::DelimFile;
    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;

    use crate::{
        metrics::{
            BarcodeCount, RunMetrics, SampleMetricsProcessed, MOST_FREQUENT_UNMATCHED_FILENAME,
            PER_SAMPLE_METRICS_FILENAME, RUN_METRICS_FILENAME,
        },
        sample_writer::IN_PROGRESS_PREFIX,
        utils::{
            filename,
            test_commons::{
                create_preset_sample_metadata_file, slurp_fastq, write_reads_to_file, Fq,
                SAMPLE_BARCODE_1, SAMPLE_BARCODE_2,
            },
        },
    };

    use super::{run, Opts};

    /// The index reads of the end to end inputs, against the preset samples with one mismatch.
    const INDEX_READS: &[(&str, &str)] = &[
        ("frag1", SAMPLE_BARCODE_1),
        ("frag2", "AAAAAAAT"),
        ("frag3", "GGGGGGGT"),
        ("frag4", "TTTTTTTT"),
        ("frag5", SAMPLE_BARCODE_2),
    ];

    fn write_fastq(dir: &Path, file: &str, reads: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(file);
        let records =
            reads.iter().map(|&(name, bases)| Fq { name, bases, ..Fq::default() }.to_owned_record());
        write_reads_to_file(records, &path);
        path
    }

    /// Write forward, reverse and index FASTQs for the given index reads.
    fn write_inputs(dir: &Path, index_reads: &[(&str, &str)]) -> (PathBuf, PathBuf, PathBuf) {
        let forward: Vec<_> = index_reads.iter().map(|(name, _)| (*name, "ACGTACGTACGT")).collect();
        let reverse: Vec<_> = index_reads.iter().map(|(name, _)| (*name, "TTTTGGGGCCCC")).collect();
        (
            write_fastq(dir, "R1.fastq.gz", &forward),
            write_fastq(dir, "R2.fastq.gz", &reverse),
            write_fastq(dir, "I1.fastq.gz", index_reads),
        )
    }

    fn names(records: &[OwnedRecord]) -> Vec<&str> {
        records.iter().map(|r| std::str::from_utf8(&r.head).unwrap()).collect()
    }

    #[rstest]
    fn test_end_to_end(#[values(1, 2)] threads: usize, #[values(true, false)] compressed: bool) {
        let dir = tempfile::tempdir().unwrap();
        let (forward, reverse, index) = write_inputs(dir.path(), INDEX_READS);
        let output = dir.path().join("output");
        create_dir(&output).unwrap();

        let opts = Opts {
            forward,
            reverse: Some(reverse),
            index,
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: output.clone(),
            enforce_identifier_match: true,
            uncompressed_outputs: !compressed,
            threads,
            ..Opts::default()
        };
        run(opts).unwrap();

        let reads = |sample: &str, mate: usize| slurp_fastq(output.join(filename(sample, mate, compressed)));
        assert_eq!(names(&reads("Sample1", 1)), vec!["frag1", "frag2"]);
        assert_eq!(names(&reads("Sample1", 2)), vec!["frag1", "frag2"]);
        assert_eq!(names(&reads("Sample2", 1)), vec!["frag5"]);
        assert_eq!(names(&reads("Undetermined", 1)), vec!["frag3", "frag4"]);
        assert_eq!(reads("Undetermined", 2)[1].seq, b"TTTTGGGGCCCC".to_vec());
        assert!(!output.join(filename("Sample3", 1, compressed)).exists());
        assert!(std::fs::read_dir(&output)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(IN_PROGRESS_PREFIX)));

        let delim = DelimFile::default();
        let per_sample: Vec<SampleMetricsProcessed> =
            delim.read_tsv(&output.join(PER_SAMPLE_METRICS_FILENAME)).unwrap();
        assert_eq!(per_sample.len(), 5);
        assert_eq!(per_sample[0].sample_id, "Sample1");
        assert_eq!(per_sample[0].templates, 2);
        assert_eq!(per_sample[0].perfect_matches, 1);
        assert_eq!(per_sample[0].one_mismatch_matches, 1);
        assert_eq!(per_sample[4].sample_id, "Undetermined");
        assert_eq!(per_sample[4].barcode, "NNNNNNNN");
        assert_eq!(per_sample[4].templates, 2);

        let run_metrics: Vec<RunMetrics> = delim.read_tsv(&output.join(RUN_METRICS_FILENAME)).unwrap();
        assert_eq!(
            run_metrics,
            vec![RunMetrics {
                total_read_sets: 5,
                assigned: 3,
                unassigned_too_distant: 1,
                unassigned_ambiguous: 1,
                unassigned_too_many_no_calls: 0,
                complete: true,
            }]
        );

        let unmatched: Vec<BarcodeCount> =
            delim.read_tsv(&output.join(MOST_FREQUENT_UNMATCHED_FILENAME)).unwrap();
        assert_eq!(unmatched.len(), 2);
        assert!(unmatched.iter().all(|b| b.count == 1));
    }

    #[test]
    fn test_single_end_without_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, _, index) = write_inputs(dir.path(), INDEX_READS);
        let output = dir.path().join("output");
        create_dir(&output).unwrap();

        let opts = Opts {
            forward,
            index,
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: output.clone(),
            most_unmatched_to_output: 0,
            ..Opts::default()
        };
        run(opts).unwrap();

        assert_eq!(slurp_fastq(output.join("Sample1_R1.fastq.gz")).len(), 2);
        assert!(!output.join("Sample1_R2.fastq.gz").exists());
        assert!(!output.join(MOST_FREQUENT_UNMATCHED_FILENAME).exists());
    }

    #[rstest]
    fn test_short_index_fails_without_output(#[values(1, 2)] threads: usize) {
        let dir = tempfile::tempdir().unwrap();
        let (forward, reverse, _) = write_inputs(dir.path(), INDEX_READS);
        let index = write_fastq(dir.path(), "short_I1.fastq.gz", &INDEX_READS[..4]);
        let output = dir.path().join("output");
        create_dir(&output).unwrap();

        let opts = Opts {
            forward,
            reverse: Some(reverse),
            index,
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: output.clone(),
            threads,
            ..Opts::default()
        };
        let err = run(opts).unwrap_err();
        assert!(format!("{:#}", err).contains("read set #5"));
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);
    }

    #[test]
    fn test_mismatched_names_fail_when_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let forward = write_fastq(dir.path(), "R1.fastq", &[("frag1", "ACGT"), ("frag2", "ACGT")]);
        let index = write_fastq(
            dir.path(),
            "I1.fastq",
            &[("frag1", SAMPLE_BARCODE_1), ("fragX", SAMPLE_BARCODE_1)],
        );
        let output = dir.path().join("output");
        create_dir(&output).unwrap();

        let opts = Opts {
            forward: forward.clone(),
            index: index.clone(),
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: output.clone(),
            enforce_identifier_match: true,
            ..Opts::default()
        };
        assert!(run(opts.clone()).is_err());
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);

        run(Opts { enforce_identifier_match: false, ..opts }).unwrap();
        assert_eq!(slurp_fastq(output.join("Sample1_R1.fastq.gz")).len(), 2);
    }

    #[test]
    fn test_missing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Opts {
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: dir.path().join("does-not-exist"),
            ..Opts::default()
        };
        let err = run(opts).unwrap_err();
        assert!(err.to_string().contains("Output directory does not exist"));
    }

    #[rstest]
    fn test_missing_input_fastq(#[values(1, 2)] threads: usize) {
        let dir = tempfile::tempdir().unwrap();
        let (forward, _, index) = write_inputs(dir.path(), INDEX_READS);
        let output = dir.path().join("output");
        create_dir(&output).unwrap();
        let opts = Opts {
            forward,
            reverse: Some(dir.path().join("missing_R2.fastq.gz")),
            index,
            sample_metadata: create_preset_sample_metadata_file(dir.path()),
            output_dir: output.clone(),
            threads,
            ..Opts::default()
        };
        let err = run(opts).unwrap_err();
        assert!(err.to_string().contains("The reverse FASTQ does not exist"));
        assert_eq!(std::fs::read_dir(&output).unwrap().count(), 0);
    }

    #[test]
    fn test_reserved_sample_name() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, _, index) = write_inputs(dir.path(), INDEX_READS);
        let metadata = dir.path().join("samples.csv");
        std::fs::write(&metadata, "Sample_ID,Sample_Barcode\nUndetermined,ACGTACGT\n").unwrap();
        let opts = Opts {
            forward,
            index,
            sample_metadata: metadata,
            output_dir: dir.path().to_path_buf(),
            ..Opts::default()
        };
        let err = run(opts).unwrap_err();
        assert!(format!("{:#}", err).contains("reserved"));
    }
}
