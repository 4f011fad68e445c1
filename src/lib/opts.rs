#![forbid(unsafe_code)]

use std::{num::NonZeroUsize, path::PathBuf};

use clap::Parser;
use env_logger::Env;

use crate::{
    demux::DemuxConfig,
    fastq_reader::InvalidBasePolicy,
    matcher::{MatchParams, MatcherKind, UNDETERMINED_NAME},
    utils::built_info,
};

pub static TOOL_NAME: &str = "legion";

static SHORT_USAGE: &str = "Demultiplexes FASTQs into per-sample files by their index read.";

static LONG_USAGE: &str = "
Demultiplexes FASTQs into per-sample files by their index read.

A forward FASTQ and an index FASTQ are required; a reverse FASTQ may be given for paired-end
data.  The files are read in lockstep, one record from each per read set, and may be gzipped.
Each index read is compared to the expected sample barcodes and the read set is written to the
files of the closest sample, provided it is within --allowed-mismatches and no other sample is
equally close.  All other read sets are written to the undetermined sample.

The sample metadata file is a CSV (or a TSV when named *.tsv or *.txt) with headers.  The
`Sample_ID` column must contain a unique, non-empty identifier for each sample.  The
`Sample_Barcode` column must contain the expected index bases, all of the same length.

Per-sample files named like Sample1_R1.fastq.gz are written to the output directory, which must
exist.  Files are written under an IN_PROGRESS. prefix and renamed when the run completes.  If
the run fails, no FASTQs are left behind.

Example invocation:

legion \\
  --forward R1.fq.gz \\
  --reverse R2.fq.gz \\
  --index I1.fq.gz \\
  --sample-metadata samples.csv \\
  --output-dir demuxed-fastqs/
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// Path to the forward (R1) FASTQ.
    #[clap(long, short = 'f', display_order = 1)]
    pub forward: PathBuf,

    /// Path to the reverse (R2) FASTQ, for paired-end data.
    #[clap(long, short = 'r', display_order = 1)]
    pub reverse: Option<PathBuf>,

    /// Path to the index (I1) FASTQ.
    #[clap(long, short = 'i', display_order = 1)]
    pub index: PathBuf,

    /// Path to the sample metadata.
    #[clap(long, short = 's', display_order = 2)]
    pub sample_metadata: PathBuf,

    /// The directory to write outputs, the directory must exist.
    ///
    /// This tool will overwrite existing files.
    #[clap(long, short, display_order = 4)]
    pub output_dir: PathBuf,

    /// Number of allowed mismatches between the observed barcode and the expected barcode.
    #[clap(long, short = 'm', default_value = "1", display_order = 11)]
    pub allowed_mismatches: usize,

    /// The minimum allowed difference between an observed barcode and the second closest expected
    /// barcode.
    ///
    /// A read set is left undetermined when the second closest barcode is no more than this many
    /// mismatches further away than the closest.
    #[clap(long, short = 'd', default_value = "0", display_order = 11)]
    pub min_delta: usize,

    /// Max no-calls (N's) in a barcode before it is considered unmatchable.
    ///
    /// A barcode with total N's greater than `max_no_call` will be considered unmatchable.
    ///
    /// [default: None]
    #[clap(long, short = 'N', display_order = 11)]
    pub max_no_calls: Option<usize>,

    /// Fail if the read names of a read set differ across the input FASTQs.
    ///
    /// Names are compared up to the first whitespace, ignoring a trailing /1, /2 or /3.
    #[clap(long, display_order = 11)]
    pub enforce_identifier_match: bool,

    /// What to do with a base that is not one of ACGTN.
    #[clap(long, default_value = "reject", possible_values=InvalidBasePolicy::possible_values(), display_order = 11)]
    pub invalid_base_policy: InvalidBasePolicy,

    /// The sample name for undetermined reads (reads that do not match an expected barcode).
    #[clap(long, short = 'u', default_value = UNDETERMINED_NAME, display_order = 21)]
    pub undetermined_sample_name: String,

    /// Write plain text FASTQs instead of gzipped FASTQs.
    #[clap(long, display_order = 21)]
    pub uncompressed_outputs: bool,

    /// Output the most frequent "unmatched" barcodes up to this number.
    ///
    /// If set to 0 unmatched barcodes will not be collected, improving overall performance.
    #[clap(long, short = 'U', default_value = "1000", display_order = 31)]
    pub most_unmatched_to_output: usize,

    /// Number of threads for demultiplexing.
    ///
    /// With one thread read sets are classified and written one at a time.  With more, chunks of
    /// read sets are read on a separate thread and classified in parallel.
    #[clap(long, short = 't', default_value = "1", display_order = 31)]
    pub threads: usize,

    /// The number of read sets to extract from the FASTQs at one time.
    ///
    /// A "chunk" is the unit of parallelization when running with more than one thread.
    #[clap(long, short = 'c', default_value = "1000", display_order = 31, hide = true)]
    pub chunksize: NonZeroUsize,

    /// Override the matcher heuristic.
    ///
    /// If the sample barcodes are <= 12 bp long and at most 3 mismatches are allowed, all possible
    /// matches are precomputed.  Otherwise a cached hamming distance matcher is used.
    ///
    /// This option allows for overriding that heuristic.
    ///
    /// [default: None]
    #[clap(long, possible_values=MatcherKind::possible_values(), display_order = 31)]
    pub override_matcher: Option<MatcherKind>,
}

impl Opts {
    /// Whether a reverse FASTQ was given.
    pub fn is_paired(&self) -> bool {
        self.reverse.is_some()
    }

    /// Extract a [`DemuxConfig`] from the CLI opts.
    pub fn as_demux_config(&self) -> DemuxConfig {
        DemuxConfig {
            match_params: MatchParams {
                max_mismatches: self.allowed_mismatches,
                min_delta: self.min_delta,
                max_no_calls: self.max_no_calls,
            },
            matcher: self.override_matcher,
            threads: self.threads.max(1),
            chunksize: self.chunksize,
            collect_unmatched: self.most_unmatched_to_output > 0,
        }
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            forward: PathBuf::default(),
            reverse: None,
            index: PathBuf::default(),
            sample_metadata: PathBuf::default(),
            output_dir: PathBuf::default(),
            allowed_mismatches: 1,
            min_delta: 0,
            max_no_calls: None,
            enforce_identifier_match: false,
            invalid_base_policy: InvalidBasePolicy::Reject,
            undetermined_sample_name: UNDETERMINED_NAME.to_string(),
            uncompressed_outputs: false,
            most_unmatched_to_output: 1_000,
            threads: 1,
            chunksize: NonZeroUsize::new(1000).unwrap(),
            override_matcher: None,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use clap::Parser;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_match_cli() {
        let opts =
            Opts::try_parse_from(["legion", "-f", "r1.fq", "-i", "i1.fq", "-s", "s.csv", "-o", "out"])
                .unwrap();
        let defaults = Opts::default();
        assert_eq!(opts.forward, PathBuf::from("r1.fq"));
        assert!(!opts.is_paired());
        assert_eq!(opts.allowed_mismatches, defaults.allowed_mismatches);
        assert_eq!(opts.min_delta, defaults.min_delta);
        assert_eq!(opts.max_no_calls, defaults.max_no_calls);
        assert_eq!(opts.invalid_base_policy, defaults.invalid_base_policy);
        assert_eq!(opts.undetermined_sample_name, defaults.undetermined_sample_name);
        assert_eq!(opts.most_unmatched_to_output, defaults.most_unmatched_to_output);
        assert_eq!(opts.threads, defaults.threads);
        assert_eq!(opts.chunksize, defaults.chunksize);
        assert_eq!(opts.override_matcher, defaults.override_matcher);
    }

    #[rstest]
    #[case("reject", InvalidBasePolicy::Reject)]
    #[case("mask-as-n", InvalidBasePolicy::MaskAsN)]
    fn test_invalid_base_policy(#[case] value: &str, #[case] expected: InvalidBasePolicy) {
        let opts = Opts::try_parse_from([
            "legion",
            "-f",
            "r1.fq",
            "-r",
            "r2.fq",
            "-i",
            "i1.fq",
            "-s",
            "s.csv",
            "-o",
            "out",
            "--invalid-base-policy",
            value,
            "--override-matcher",
            "linear-scan",
        ])
        .unwrap();
        assert!(opts.is_paired());
        assert_eq!(opts.invalid_base_policy, expected);
        assert_eq!(opts.override_matcher, Some(MatcherKind::LinearScan));
    }

    #[test]
    fn test_missing_index_is_rejected() {
        assert!(Opts::try_parse_from(["legion", "-f", "r1.fq", "-s", "s.csv", "-o", "out"]).is_err());
    }

    #[test]
    fn test_as_demux_config() {
        let opts = Opts {
            allowed_mismatches: 2,
            min_delta: 1,
            max_no_calls: Some(3),
            threads: 0,
            most_unmatched_to_output: 0,
            override_matcher: Some(MatcherKind::PreCompute),
            ..Opts::default()
        };
        let config = opts.as_demux_config();
        assert_eq!(
            config.match_params,
            MatchParams { max_mismatches: 2, min_delta: 1, max_no_calls: Some(3) }
        );
        assert_eq!(config.threads, 1);
        assert!(!config.collect_unmatched);
        assert_eq!(config.matcher, Some(MatcherKind::PreCompute));
    }
}
