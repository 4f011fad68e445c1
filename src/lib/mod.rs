//! A library of functionality for demultiplexing FASTQ files by their index read.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`fastq_reader::FastqReader`] decodes one FASTQ stream into [`sequence::SequenceRecord`]s.
//! - The [`sync_reader::SyncReader`] zips the forward, reverse and index streams into
//!   [`sync_reader::ReadSet`]s, failing as soon as they fall out of step.
//! - The [`matcher::BarcodeResolver`] assigns the index bases of each read set to a sample in the
//!   [`barcode_table::BarcodeTable`], or leaves it undetermined.
//! - The [`sample_writer::OutputRouter`] appends each read set to its sample's FASTQs, opening them
//!   on first use and committing or discarding them when the run ends.
//! - The [`demux::Demultiplexer`] drives the above, either one read set at a time or in parallel
//!   over chunks read by a [`thread_reader::ThreadReader`], collecting [`metrics`] as it goes.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod barcode_table;
pub mod demux;
pub mod errors;
pub mod fastq_reader;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod run;
pub mod sample_metadata;
pub mod sample_writer;
pub mod sequence;
pub mod sync_reader;
pub mod thread_reader;
pub mod utils;
