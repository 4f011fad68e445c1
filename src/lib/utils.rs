use lazy_static::lazy_static;

lazy_static! {
    /// The number of logical cpus on this machine.
    pub static ref NUM_CPU: usize = num_cpus::get();
}

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string including
    ///   - Git commit hash
    ///   - Git dirty info (whether the repo had uncommitted changes)
    ///   - Cargo package version if no git info found
    fn get_software_version() -> String {
        let prefix = if let Some(s) = GIT_COMMIT_HASH {
            format!("{}-{}", PKG_VERSION, s.chars().take(8).collect::<String>())
        } else {
            PKG_VERSION.to_string()
        };
        let suffix = match GIT_DIRTY {
            Some(true) => "-dirty",
            _ => "",
        };
        format!("{}{}", prefix, suffix)
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

/// Determine the output file name for the given sample and mate (1 = forward, 2 = reverse).
pub fn filename(sample_name: &str, mate: usize, compressed: bool) -> String {
    let extension = if compressed { "fastq.gz" } else { "fastq" };
    format!("{}_R{}.{}", sample_name, mate, extension)
}

#[cfg(test)]
pub mod test_commons {
    //! Common utility methods for testing demultiplexing.

    use std::{
        io::Write,
        path::{Path, PathBuf},
    };

    use fgoxide::io::Io;
    use seq_io::fastq::{OwnedRecord, Reader};

    pub const SAMPLE_BARCODE_1: &str = "AAAAAAAA";
    pub const SAMPLE_BARCODE_2: &str = "CCCCCCCC";
    pub const SAMPLE_BARCODE_3: &str = "GGGGGGGG";
    pub const SAMPLE_BARCODE_4: &str = "GGGGGGTT";

    /// Helper method to write a standard 4 samples to a metadata file.
    pub fn create_preset_sample_metadata_file(dir: impl AsRef<Path>) -> PathBuf {
        let file_contents = format!(
            "Sample_ID,Sample_Barcode\n\
        Sample1,{}\n\
        Sample2,{}\n\
        Sample3,{}\n\
        Sample4,{}",
            SAMPLE_BARCODE_1, SAMPLE_BARCODE_2, SAMPLE_BARCODE_3, SAMPLE_BARCODE_4
        );

        let output = dir.as_ref().join("sample_metadata.csv");
        std::fs::write(&output, file_contents).expect("Failed to write sample metadata to file.");
        output
    }

    /// Configuration struct for creating a FASTQ read
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Fq<'a> {
        pub name: &'a str,
        pub bases: &'a str,
        pub quals: Option<&'a str>,
        pub comment: Option<&'a str>,
    }

    impl<'a> Fq<'a> {
        /// Convert the configuration into an [`OwnedRecord`].
        pub fn to_owned_record(&self) -> OwnedRecord {
            let head = match self.comment {
                Some(comment) => format!("{} {}", self.name, comment),
                None => self.name.to_string(),
            };
            let qual = if let Some(qual) = self.quals {
                assert_eq!(qual.len(), self.bases.len());
                qual.as_bytes().to_vec()
            } else {
                vec![b'I'; self.bases.len()]
            };
            OwnedRecord { head: head.into_bytes(), seq: self.bases.as_bytes().to_vec(), qual }
        }
    }

    /// Write a set of fastq reads to a file, returning the number of reads written.
    ///
    /// If the file extension is `gz` the reads will be compressed
    pub fn write_reads_to_file(
        reads: impl Iterator<Item = OwnedRecord>,
        file: impl AsRef<Path>,
    ) -> usize {
        let mut num_written = 0;
        let mut writer = Io::default().new_writer(&file).unwrap();
        for read in reads {
            seq_io::fastq::write_to(&mut writer, &read.head, &read.seq, &read.qual).unwrap();
            num_written += 1;
        }
        writer.flush().unwrap();
        num_written
    }

    /// Slurp all records out of a FASTQ file, gzipped or not.
    pub fn slurp_fastq(file: impl AsRef<Path>) -> Vec<OwnedRecord> {
        let reader = Io::default()
            .new_reader(&file)
            .unwrap_or_else(|_| panic!("Unable to open {:?}", &file.as_ref()));
        Reader::new(reader).records().map(Result::unwrap).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_filename() {
        assert_eq!(filename("S1", 1, true), "S1_R1.fastq.gz");
        assert_eq!(filename("Undetermined", 2, false), "Undetermined_R2.fastq");
    }

    #[test]
    fn test_version_starts_with_package_version() {
        assert!(built_info::VERSION.starts_with(built_info::PKG_VERSION));
    }
}
