//! The in-memory representation of sequencing reads.

use std::io::Write;

use bstr::BString;
use strum::EnumIter;

/// The offset of Phred+33 encoded quality scores.
pub const PHRED_OFFSET: u8 = b'!';

/// The highest printable quality symbol.
pub const MAX_QUALITY_SYMBOL: u8 = b'~';

/// The ASCII symbol for each [`Base`], indexed by discriminant.
const BASE_TO_ASCII: [u8; 5] = [b'N', b'A', b'C', b'G', b'T'];

/// A called base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
#[repr(u8)]
pub enum Base {
    N = 0,
    A = 1,
    C = 2,
    G = 3,
    T = 4,
}

impl Base {
    /// Map an ASCII symbol to a [`Base`], ignoring case.
    ///
    /// Returns `None` for anything other than `ACGTN`.
    #[inline]
    pub fn from_ascii(symbol: u8) -> Option<Self> {
        match symbol {
            b'N' | b'n' => Some(Self::N),
            b'A' | b'a' => Some(Self::A),
            b'C' | b'c' => Some(Self::C),
            b'G' | b'g' => Some(Self::G),
            b'T' | b't' => Some(Self::T),
            _ => None,
        }
    }

    /// The upper-case ASCII symbol for this base.
    #[inline]
    pub fn to_ascii(self) -> u8 {
        BASE_TO_ASCII[self as usize]
    }

    /// True if this base is a no-call.
    #[inline]
    pub fn is_no_call(self) -> bool {
        self == Self::N
    }
}

/// Parse a string of bases, returning `None` if any symbol is not a valid base.
pub fn bases_from_str(bases: &str) -> Option<Vec<Base>> {
    bases.bytes().map(Base::from_ascii).collect()
}

/// Render a sequence of bases as upper-case text.
pub fn bases_to_string(bases: &[Base]) -> String {
    bases.iter().map(|b| b.to_ascii() as char).collect()
}

/// A base paired with its Phred quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nucleobase {
    pub base: Base,
    /// The decoded Phred score (the quality symbol minus 33).
    pub quality: u8,
}

impl Nucleobase {
    pub fn new(base: Base, quality: u8) -> Self {
        Self { base, quality }
    }

    /// The Phred+33 symbol for this base's quality.
    #[inline]
    pub fn quality_symbol(&self) -> u8 {
        self.quality + PHRED_OFFSET
    }
}

/// A single FASTQ record.
///
/// The `id` and `divider` are the raw bytes of the identifier and divider lines, without the
/// leading `@` and `+` markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: BString,
    pub bases: Vec<Nucleobase>,
    pub divider: BString,
}

impl SequenceRecord {
    pub fn new(id: BString, bases: Vec<Nucleobase>, divider: BString) -> Self {
        Self { id, bases, divider }
    }

    /// The number of bases in the record.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// The bases without their qualities.
    pub fn seq(&self) -> Vec<Base> {
        self.bases.iter().map(|n| n.base).collect()
    }

    /// The read name: the identifier up to the first whitespace.
    pub fn name(&self) -> &[u8] {
        let end = self.id.iter().position(u8::is_ascii_whitespace).unwrap_or(self.id.len());
        &self.id[..end]
    }

    /// Append the record in FASTQ text form to `buffer`.
    pub fn copy_to_vec(&self, buffer: &mut Vec<u8>) {
        buffer.reserve(self.id.len() + self.divider.len() + 2 * self.bases.len() + 6);
        buffer.push(b'@');
        buffer.extend_from_slice(&self.id);
        buffer.push(b'\n');
        buffer.extend(self.bases.iter().map(|n| n.base.to_ascii()));
        buffer.push(b'\n');
        buffer.push(b'+');
        buffer.extend_from_slice(&self.divider);
        buffer.push(b'\n');
        buffer.extend(self.bases.iter().map(Nucleobase::quality_symbol));
        buffer.push(b'\n');
    }

    /// Write the record in FASTQ text form.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        self.copy_to_vec(&mut buffer);
        writer.write_all(&buffer)
    }
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_base_ascii_mapping_is_total() {
        for base in Base::iter() {
            assert_eq!(Base::from_ascii(base.to_ascii()), Some(base));
            assert_eq!(Base::from_ascii(base.to_ascii().to_ascii_lowercase()), Some(base));
        }
        assert_eq!(Base::from_ascii(b'X'), None);
        assert_eq!(Base::from_ascii(b'.'), None);
    }

    #[test]
    fn test_bases_from_str() {
        assert_eq!(bases_from_str("acgtN"), Some(vec![Base::A, Base::C, Base::G, Base::T, Base::N]));
        assert_eq!(bases_from_str("ACXT"), None);
        assert_eq!(bases_to_string(&bases_from_str("gattaca").unwrap()), "GATTACA");
    }

    #[test]
    fn test_record_to_fastq_text() {
        let record = SequenceRecord::new(
            BString::from("read1 1:N:0:ACGT"),
            vec![Nucleobase::new(Base::A, 0), Nucleobase::new(Base::N, 40)],
            BString::from(""),
        );
        let mut buffer = vec![];
        record.write(&mut buffer).unwrap();
        assert_eq!(buffer, b"@read1 1:N:0:ACGT\nAN\n+\n!I\n");
        assert_eq!(record.name(), b"read1");
    }
}
