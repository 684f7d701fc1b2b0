//! Reference index: mask files, contig table, and reference metadata
//! (spec §4.2, §6 "Input — reference index").
//!
//! Mask-file I/O mirrors `mtsv::io::{from_file, write_to_file}`: plain
//! `bincode` framing over a buffered reader/writer, no custom header beyond
//! what the records themselves carry.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OligoError, OligoResult};
use crate::oligo::KmerValue;

pub const CURRENT_REFERENCE_FORMAT_VERSION: u32 = 3;
pub const OLDEST_SUPPORTED_REFERENCE_FORMAT_VERSION: u32 = 2;

/// Bits reserved for the contig id within a packed reference position.
const CONTIG_ID_BITS: u32 = 20;
const CONTIG_ID_SHIFT: u32 = 64 - CONTIG_ID_BITS;
const NEIGHBOR_FLAG_SHIFT: u32 = CONTIG_ID_SHIFT - 1;
const OFFSET_MASK: u64 = (1u64 << NEIGHBOR_FLAG_SHIFT) - 1;

/// A packed `(contig id, neighbor flag, offset)` position, or one of two
/// sentinels (spec §3 "Reference index").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReferencePosition(pub u64);

impl ReferencePosition {
    const TOO_MANY_MATCH: u64 = u64::MAX;
    const NO_MATCH: u64 = u64::MAX - 1;

    pub fn new(contig_id: u32, offset: u64, has_neighbors: bool) -> ReferencePosition {
        crate::error::invariant!(
            (contig_id as u64) < (1u64 << CONTIG_ID_BITS),
            "contig id {} exceeds {} bits",
            contig_id,
            CONTIG_ID_BITS
        );
        crate::error::invariant!(offset <= OFFSET_MASK, "contig offset {} too large", offset);
        let neighbor_bit = if has_neighbors { 1u64 } else { 0u64 };
        let packed = ((contig_id as u64) << CONTIG_ID_SHIFT)
            | (neighbor_bit << NEIGHBOR_FLAG_SHIFT)
            | offset;
        ReferencePosition(packed)
    }

    pub fn too_many_match() -> ReferencePosition {
        ReferencePosition(Self::TOO_MANY_MATCH)
    }

    pub fn no_match() -> ReferencePosition {
        ReferencePosition(Self::NO_MATCH)
    }

    pub fn is_too_many_match(self) -> bool {
        self.0 == Self::TOO_MANY_MATCH
    }

    pub fn is_no_match(self) -> bool {
        self.0 == Self::NO_MATCH
    }

    pub fn is_sentinel(self) -> bool {
        self.is_too_many_match() || self.is_no_match()
    }

    pub fn contig_id(self) -> u32 {
        crate::error::invariant!(!self.is_sentinel(), "contig_id() called on a sentinel position");
        (self.0 >> CONTIG_ID_SHIFT) as u32
    }

    pub fn offset(self) -> u64 {
        crate::error::invariant!(!self.is_sentinel(), "offset() called on a sentinel position");
        self.0 & OFFSET_MASK
    }

    pub fn has_neighbors(self) -> bool {
        if self.is_sentinel() {
            return false;
        }
        (self.0 >> NEIGHBOR_FLAG_SHIFT) & 1 == 1
    }

    /// Returns a copy with the neighbor flag set, used by the offline
    /// neighbors-finder pass to annotate mask records after sorting.
    pub fn with_neighbor_flag(self, flag: bool) -> ReferencePosition {
        if self.is_sentinel() {
            return self;
        }
        ReferencePosition::new(self.contig_id(), self.offset(), flag)
    }
}

/// One `(kmer, packed_position)` record in a mask file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MaskRecord {
    pub kmer: KmerValue,
    pub position: ReferencePosition,
}

/// Per-contig metadata carried alongside the sequence (spec §3 "Contig").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContigMetadata {
    pub file_offset: u64,
    pub size: u64,
    pub acgt_count: u64,
    pub bam_sq_as: Option<String>,
    pub bam_sq_ur: Option<String>,
    pub bam_sq_m5: Option<String>,
}

/// A loaded contig: sequence plus metadata (spec §3 "Contig").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contig {
    pub index: u32,
    pub karyotype_index: u32,
    pub name: String,
    pub sequence: Vec<crate::oligo::Base>,
    pub metadata: ContigMetadata,
}

impl Contig {
    pub fn total_bases(&self) -> u64 {
        self.sequence.len() as u64
    }
}

/// One mask file's entry in the reference metadata document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskFileEntry {
    pub path: PathBuf,
    pub seed_length: u32,
    pub mask_width: u32,
    pub mask_value: u32,
    pub total_kmers: u64,
}

/// The reference-metadata document (spec §6: "an XML-ish reference-metadata
/// file"). Serialized as JSON here — the spec only names the fields, not a
/// byte layout, so JSON-via-serde is a faithful concretization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceMetadata {
    pub format_version: u32,
    pub contigs: Vec<ContigSummary>,
    pub mask_files: Vec<MaskFileEntry>,
}

/// The subset of `Contig` that's worth persisting separately from the raw
/// sequence bytes (which live in the contig data file itself).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContigSummary {
    pub index: u32,
    pub karyotype_index: u32,
    pub name: String,
    pub metadata: ContigMetadata,
}

impl ReferenceMetadata {
    pub fn load(path: &Path) -> OligoResult<ReferenceMetadata> {
        let file = File::open(path).map_err(OligoError::Io)?;
        let meta: ReferenceMetadata = serde_json::from_reader(BufReader::new(file))?;
        if meta.format_version < OLDEST_SUPPORTED_REFERENCE_FORMAT_VERSION
            || meta.format_version > CURRENT_REFERENCE_FORMAT_VERSION
        {
            return Err(OligoError::Format(format!(
                "reference format version {} outside supported range [{}, {}]",
                meta.format_version, OLDEST_SUPPORTED_REFERENCE_FORMAT_VERSION, CURRENT_REFERENCE_FORMAT_VERSION
            )));
        }
        validate_karyotype_permutation(&meta.contigs)?;
        Ok(meta)
    }

    pub fn save(&self, path: &Path) -> OligoResult<()> {
        let file = File::create(path).map_err(OligoError::Io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Merges two reference metadata documents; per spec §6, allowed only
    /// when contig lists and mask widths agree.
    pub fn merge(&self, other: &ReferenceMetadata) -> OligoResult<ReferenceMetadata> {
        let contig_names: Vec<&str> = self.contigs.iter().map(|c| c.name.as_str()).collect();
        let other_names: Vec<&str> = other.contigs.iter().map(|c| c.name.as_str()).collect();
        if contig_names != other_names {
            return Err(OligoError::Option(
                "cannot merge references with differing contig lists".to_string(),
            ));
        }
        let widths: std::collections::HashSet<u32> = self.mask_files.iter().map(|m| m.mask_width).collect();
        let other_widths: std::collections::HashSet<u32> = other.mask_files.iter().map(|m| m.mask_width).collect();
        if widths != other_widths {
            return Err(OligoError::Option(
                "cannot merge references with differing mask widths".to_string(),
            ));
        }
        let mut mask_files = self.mask_files.clone();
        mask_files.extend(other.mask_files.clone());
        Ok(ReferenceMetadata {
            format_version: self.format_version.max(other.format_version),
            contigs: self.contigs.clone(),
            mask_files,
        })
    }
}

fn validate_karyotype_permutation(contigs: &[ContigSummary]) -> OligoResult<()> {
    let n = contigs.len();
    let mut seen = vec![false; n];
    for c in contigs {
        let k = c.karyotype_index as usize;
        if k >= n || seen[k] {
            return Err(OligoError::Format(format!(
                "karyotype indices do not form a permutation of [0, {})",
                n
            )));
        }
        seen[k] = true;
    }
    Ok(())
}

/// Reads a mask file into memory, verifying the strict-sort invariant
/// (spec §3, §4.5 "Failure semantics": unsorted mask file is fatal).
pub fn read_mask_file(path: &Path) -> OligoResult<Vec<MaskRecord>> {
    let file = File::open(path).map_err(|e| {
        OligoError::Io(std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
    })?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 8];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(OligoError::Io(e)),
        }
        let count = u64::from_le_bytes(len_buf) as usize;
        for _ in 0..count {
            let record: MaskRecord = bincode::deserialize_from(&mut reader)?;
            records.push(record);
        }
        break;
    }
    for w in records.windows(2) {
        if w[1].kmer < w[0].kmer {
            return Err(OligoError::Format(format!(
                "mask file {} is not sorted by k-mer",
                path.display()
            )));
        }
    }
    Ok(records)
}

/// Writes a mask file in the same length-prefixed `bincode` framing
/// `read_mask_file` expects.
pub fn write_mask_file(path: &Path, records: &[MaskRecord]) -> OligoResult<()> {
    let file = File::create(path).map_err(OligoError::Io)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&(records.len() as u64).to_le_bytes())?;
    for record in records {
        bincode::serialize_into(&mut writer, record)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reference_position_roundtrip() {
        let pos = ReferencePosition::new(42, 123456, true);
        assert_eq!(pos.contig_id(), 42);
        assert_eq!(pos.offset(), 123456);
        assert!(pos.has_neighbors());
        assert!(!pos.is_sentinel());
    }

    #[test]
    fn sentinels_are_distinct() {
        let too_many = ReferencePosition::too_many_match();
        let no_match = ReferencePosition::no_match();
        assert!(too_many.is_too_many_match());
        assert!(no_match.is_no_match());
        assert_ne!(too_many.0, no_match.0);
    }

    #[test]
    fn neighbor_flag_round_trips_through_with_neighbor_flag() {
        let pos = ReferencePosition::new(3, 7, false);
        let flagged = pos.with_neighbor_flag(true);
        assert!(flagged.has_neighbors());
        assert_eq!(flagged.contig_id(), 3);
        assert_eq!(flagged.offset(), 7);
    }

    fn sample_contig(name: &str, idx: u32, karyotype: u32) -> ContigSummary {
        ContigSummary {
            index: idx,
            karyotype_index: karyotype,
            name: name.to_string(),
            metadata: ContigMetadata {
                file_offset: 0,
                size: 100,
                acgt_count: 100,
                bam_sq_as: None,
                bam_sq_ur: None,
                bam_sq_m5: None,
            },
        }
    }

    #[test]
    fn karyotype_permutation_validated() {
        let ok = vec![sample_contig("chr1", 0, 1), sample_contig("chr2", 1, 0)];
        assert!(validate_karyotype_permutation(&ok).is_ok());
        let bad = vec![sample_contig("chr1", 0, 0), sample_contig("chr2", 1, 0)];
        assert!(validate_karyotype_permutation(&bad).is_err());
    }

    #[test]
    fn merge_requires_matching_contig_lists() {
        let a = ReferenceMetadata {
            format_version: CURRENT_REFERENCE_FORMAT_VERSION,
            contigs: vec![sample_contig("chr1", 0, 0)],
            mask_files: vec![],
        };
        let mut b = a.clone();
        b.contigs = vec![sample_contig("chrX", 0, 0)];
        assert!(a.merge(&b).is_err());
        assert!(a.merge(&a).is_ok());
    }

    #[test]
    fn mask_file_roundtrip_and_sort_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask-4-0.dat");
        let records = vec![
            MaskRecord { kmer: 1, position: ReferencePosition::new(0, 0, false) },
            MaskRecord { kmer: 5, position: ReferencePosition::new(0, 10, false) },
            MaskRecord { kmer: 9, position: ReferencePosition::too_many_match() },
        ];
        write_mask_file(&path, &records).unwrap();
        let read_back = read_mask_file(&path).unwrap();
        assert_eq!(read_back.len(), 3);
        assert_eq!(read_back[0].kmer, 1);
        assert!(read_back[2].position.is_too_many_match());
    }

    #[test]
    fn unsorted_mask_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask-4-1.dat");
        let records = vec![
            MaskRecord { kmer: 9, position: ReferencePosition::new(0, 0, false) },
            MaskRecord { kmer: 1, position: ReferencePosition::new(0, 10, false) },
        ];
        write_mask_file(&path, &records).unwrap();
        assert!(read_mask_file(&path).is_err());
    }
}
