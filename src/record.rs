//! On-disk fragment record layout (spec §6 "Output — bin files"). Every
//! field is little-endian; the header is followed by `read_length` bytes
//! of packed base+quality and `4 * cigar_length` bytes of CIGAR.

use crate::error::{OligoError, OligoResult};

pub const RECORD_MAGIC: u32 = 0x4F4C_4947; // "OLIG"

/// Small hand-rolled bitflags macro: the teacher's dependency set has no
/// `bitflags` crate, and a newtype-over-u8 is the idiomatic minimal stand-in.
macro_rules! bitflags_like {
    (pub struct $name:ident: $repr:ty { $(const $variant:ident = $value:expr;)* }) => {
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        pub struct $name(pub $repr);
        impl $name {
            $(pub const $variant: $name = $name($value);)*
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
            pub fn set(&mut self, other: $name, value: bool) {
                if value {
                    self.0 |= other.0;
                } else {
                    self.0 &= !other.0;
                }
            }
        }
        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    pub struct FragmentFlags: u8 {
        const PAIRED = 0b0000_0001;
        const REVERSE = 0b0000_0010;
        const UNMAPPED = 0b0000_0100;
        const SECOND_READ = 0b0000_1000;
        const PROPER_PAIR = 0b0001_0000;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FragmentHeader {
    pub f_strand_position: u64,
    pub flags: FragmentFlags,
    pub barcode: u32,
    pub cluster: u32,
    pub tile: u32,
    pub cigar_length: u32,
    pub read_length: u32,
    pub mate_f_strand_position: u64,
    pub mate_storage_bin: u32,
    pub total_length: u32,
    pub gap_count: u32,
}

impl FragmentHeader {
    pub const ENCODED_LEN: usize = 4 + 8 + 1 + 4 + 4 + 4 + 4 + 4 + 8 + 4 + 4 + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.f_strand_position.to_le_bytes());
        out.push(self.flags.0);
        out.extend_from_slice(&self.barcode.to_le_bytes());
        out.extend_from_slice(&self.cluster.to_le_bytes());
        out.extend_from_slice(&self.tile.to_le_bytes());
        out.extend_from_slice(&self.cigar_length.to_le_bytes());
        out.extend_from_slice(&self.read_length.to_le_bytes());
        out.extend_from_slice(&self.mate_f_strand_position.to_le_bytes());
        out.extend_from_slice(&self.mate_storage_bin.to_le_bytes());
        out.extend_from_slice(&self.total_length.to_le_bytes());
        out.extend_from_slice(&self.gap_count.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> OligoResult<FragmentHeader> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(OligoError::Format("fragment header truncated".to_string()));
        }
        let mut pos = 0;
        let mut take = |n: usize| {
            let slice = &bytes[pos..pos + n];
            pos += n;
            slice
        };
        let magic = u32::from_le_bytes(take(4).try_into().unwrap());
        if magic != RECORD_MAGIC {
            return Err(OligoError::Format(format!("bad fragment record magic {:#x}", magic)));
        }
        let f_strand_position = u64::from_le_bytes(take(8).try_into().unwrap());
        let flags = FragmentFlags(take(1)[0]);
        let barcode = u32::from_le_bytes(take(4).try_into().unwrap());
        let cluster = u32::from_le_bytes(take(4).try_into().unwrap());
        let tile = u32::from_le_bytes(take(4).try_into().unwrap());
        let cigar_length = u32::from_le_bytes(take(4).try_into().unwrap());
        let read_length = u32::from_le_bytes(take(4).try_into().unwrap());
        let mate_f_strand_position = u64::from_le_bytes(take(8).try_into().unwrap());
        let mate_storage_bin = u32::from_le_bytes(take(4).try_into().unwrap());
        let total_length = u32::from_le_bytes(take(4).try_into().unwrap());
        let gap_count = u32::from_le_bytes(take(4).try_into().unwrap());

        Ok(FragmentHeader {
            f_strand_position,
            flags,
            barcode,
            cluster,
            tile,
            cigar_length,
            read_length,
            mate_f_strand_position,
            mate_storage_bin,
            total_length,
            gap_count,
        })
    }
}

/// A full serialized record: header + packed bases + CIGAR bytes. Per
/// spec §4.10 invariant: `header.total_length == record bytes written`.
pub fn encode_record(header: &FragmentHeader, packed_calls: &[u8], cigar_bytes: &[u8]) -> OligoResult<Vec<u8>> {
    if packed_calls.len() as u32 != header.read_length {
        return Err(OligoError::Format("read_length does not match packed call bytes".to_string()));
    }
    if cigar_bytes.len() as u32 != header.cigar_length * 4 {
        return Err(OligoError::Format("cigar_length does not match CIGAR byte count".to_string()));
    }
    let mut out = header.to_bytes();
    out.extend_from_slice(packed_calls);
    out.extend_from_slice(cigar_bytes);
    if out.len() as u32 != header.total_length {
        return Err(OligoError::Format(format!(
            "fragment record total_length {} does not match {} bytes actually written",
            header.total_length,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header(read_length: u32, cigar_length: u32) -> FragmentHeader {
        let mut flags = FragmentFlags::default();
        flags.set(FragmentFlags::PAIRED, true);
        FragmentHeader {
            f_strand_position: 12345,
            flags,
            barcode: 1,
            cluster: 2,
            tile: 3,
            cigar_length,
            read_length,
            mate_f_strand_position: 67890,
            mate_storage_bin: 4,
            total_length: FragmentHeader::ENCODED_LEN as u32 + read_length + cigar_length * 4,
            gap_count: 0,
        }
    }

    #[test]
    fn header_roundtrips_through_bytes() {
        let header = sample_header(32, 1);
        let bytes = header.to_bytes();
        let parsed = FragmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.f_strand_position, header.f_strand_position);
        assert_eq!(parsed.barcode, header.barcode);
        assert!(parsed.flags.contains(FragmentFlags::PAIRED));
    }

    #[test]
    fn from_bytes_rejects_bad_magic() {
        let mut bytes = sample_header(32, 1).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(FragmentHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn encode_record_validates_total_length() {
        let header = sample_header(4, 1);
        let calls = vec![0u8; 4];
        let cigar = vec![0u8; 4];
        assert!(encode_record(&header, &calls, &cigar).is_ok());

        let mut bad_header = header;
        bad_header.total_length += 1;
        assert!(encode_record(&bad_header, &calls, &cigar).is_err());
    }

    #[test]
    fn encode_record_validates_call_length() {
        let header = sample_header(4, 0);
        let calls = vec![0u8; 3];
        assert!(encode_record(&header, &calls, &[]).is_err());
    }
}
