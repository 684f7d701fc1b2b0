//! CIGAR arena buffer (spec §9 "Cyclic ownership"): fragments reference a
//! shared CIGAR byte buffer by `(offset, length)` rather than owning their
//! own `Vec`, avoiding self-referential lifetimes in the template builder.

/// One CIGAR operation, matching the BAM convention named in spec §6:
/// low 4 bits carry the op, high 28 bits carry the run length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CigarOp {
    Match,
    Insertion,
    Deletion,
    Skip,
    SoftClip,
    HardClip,
}

impl CigarOp {
    fn code(self) -> u32 {
        match self {
            CigarOp::Match => 0,
            CigarOp::Insertion => 1,
            CigarOp::Deletion => 2,
            CigarOp::Skip => 3,
            CigarOp::SoftClip => 4,
            CigarOp::HardClip => 5,
        }
    }

    fn from_code(code: u32) -> CigarOp {
        match code {
            0 => CigarOp::Match,
            1 => CigarOp::Insertion,
            2 => CigarOp::Deletion,
            3 => CigarOp::Skip,
            4 => CigarOp::SoftClip,
            5 => CigarOp::HardClip,
            _ => panic!("unrecognized CIGAR op code {}", code),
        }
    }

    pub fn letter(self) -> char {
        match self {
            CigarOp::Match => 'M',
            CigarOp::Insertion => 'I',
            CigarOp::Deletion => 'D',
            CigarOp::Skip => 'N',
            CigarOp::SoftClip => 'S',
            CigarOp::HardClip => 'H',
        }
    }
}

fn pack(op: CigarOp, length: u32) -> u32 {
    crate::error::invariant!(length < (1 << 28), "CIGAR run length {} overflows 28 bits", length);
    (length << 4) | op.code()
}

fn unpack(word: u32) -> (CigarOp, u32) {
    (CigarOp::from_code(word & 0xF), word >> 4)
}

/// `(offset, length)` into the arena's flat `u32` buffer — what a
/// fragment record actually carries (spec §3 "Fragment metadata").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CigarSlice {
    pub offset: u32,
    pub length: u32,
}

/// The shared CIGAR buffer owned by one template builder pass; cleared
/// and reused between clusters.
#[derive(Clone, Debug, Default)]
pub struct CigarArena {
    words: Vec<u32>,
}

impl CigarArena {
    pub fn new() -> CigarArena {
        CigarArena { words: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Appends one fragment's CIGAR operations, returning the slice to
    /// reference them by.
    pub fn push(&mut self, ops: &[(CigarOp, u32)]) -> CigarSlice {
        let offset = self.words.len() as u32;
        for &(op, length) in ops {
            self.words.push(pack(op, length));
        }
        CigarSlice { offset, length: ops.len() as u32 }
    }

    pub fn ops(&self, slice: CigarSlice) -> impl Iterator<Item = (CigarOp, u32)> + '_ {
        let start = slice.offset as usize;
        let end = start + slice.length as usize;
        self.words[start..end].iter().map(|&w| unpack(w))
    }

    /// Serializes a slice to the little-endian byte layout spec §6 names:
    /// 4 bytes per op, op in the low 4 bits, length in the high 28.
    pub fn to_bytes(&self, slice: CigarSlice) -> Vec<u8> {
        let start = slice.offset as usize;
        let end = start + slice.length as usize;
        self.words[start..end].iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn reference_length(&self, slice: CigarSlice) -> u32 {
        self.ops(slice)
            .filter(|(op, _)| matches!(op, CigarOp::Match | CigarOp::Deletion | CigarOp::Skip))
            .map(|(_, len)| len)
            .sum()
    }

    pub fn to_string(&self, slice: CigarSlice) -> String {
        self.ops(slice).map(|(op, len)| format!("{}{}", len, op.letter())).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_and_read_back_ops() {
        let mut arena = CigarArena::new();
        let slice = arena.push(&[(CigarOp::Match, 32)]);
        let ops: Vec<_> = arena.ops(slice).collect();
        assert_eq!(ops, vec![(CigarOp::Match, 32)]);
        assert_eq!(arena.to_string(slice), "32M");
    }

    #[test]
    fn multiple_fragments_share_one_arena() {
        let mut arena = CigarArena::new();
        let a = arena.push(&[(CigarOp::Match, 27), (CigarOp::SoftClip, 5)]);
        let b = arena.push(&[(CigarOp::Match, 100)]);
        assert_eq!(arena.to_string(a), "27M5S");
        assert_eq!(arena.to_string(b), "100M");
    }

    #[test]
    fn reference_length_excludes_soft_clip_and_insertion() {
        let mut arena = CigarArena::new();
        let slice = arena.push(&[
            (CigarOp::SoftClip, 5),
            (CigarOp::Match, 20),
            (CigarOp::Insertion, 2),
            (CigarOp::Match, 5),
            (CigarOp::Deletion, 3),
        ]);
        assert_eq!(arena.reference_length(slice), 20 + 5 + 3);
    }

    #[test]
    fn clear_reuses_the_buffer() {
        let mut arena = CigarArena::new();
        arena.push(&[(CigarOp::Match, 10)]);
        arena.clear();
        let slice = arena.push(&[(CigarOp::Match, 1)]);
        assert_eq!(slice.offset, 0);
    }

    #[test]
    fn byte_layout_is_little_endian() {
        let mut arena = CigarArena::new();
        let slice = arena.push(&[(CigarOp::Match, 32)]);
        let bytes = arena.to_bytes(slice);
        assert_eq!(bytes.len(), 4);
        let word = u32::from_le_bytes(bytes.try_into().unwrap());
        assert_eq!(word, (32 << 4) | 0);
    }
}
