//! 2-bit base encoding, the k-mer value type, and the six quarter-block
//! permutations used by the match finder (spec §4.1).

use serde::{Deserialize, Serialize};

/// A 2-bit encoded base, plus an explicit validity flag: `N` (and any other
/// non-ACGT byte) encodes as invalid so seeds containing it sort last and
/// never match (spec §3 "Base / quality").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub code: u8,
    pub valid: bool,
}

pub const BASE_A: u8 = 0b00;
pub const BASE_C: u8 = 0b01;
pub const BASE_G: u8 = 0b10;
pub const BASE_T: u8 = 0b11;

impl Base {
    pub fn encode(b: u8) -> Base {
        match b {
            b'A' | b'a' => Base { code: BASE_A, valid: true },
            b'C' | b'c' => Base { code: BASE_C, valid: true },
            b'G' | b'g' => Base { code: BASE_G, valid: true },
            b'T' | b't' => Base { code: BASE_T, valid: true },
            _ => Base { code: 0, valid: false },
        }
    }

    pub fn decode(self) -> u8 {
        if !self.valid {
            return b'N';
        }
        match self.code {
            BASE_A => b'A',
            BASE_C => b'C',
            BASE_G => b'G',
            BASE_T => b'T',
            _ => b'N',
        }
    }

    pub fn complement(self) -> Base {
        Base { code: self.code ^ BASE_T, valid: self.valid }
    }
}

/// k-mer width in bases; only these three are supported (spec §3 "Kmer").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmerWidth {
    K16,
    K32,
    K64,
}

impl KmerWidth {
    pub fn bases(self) -> u32 {
        match self {
            KmerWidth::K16 => 16,
            KmerWidth::K32 => 32,
            KmerWidth::K64 => 64,
        }
    }

    /// Number of bits occupied by the k-mer value (2 bits/base). `K64`
    /// needs 128 bits, which is why `KmerValue` is `u128` rather than `u64`.
    pub fn bits(self) -> u32 {
        self.bases() * 2
    }
}

/// An unsigned k-mer value; big-endian in base order, so lexicographic sort
/// on the integer matches sort on the base string (spec §3 "Kmer"). Sized
/// to fit the widest supported k-mer, `K64` (64 bases * 2 bits = 128 bits).
pub type KmerValue = u128;

/// Encodes a base slice into a big-endian-in-base-order k-mer value.
/// Returns `None` if the slice contains an invalid base (`N`) or doesn't
/// exactly fill `width`.
pub fn encode_kmer(bases: &[u8], width: KmerWidth) -> Option<KmerValue> {
    let n = width.bases() as usize;
    if bases.len() != n {
        return None;
    }
    let mut value: KmerValue = 0;
    for &b in bases {
        let base = Base::encode(b);
        if !base.valid {
            return None;
        }
        value = (value << 2) | base.code as KmerValue;
    }
    Some(value)
}

/// Decodes a k-mer value back into its base string.
pub fn decode_kmer(value: KmerValue, width: KmerWidth) -> Vec<u8> {
    let n = width.bases() as usize;
    let mut out = vec![0u8; n];
    let mut v = value;
    for i in (0..n).rev() {
        let code = (v & 0b11) as u8;
        out[i] = Base { code, valid: true }.decode();
        v >>= 2;
    }
    out
}

/// Reverse-complements a k-mer value of the given width.
pub fn reverse_complement(value: KmerValue, width: KmerWidth) -> KmerValue {
    let n = width.bases();
    let mut v = value;
    let mut rc: KmerValue = 0;
    for _ in 0..n {
        let code = (v & 0b11) as KmerValue;
        let comp = code ^ 0b11;
        rc = (rc << 2) | comp;
        v >>= 2;
    }
    rc
}

/// One of the six permutations used to cover every 2-mismatch pattern with
/// a small number of exact-prefix joins (spec §4.1, §4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Permutation {
    Abcd,
    Bcda,
    Cdab,
    Acbd,
    Bdac,
    Adbc,
}

pub const ALL_PERMUTATIONS: [Permutation; 6] = [
    Permutation::Abcd,
    Permutation::Bcda,
    Permutation::Cdab,
    Permutation::Acbd,
    Permutation::Bdac,
    Permutation::Adbc,
];

/// Quarter index (0=A, 1=B, 2=C, 3=D) of a k-mer split into 4 equal blocks.
pub(crate) fn quarters(value: KmerValue, width: KmerWidth) -> [KmerValue; 4] {
    let n = width.bases();
    let q = n / 4;
    let bits = q * 2;
    let mask = if bits >= 128 { KmerValue::MAX } else { ((1 as KmerValue) << bits) - 1 };
    let d = value & mask;
    let c = (value >> bits) & mask;
    let b = (value >> (2 * bits)) & mask;
    let a = (value >> (3 * bits)) & mask;
    [a, b, c, d]
}

fn from_quarters(parts: [KmerValue; 4], width: KmerWidth) -> KmerValue {
    let n = width.bases();
    let q = n / 4;
    let bits = q * 2;
    let [a, b, c, d] = parts;
    (a << (3 * bits)) | (b << (2 * bits)) | (c << bits) | d
}

impl Permutation {
    /// Rearranges the four quarter-blocks of `value` according to this
    /// permutation's name (`ABCD`, `BCDA`, ...).
    pub fn apply(self, value: KmerValue, width: KmerWidth) -> KmerValue {
        let [a, b, c, d] = quarters(value, width);
        let rearranged = match self {
            Permutation::Abcd => [a, b, c, d],
            Permutation::Bcda => [b, c, d, a],
            Permutation::Cdab => [c, d, a, b],
            Permutation::Acbd => [a, c, b, d],
            Permutation::Bdac => [b, d, a, c],
            Permutation::Adbc => [a, d, b, c],
        };
        from_quarters(rearranged, width)
    }

    /// Restores the original base order after a permutated lookup; the
    /// inverse of `apply`.
    pub fn reorder(self, value: KmerValue, width: KmerWidth) -> KmerValue {
        let parts = quarters(value, width);
        let restored = match self {
            Permutation::Abcd => {
                let [a, b, c, d] = parts;
                [a, b, c, d]
            }
            Permutation::Bcda => {
                // parts are [b, c, d, a] under forward naming -> invert
                let [b, c, d, a] = parts;
                [a, b, c, d]
            }
            Permutation::Cdab => {
                let [c, d, a, b] = parts;
                [a, b, c, d]
            }
            Permutation::Acbd => {
                let [a, c, b, d] = parts;
                [a, b, c, d]
            }
            Permutation::Bdac => {
                let [b, d, a, c] = parts;
                [a, b, c, d]
            }
            Permutation::Adbc => {
                let [a, d, b, c] = parts;
                [a, b, c, d]
            }
        };
        from_quarters(restored, width)
    }

    pub fn name(self) -> &'static str {
        match self {
            Permutation::Abcd => "ABCD",
            Permutation::Bcda => "BCDA",
            Permutation::Cdab => "CDAB",
            Permutation::Acbd => "ACBD",
            Permutation::Bdac => "BDAC",
            Permutation::Adbc => "ADBC",
        }
    }
}
