//! Thread-local and tile-level counters (spec §4.9 "fold thread-local
//! stats into tile stats", spec §8 property 5: folding must equal serial
//! accumulation). `Stats` forms a commutative monoid under `combine` so
//! the selector can fold per-thread results in any order.

use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BarcodeStats {
    pub clusters_seen: u64,
    pub clusters_aligned: u64,
    pub clusters_unaligned: u64,
    pub pairs_proper: u64,
    pub pairs_improper: u64,
    pub gapped_alignments: u64,
    pub semialigned_alignments: u64,
    pub adapter_clipped: u64,
    pub mismatch_total: u64,
}

impl BarcodeStats {
    pub fn combine(&self, other: &BarcodeStats) -> BarcodeStats {
        BarcodeStats {
            clusters_seen: self.clusters_seen + other.clusters_seen,
            clusters_aligned: self.clusters_aligned + other.clusters_aligned,
            clusters_unaligned: self.clusters_unaligned + other.clusters_unaligned,
            pairs_proper: self.pairs_proper + other.pairs_proper,
            pairs_improper: self.pairs_improper + other.pairs_improper,
            gapped_alignments: self.gapped_alignments + other.gapped_alignments,
            semialigned_alignments: self.semialigned_alignments + other.semialigned_alignments,
            adapter_clipped: self.adapter_clipped + other.adapter_clipped,
            mismatch_total: self.mismatch_total + other.mismatch_total,
        }
    }
}

/// Per-tile stats: one `BarcodeStats` per barcode index, combined with the
/// same associative operator (spec §5 "tile statistics are fold-combined
/// with an associative operator").
#[derive(Clone, Debug, Default)]
pub struct TileStats {
    pub by_barcode: BTreeMap<u32, BarcodeStats>,
}

impl TileStats {
    pub fn new() -> TileStats {
        TileStats::default()
    }

    pub fn record(&mut self, barcode: u32, delta: &BarcodeStats) {
        let entry = self.by_barcode.entry(barcode).or_default();
        *entry = entry.combine(delta);
    }

    pub fn combine(&self, other: &TileStats) -> TileStats {
        let mut merged = self.clone();
        for (barcode, stats) in &other.by_barcode {
            let entry = merged.by_barcode.entry(*barcode).or_default();
            *entry = entry.combine(stats);
        }
        merged
    }

    /// Folds a set of per-thread tile stats with `combine`; the result is
    /// independent of fold order (spec §8 property 5).
    pub fn fold(parts: &[TileStats]) -> TileStats {
        parts.iter().fold(TileStats::new(), |acc, part| acc.combine(part))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(clusters_seen: u64, clusters_aligned: u64) -> BarcodeStats {
        BarcodeStats { clusters_seen, clusters_aligned, ..Default::default() }
    }

    #[test]
    fn combine_is_commutative() {
        let a = sample(10, 5);
        let b = sample(3, 2);
        assert_eq!(a.combine(&b), b.combine(&a));
    }

    #[test]
    fn fold_matches_serial_accumulation_regardless_of_order() {
        let mut t1 = TileStats::new();
        t1.record(0, &sample(10, 5));
        t1.record(1, &sample(1, 1));

        let mut t2 = TileStats::new();
        t2.record(0, &sample(20, 15));

        let mut t3 = TileStats::new();
        t3.record(1, &sample(4, 4));

        let forward = TileStats::fold(&[t1.clone(), t2.clone(), t3.clone()]);
        let backward = TileStats::fold(&[t3, t2, t1]);

        assert_eq!(forward.by_barcode.get(&0), backward.by_barcode.get(&0));
        assert_eq!(forward.by_barcode.get(&1), backward.by_barcode.get(&1));
        assert_eq!(forward.by_barcode[&0].clusters_seen, 30);
        assert_eq!(forward.by_barcode[&1].clusters_seen, 5);
    }

    #[test]
    fn record_accumulates_into_existing_barcode() {
        let mut stats = TileStats::new();
        stats.record(0, &sample(1, 1));
        stats.record(0, &sample(2, 2));
        assert_eq!(stats.by_barcode[&0].clusters_seen, 3);
    }
}
